//! Background task that drains the outbox when something suggests delivery
//! might now succeed.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::Outbox;

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  /// Worker started; replays whatever a previous session left behind
  Startup,
  /// Connectivity restored
  Online,
  /// The client came back to the foreground
  Visible,
  /// Caller asked for a flush
  Manual,
  /// Retry after backoff. Sent by callers, it schedules the retry; the
  /// worker's own timer firing is what drains.
  Retry,
}

/// Exponential backoff between automatic retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub base: Duration,
  pub max: Duration,
}

impl RetryPolicy {
  /// Delay before the next retry of an item that has failed `attempts` times.
  pub fn delay(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    self.base.saturating_mul(1 << exponent).min(self.max)
  }
}

/// Handle to the drain task.
pub struct OutboxWorker {
  tx: mpsc::UnboundedSender<DrainTrigger>,
  handle: JoinHandle<()>,
}

impl OutboxWorker {
  /// Spawn the worker. It drains once right away.
  pub fn spawn(outbox: Outbox, policy: RetryPolicy) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = tx.send(DrainTrigger::Startup);

    let handle = tokio::spawn(async move {
      let mut retry_at: Option<Instant> = None;

      loop {
        let trigger = tokio::select! {
          received = rx.recv() => match received {
            Some(DrainTrigger::Retry) => {
              if retry_at.is_none() {
                let attempts = outbox.items().first().map_or(0, |i| i.attempts);
                let delay = policy.delay(attempts);
                debug!(retry_in_ms = delay.as_millis() as u64, "Scheduling outbox retry");
                retry_at = Some(Instant::now() + delay);
              }
              continue;
            }
            Some(trigger) => trigger,
            None => break,
          },
          _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
            DrainTrigger::Retry
          }
        };
        retry_at = None;

        if outbox.is_empty() {
          continue;
        }

        debug!(?trigger, pending = outbox.len(), "Draining outbox");
        let Some(report) = outbox.drain().await else {
          continue;
        };

        if report.failed.is_some() {
          let attempts = outbox.items().first().map(|i| i.attempts).unwrap_or(1);
          let delay = policy.delay(attempts);
          warn!(
            remaining = report.remaining,
            retry_in_ms = delay.as_millis() as u64,
            "Outbox drain interrupted, scheduling retry"
          );
          retry_at = Some(Instant::now() + delay);
        }
      }

      debug!("Outbox worker stopped");
    });

    Self { tx, handle }
  }

  /// Request a drain. Triggers arriving during a drain queue up behind it.
  ///
  /// `DrainTrigger::Retry` only arms the backoff timer, unless one is armed
  /// already.
  pub fn trigger(&self, trigger: DrainTrigger) {
    if self.tx.send(trigger).is_err() {
      warn!(?trigger, "Outbox worker is not running");
    }
  }

  /// Stop the worker after it finishes any drain in progress.
  pub async fn shutdown(self) {
    drop(self.tx);
    if let Err(e) = self.handle.await {
      warn!(error = %e, "Outbox worker ended abnormally");
    }
  }
}
