//! Rate-limited "data changed" notifications.
//!
//! Mutation paths call `notify` with a reason; bursts of notifications within
//! the minimum dispatch interval coalesce into one `DataUpdate` carrying the
//! union of reasons. Each flush is broadcast to in-process subscribers and its
//! timestamp is persisted, so other processes sharing the store can pick it up
//! via `watch_remote`.

mod subscription;

pub use subscription::Subscription;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::store::DurableStore;

/// Store key holding the timestamp of the most recent flush.
pub const FLUSH_KEY: &str = "bus:last-flush";

const CHANNEL_CAPACITY: usize = 64;

/// Where an update was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
  /// Flushed by this process
  Local,
  /// Observed through the shared store, flushed by another process
  Remote,
}

/// A coalesced batch of change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUpdate {
  /// Flush time in epoch milliseconds
  pub at_ms: i64,
  /// Reasons accumulated since the previous flush, sorted; empty for remote updates
  pub reasons: Vec<String>,
  pub origin: UpdateOrigin,
}

#[derive(Default)]
struct BusState {
  pending: BTreeSet<String>,
  last_flush: Option<Instant>,
  /// Timestamp persisted by our own last flush, to tell it apart from remote ones
  last_flush_ms: Option<i64>,
  timer: Option<JoinHandle<()>>,
  /// Bumped whenever a timer is scheduled or cancelled; a timer whose
  /// generation no longer matches woke up stale and must not flush
  timer_generation: u64,
  watcher: Option<JoinHandle<()>>,
}

struct BusShared {
  store: DurableStore,
  min_interval: Duration,
  sender: broadcast::Sender<DataUpdate>,
  state: Mutex<BusState>,
}

/// Update bus handle. Cheap to clone; all clones share one pending set.
///
/// Scheduling spawns tokio tasks, so `notify` must be called from within a
/// runtime.
#[derive(Clone)]
pub struct UpdateBus {
  shared: Arc<BusShared>,
}

impl UpdateBus {
  pub fn new(store: DurableStore, min_interval: Duration) -> Self {
    let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      shared: Arc::new(BusShared {
        store,
        min_interval,
        sender,
        state: Mutex::new(BusState::default()),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, BusState> {
    // Bus state stays consistent even if a holder panicked mid-update
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Subscribe to flushed updates.
  pub fn subscribe(&self) -> Subscription {
    Subscription::new(self.shared.sender.subscribe())
  }

  /// Record a change and schedule a flush if none is pending.
  pub fn notify(&self, reason: impl Into<String>) {
    let reason = reason.into();
    let mut state = self.state();
    trace!(reason = %reason, "Update notification");
    state.pending.insert(reason);

    if state.timer.is_some() {
      return;
    }
    self.schedule_locked(&mut state);
  }

  /// Time left before another flush is allowed.
  fn remaining_interval(&self, state: &BusState) -> Duration {
    state
      .last_flush
      .map(|at| self.shared.min_interval.saturating_sub(at.elapsed()))
      .unwrap_or(Duration::ZERO)
  }

  fn schedule_locked(&self, state: &mut BusState) {
    let delay = self.remaining_interval(state);
    state.timer_generation += 1;
    let generation = state.timer_generation;

    let bus = self.clone();
    state.timer = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      bus.flush_scheduled(generation);
    }));
  }

  fn cancel_timer(state: &mut BusState) {
    state.timer_generation += 1;
    if let Some(timer) = state.timer.take() {
      timer.abort();
    }
  }

  /// Record a change and flush right away, cancelling any scheduled flush.
  pub fn notify_immediate(&self, reason: impl Into<String>) -> Option<DataUpdate> {
    let mut state = self.state();
    state.pending.insert(reason.into());
    Self::cancel_timer(&mut state);
    self.flush_locked(state)
  }

  /// Flush pending reasons now. Returns `None` when nothing was pending.
  pub fn flush(&self) -> Option<DataUpdate> {
    let mut state = self.state();
    Self::cancel_timer(&mut state);
    self.flush_locked(state)
  }

  /// Number of reasons waiting for the next flush.
  pub fn pending_len(&self) -> usize {
    self.state().pending.len()
  }

  fn flush_scheduled(&self, generation: u64) {
    let mut state = self.state();
    if state.timer_generation != generation {
      trace!(generation, "Ignoring stale flush timer");
      return;
    }
    // Generation matches, so the stored handle is this task's own
    state.timer = None;

    if !state.pending.is_empty() && !self.remaining_interval(&state).is_zero() {
      self.schedule_locked(&mut state);
      return;
    }
    self.flush_locked(state);
  }

  fn flush_locked(&self, mut state: MutexGuard<'_, BusState>) -> Option<DataUpdate> {
    if state.pending.is_empty() {
      return None;
    }

    let reasons: Vec<String> = std::mem::take(&mut state.pending).into_iter().collect();
    let at_ms = self.shared.store.now_ms();
    state.last_flush = Some(Instant::now());
    state.last_flush_ms = Some(at_ms);
    drop(state);

    self.shared.store.write(FLUSH_KEY, &at_ms, None);

    let update = DataUpdate {
      at_ms,
      reasons,
      origin: UpdateOrigin::Local,
    };
    debug!(at_ms, reasons = ?update.reasons, "Flushing data update");

    // No subscribers is fine
    let _ = self.shared.sender.send(update.clone());
    Some(update)
  }

  /// Poll the shared store for flushes made by other processes.
  ///
  /// Replaces any previously started watcher.
  pub fn watch_remote(&self, poll_interval: Duration) {
    let bus = self.clone();
    let mut last_seen: Option<i64> = self.shared.store.read(FLUSH_KEY);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(poll_interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;

        let stored: Option<i64> = bus.shared.store.read(FLUSH_KEY);
        if stored == last_seen {
          continue;
        }
        last_seen = stored;

        let Some(at_ms) = stored else { continue };
        if bus.state().last_flush_ms == Some(at_ms) {
          continue;
        }

        debug!(at_ms, "Observed remote data update");
        let _ = bus.shared.sender.send(DataUpdate {
          at_ms,
          reasons: Vec::new(),
          origin: UpdateOrigin::Remote,
        });
      }
    });

    if let Some(previous) = self.state().watcher.replace(handle) {
      previous.abort();
    }
  }

  /// Stop background tasks and flush whatever is still pending.
  pub fn shutdown(&self) -> Option<DataUpdate> {
    if let Some(watcher) = self.state().watcher.take() {
      watcher.abort();
    }
    self.flush()
  }
}
