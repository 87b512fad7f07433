//! Durable queue of mutations awaiting delivery.
//!
//! Mutations that fail recoverably are enqueued here and replayed later with
//! their original idempotency key, so the server sees every replay as the same
//! logical operation. Items are keyed by a logical `dedupe_key`: enqueuing a
//! key that is already queued replaces the older intent in place.
//!
//! Item lifecycle: queued -> replaying -> delivered (removed), back to queued
//! with `attempts + 1` on a recoverable failure, or abandoned (removed and
//! reported) on a fatal one.

mod item;
mod reporter;
mod worker;

pub use item::{NewOutboxItem, OutboxItem};
pub use reporter::{AbandonReporter, TracingReporter};
pub use worker::{DrainTrigger, OutboxWorker, RetryPolicy};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::http::{new_idempotency_key, RequestClient, RequestError};
use crate::store::DurableStore;

/// Store key holding the serialized queue.
pub const QUEUE_KEY: &str = "outbox:queue";

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Ids of items delivered, in replay order
  pub delivered: Vec<String>,
  /// Ids of items removed without delivery
  pub abandoned: Vec<String>,
  /// Id of the item whose recoverable failure ended the pass
  pub failed: Option<String>,
  /// Items still queued after the pass
  pub remaining: usize,
}

struct OutboxInner {
  store: DurableStore,
  client: RequestClient,
  reporter: Arc<dyn AbandonReporter>,
  max_attempts: Option<u32>,
  /// Serializes read-modify-write cycles on the stored queue
  lock: Mutex<()>,
  draining: AtomicBool,
}

/// Clears the drain-in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Outbox handle. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Outbox {
  inner: Arc<OutboxInner>,
}

impl Outbox {
  /// Create an outbox over the queue persisted in `store`.
  ///
  /// The stored queue is the only copy: every operation re-reads it, so
  /// other processes sharing the store see each other's items.
  pub fn load(
    store: DurableStore,
    client: RequestClient,
    reporter: Arc<dyn AbandonReporter>,
    max_attempts: Option<u32>,
  ) -> Self {
    let outbox = Self {
      inner: Arc::new(OutboxInner {
        store,
        client,
        reporter,
        max_attempts,
        lock: Mutex::new(()),
        draining: AtomicBool::new(false),
      }),
    };

    let restored = outbox.len();
    if restored > 0 {
      info!(count = restored, "Restored queued mutations");
    }
    outbox
  }

  fn read_queue(&self) -> Vec<OutboxItem> {
    self.inner.store.read_or(QUEUE_KEY, Vec::new())
  }

  /// Apply `f` to the freshly read queue and persist the result when `f`
  /// returns `Some`.
  fn update<R>(&self, f: impl FnOnce(&mut Vec<OutboxItem>) -> Option<R>) -> Option<R> {
    let _lock = self
      .inner
      .lock
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut items = self.read_queue();
    let result = f(&mut items)?;
    self.inner.store.write(QUEUE_KEY, &items, None);
    Some(result)
  }

  /// Queue a mutation.
  ///
  /// An item already queued under the same `dedupe_key` is replaced in place,
  /// keeping its position so older intents are not starved.
  pub fn enqueue(&self, new: NewOutboxItem) -> OutboxItem {
    let item = OutboxItem {
      id: uuid::Uuid::new_v4().to_string(),
      title: new.title,
      method: new.method,
      path: new.path,
      body: new.body,
      dedupe_key: new.dedupe_key,
      idempotency_key: new.idempotency_key.unwrap_or_else(new_idempotency_key),
      enqueued_at: self.inner.store.now_ms(),
      attempts: 0,
      last_error: None,
    };

    self.update(|items| {
      match items.iter_mut().find(|i| i.dedupe_key == item.dedupe_key) {
        Some(existing) => {
          debug!(dedupe_key = %item.dedupe_key, replaced = %existing.id, "Replacing queued mutation");
          *existing = item.clone();
        }
        None => {
          debug!(dedupe_key = %item.dedupe_key, "Queueing mutation");
          items.push(item.clone());
        }
      }
      Some(())
    });
    item
  }

  /// Snapshot of the queue in replay order.
  pub fn items(&self) -> Vec<OutboxItem> {
    self.read_queue()
  }

  pub fn len(&self) -> usize {
    self.read_queue().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether a mutation for `dedupe_key` is waiting.
  pub fn contains_key(&self, dedupe_key: &str) -> bool {
    self.read_queue().iter().any(|i| i.dedupe_key == dedupe_key)
  }

  /// Remove an item without delivering it.
  pub fn discard(&self, id: &str) -> Option<OutboxItem> {
    let removed = self.remove_by_id(id);
    if let Some(item) = &removed {
      info!(id, title = %item.title, "Discarded queued mutation");
    }
    removed
  }

  /// Drop every queued item.
  pub fn clear(&self) {
    let _lock = self
      .inner
      .lock
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    self.inner.store.remove(QUEUE_KEY);
  }

  fn remove_by_id(&self, id: &str) -> Option<OutboxItem> {
    self.update(|items| {
      let index = items.iter().position(|i| i.id == id)?;
      Some(items.remove(index))
    })
  }

  /// Bump the attempt count of `id`. Returns the updated item.
  fn record_failure(&self, id: &str, err: &RequestError) -> Option<OutboxItem> {
    self.update(|items| {
      let item = items.iter_mut().find(|i| i.id == id)?;
      item.attempts += 1;
      item.last_error = Some(err.to_string());
      Some(item.clone())
    })
  }

  fn abandon(&self, item: &OutboxItem, err: &RequestError, report: &mut DrainReport) {
    if let Some(removed) = self.remove_by_id(&item.id) {
      self.inner.reporter.report(&removed, err);
      report.abandoned.push(removed.id);
    }
  }

  /// Replay queued items in order, one at a time.
  ///
  /// Stops at the first recoverable failure so later mutations are never
  /// delivered ahead of earlier ones. Returns `None` if another drain is
  /// already running.
  pub async fn drain(&self) -> Option<DrainReport> {
    let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
      debug!("Drain already in progress");
      return None;
    };

    let mut report = DrainReport::default();

    loop {
      let Some(item) = self.read_queue().into_iter().next() else {
        break;
      };

      let request = item.to_request();
      match self
        .inner
        .client
        .send_mutation(&request, &item.dedupe_key)
        .await
      {
        Ok(_) => {
          info!(id = %item.id, title = %item.title, "Delivered queued mutation");
          // Removal is by id: an item replaced while replaying stays queued
          self.remove_by_id(&item.id);
          report.delivered.push(item.id);
        }
        Err(err) if err.is_recoverable() => {
          let Some(updated) = self.record_failure(&item.id, &err) else {
            continue;
          };

          if self
            .inner
            .max_attempts
            .is_some_and(|max| updated.attempts >= max)
          {
            warn!(id = %updated.id, attempts = updated.attempts, "Giving up on queued mutation");
            self.abandon(&updated, &err, &mut report);
            continue;
          }

          warn!(id = %updated.id, attempts = updated.attempts, error = %err, "Queued mutation will be retried");
          report.failed = Some(updated.id);
          break;
        }
        Err(err) => {
          self.abandon(&item, &err, &mut report);
        }
      }
    }

    report.remaining = self.len();
    Some(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::UpdateBus;
  use crate::http::{Method, Transport};
  use crate::store::{MemoryBackend, StorageBackend, SystemClock};
  use crate::testing::ScriptedTransport;
  use serde_json::json;
  use std::time::Duration;

  #[derive(Default)]
  struct RecordingReporter {
    reported: Mutex<Vec<(String, String)>>,
  }

  impl AbandonReporter for RecordingReporter {
    fn report(&self, item: &OutboxItem, err: &RequestError) {
      self
        .reported
        .lock()
        .unwrap()
        .push((item.dedupe_key.clone(), err.to_string()));
    }
  }

  struct Harness {
    outbox: Outbox,
    transport: Arc<ScriptedTransport>,
    reporter: Arc<RecordingReporter>,
    backend: Arc<dyn StorageBackend>,
  }

  fn harness_with(transport: ScriptedTransport, max_attempts: Option<u32>) -> Harness {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let transport = Arc::new(transport);
    let reporter = Arc::new(RecordingReporter::default());
    let outbox = build(backend.clone(), transport.clone(), reporter.clone(), max_attempts);
    Harness {
      outbox,
      transport,
      reporter,
      backend,
    }
  }

  fn build(
    backend: Arc<dyn StorageBackend>,
    transport: Arc<dyn Transport>,
    reporter: Arc<dyn AbandonReporter>,
    max_attempts: Option<u32>,
  ) -> Outbox {
    let store = DurableStore::new(backend, Arc::new(SystemClock));
    let bus = UpdateBus::new(store.clone(), Duration::from_millis(250));
    let client = RequestClient::new(transport, store.clone(), bus, Duration::from_secs(30));
    Outbox::load(store, client, reporter, max_attempts)
  }

  fn item(key: &str, body: serde_json::Value) -> NewOutboxItem {
    NewOutboxItem::new(
      format!("Save {}", key),
      Method::Put,
      format!("/{}", key),
      key,
    )
    .with_body(body)
  }

  #[tokio::test]
  async fn test_replacement_keeps_position_and_replays_once_each() {
    let h = harness_with(ScriptedTransport::new().with_default(json!({})), None);

    let a = h.outbox.enqueue(item("a", json!(1)));
    h.outbox.enqueue(item("b", json!(2)));
    let a2 = h.outbox.enqueue(item("a", json!(3)));

    let items = h.outbox.items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, a2.id);
    assert_ne!(a.id, a2.id);

    let report = h.outbox.drain().await.unwrap();
    assert_eq!(report.delivered.len(), 2);
    assert_eq!(report.remaining, 0);

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].path, "/a");
    assert_eq!(calls[0].body, Some(json!(3)));
    assert_eq!(calls[1].path, "/b");
  }

  #[tokio::test]
  async fn test_replay_reuses_idempotency_key() {
    let h = harness_with(
      ScriptedTransport::new()
        .then_err(RequestError::Network("offline".into()))
        .then_err(RequestError::Timeout)
        .then_ok(json!({})),
      None,
    );

    h.outbox
      .enqueue(item("grade:9", json!({"score": 5})).with_idempotency_key("original-key"));

    let first = h.outbox.drain().await.unwrap();
    assert_eq!(first.failed.as_deref(), Some(h.outbox.items()[0].id.as_str()));
    assert_eq!(h.outbox.items()[0].attempts, 1);
    assert!(h.outbox.items()[0].last_error.is_some());

    h.outbox.drain().await.unwrap();
    assert_eq!(h.outbox.items()[0].attempts, 2);

    let last = h.outbox.drain().await.unwrap();
    assert_eq!(last.delivered.len(), 1);
    assert!(h.outbox.is_empty());

    let keys: Vec<_> = h
      .transport
      .calls()
      .into_iter()
      .map(|c| c.idempotency_key)
      .collect();
    assert_eq!(keys, vec![Some("original-key".to_string()); 3]);
  }

  #[tokio::test]
  async fn test_recoverable_failure_stops_the_pass() {
    let h = harness_with(
      ScriptedTransport::new()
        .then_err(RequestError::Server {
          status: 503,
          message: "maintenance".into(),
        })
        .with_default(json!({})),
      None,
    );

    h.outbox.enqueue(item("a", json!(1)));
    h.outbox.enqueue(item("b", json!(2)));

    let report = h.outbox.drain().await.unwrap();
    assert!(report.delivered.is_empty());
    assert_eq!(report.remaining, 2);
    assert_eq!(h.transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_fatal_failure_abandons_and_reports() {
    let h = harness_with(
      ScriptedTransport::new()
        .then_err(RequestError::Rejected {
          status: 422,
          message: "slot overlaps".into(),
        })
        .with_default(json!({})),
      None,
    );

    let a = h.outbox.enqueue(item("a", json!(1)));
    h.outbox.enqueue(item("b", json!(2)));

    let report = h.outbox.drain().await.unwrap();
    assert_eq!(report.abandoned, vec![a.id]);
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.remaining, 0);

    let reported = h.reporter.reported.lock().unwrap().clone();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, "a");
    assert!(reported[0].1.contains("422"));
  }

  #[tokio::test]
  async fn test_max_attempts_abandons_recoverable_item() {
    let h = harness_with(ScriptedTransport::new(), Some(2));

    h.outbox.enqueue(item("a", json!(1)));

    let first = h.outbox.drain().await.unwrap();
    assert!(first.failed.is_some());
    assert_eq!(first.remaining, 1);

    let second = h.outbox.drain().await.unwrap();
    assert_eq!(second.abandoned.len(), 1);
    assert_eq!(second.remaining, 0);
    assert_eq!(h.reporter.reported.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_queue_survives_reload() {
    let h = harness_with(ScriptedTransport::new(), None);
    let queued = h.outbox.enqueue(item("a", json!({"x": 1})));

    let reloaded = build(
      h.backend.clone(),
      Arc::new(ScriptedTransport::new().with_default(json!({}))),
      Arc::new(TracingReporter),
      None,
    );
    assert_eq!(reloaded.items(), vec![queued]);
  }

  #[tokio::test]
  async fn test_instances_sharing_a_store_keep_each_others_items() {
    let h = harness_with(ScriptedTransport::new().with_default(json!({})), None);
    let other = build(
      h.backend.clone(),
      Arc::new(ScriptedTransport::new()),
      Arc::new(TracingReporter),
      None,
    );

    let a = h.outbox.enqueue(item("a", json!(1)));
    let b = other.enqueue(item("b", json!(2)));

    let ids: Vec<_> = h.outbox.items().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
    assert!(other.contains_key("a"));

    // Replacing through one instance updates the queue the other one sees
    let a2 = other.enqueue(item("a", json!(3)));
    assert_eq!(h.outbox.items()[0].id, a2.id);

    let report = h.outbox.drain().await.unwrap();
    assert_eq!(report.delivered, vec![a2.id, b.id]);
    assert!(other.is_empty());
    assert_eq!(h.transport.calls()[0].body, Some(json!(3)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_drain_is_rejected() {
    let h = harness_with(
      ScriptedTransport::new()
        .with_delay(Duration::from_millis(50))
        .with_default(json!({})),
      None,
    );
    h.outbox.enqueue(item("a", json!(1)));

    let (first, second) = tokio::join!(h.outbox.drain(), h.outbox.drain());
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(h.transport.call_count(), 1);

    // The flag is released afterwards
    assert!(h.outbox.drain().await.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_item_replaced_during_replay_is_kept() {
    let h = harness_with(
      ScriptedTransport::new()
        .with_delay(Duration::from_millis(50))
        .with_default(json!({})),
      None,
    );
    h.outbox.enqueue(item("a", json!("old")));

    let (report, _) = tokio::join!(h.outbox.drain(), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      h.outbox.enqueue(item("a", json!("new")));
    });

    let report = report.unwrap();
    assert_eq!(report.delivered.len(), 2);
    let bodies: Vec<_> = h.transport.calls().into_iter().map(|c| c.body).collect();
    assert_eq!(bodies, vec![Some(json!("old")), Some(json!("new"))]);
    assert!(h.outbox.is_empty());
  }

  #[tokio::test]
  async fn test_discard_and_clear() {
    let h = harness_with(ScriptedTransport::new(), None);
    let a = h.outbox.enqueue(item("a", json!(1)));
    h.outbox.enqueue(item("b", json!(2)));

    assert_eq!(h.outbox.discard(&a.id).map(|i| i.dedupe_key), Some("a".into()));
    assert!(h.outbox.discard(&a.id).is_none());
    assert!(h.outbox.contains_key("b"));

    h.outbox.clear();
    assert!(h.outbox.is_empty());
    assert_eq!(h.backend.get(QUEUE_KEY).unwrap(), None);
  }
}
