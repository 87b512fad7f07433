//! Service instance that owns and wires the data layer components.

use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::{Subscription, UpdateBus, FLUSH_KEY};
use crate::config::{Config, StorageConfig};
use crate::http::{
  decode, new_idempotency_key, ApiRequest, Method, ReqwestTransport, RequestClient, RequestError,
  Transport,
};
use crate::outbox::{
  AbandonReporter, DrainReport, DrainTrigger, NewOutboxItem, Outbox, OutboxItem, OutboxWorker,
  RetryPolicy, TracingReporter,
};
use crate::store::{DurableStore, MemoryBackend, SqliteBackend, StorageBackend, SystemClock};

/// A mutation that should reach the server eventually.
#[derive(Debug, Clone)]
pub struct MutationRequest {
  /// Shown in retry UI if the mutation gets queued
  pub title: String,
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  /// Logical resource key, e.g. `teacher-availability:42`
  pub dedupe_key: String,
}

/// Result of `DataLayer::mutate`.
#[derive(Debug)]
pub enum MutationOutcome<T> {
  /// Delivered now; carries the decoded response
  Delivered(T),
  /// Failed recoverably and was queued for replay
  Queued(OutboxItem),
}

/// Owns the store, bus, client, outbox and drain worker for one session.
pub struct DataLayer {
  store: DurableStore,
  bus: UpdateBus,
  client: RequestClient,
  outbox: Outbox,
  worker: OutboxWorker,
}

impl DataLayer {
  /// Build the layer from configuration, talking to the real API.
  ///
  /// Falls back to in-memory storage if the database cannot be opened.
  pub fn open(config: &Config) -> Result<Self> {
    let store = open_store(&config.storage);
    let transport = Arc::new(ReqwestTransport::new(&config.api, Config::api_token())?);
    let layer = Self::assemble(store, transport, Arc::new(TracingReporter), config);
    layer.bus.watch_remote(config.bus.remote_poll());
    Ok(layer)
  }

  /// Wire the components around the given store and transport.
  ///
  /// Spawns the drain worker, so this must run inside a tokio runtime.
  pub fn assemble(
    store: DurableStore,
    transport: Arc<dyn Transport>,
    reporter: Arc<dyn AbandonReporter>,
    config: &Config,
  ) -> Self {
    let bus = UpdateBus::new(store.clone(), config.bus.min_dispatch_interval());
    let client = RequestClient::new(
      transport,
      store.clone(),
      bus.clone(),
      config.cache.default_ttl(),
    );
    let outbox = Outbox::load(
      store.clone(),
      client.clone(),
      reporter,
      config.outbox.max_attempts,
    );
    let worker = OutboxWorker::spawn(
      outbox.clone(),
      RetryPolicy {
        base: std::time::Duration::from_millis(config.outbox.retry_base_ms),
        max: std::time::Duration::from_millis(config.outbox.retry_max_ms),
      },
    );

    Self {
      store,
      bus,
      client,
      outbox,
      worker,
    }
  }

  pub fn client(&self) -> &RequestClient {
    &self.client
  }

  pub fn outbox(&self) -> &Outbox {
    &self.outbox
  }

  pub fn bus(&self) -> &UpdateBus {
    &self.bus
  }

  pub fn store(&self) -> &DurableStore {
    &self.store
  }

  pub fn subscribe(&self) -> Subscription {
    self.bus.subscribe()
  }

  /// Send a mutation, queueing it for replay if it fails recoverably.
  ///
  /// If a mutation for the same `dedupe_key` is already queued, the new one
  /// replaces it in the queue instead of overtaking it on the wire.
  pub async fn mutate<T: DeserializeOwned>(
    &self,
    request: MutationRequest,
  ) -> Result<MutationOutcome<T>, RequestError> {
    let idempotency_key = new_idempotency_key();
    let MutationRequest {
      title,
      method,
      path,
      body,
      dedupe_key,
    } = request;

    let api_request = ApiRequest::new(method, path.clone())
      .with_body(body.clone())
      .with_idempotency_key(idempotency_key.clone());
    let queued = NewOutboxItem {
      title,
      method,
      path,
      body,
      dedupe_key,
      idempotency_key: Some(idempotency_key),
    };

    if self.outbox.contains_key(&queued.dedupe_key) {
      let item = self.outbox.enqueue(queued);
      self.worker.trigger(DrainTrigger::Manual);
      return Ok(MutationOutcome::Queued(item));
    }

    match self
      .client
      .send_mutation(&api_request, &queued.dedupe_key)
      .await
    {
      Ok(value) => Ok(MutationOutcome::Delivered(decode(value)?)),
      Err(err) if err.is_recoverable() => {
        warn!(dedupe_key = %queued.dedupe_key, error = %err, "Mutation failed, queueing for replay");
        let item = self.outbox.enqueue(queued);
        self.worker.trigger(DrainTrigger::Retry);
        Ok(MutationOutcome::Queued(item))
      }
      Err(err) => Err(err),
    }
  }

  /// Ask the background worker to drain the outbox.
  pub fn trigger_drain(&self, trigger: DrainTrigger) {
    self.worker.trigger(trigger);
  }

  /// Drain the outbox on the caller's task and wait for the result.
  pub async fn drain(&self) -> Option<DrainReport> {
    self.outbox.drain().await
  }

  /// Forget cached reads, queued mutations and the flush marker.
  pub fn reset(&self) {
    let cached = self.client.clear_cache();
    let queued = self.outbox.len();
    self.outbox.clear();
    self.store.reset(&[FLUSH_KEY]);
    info!(cached, queued, "Data layer reset");
  }

  /// Stop background work. Pending bus reasons are flushed first.
  pub async fn shutdown(self) {
    self.worker.shutdown().await;
    self.bus.shutdown();
  }
}

fn open_store(storage: &StorageConfig) -> DurableStore {
  let backend: Arc<dyn StorageBackend> = if storage.in_memory {
    Arc::new(MemoryBackend::new())
  } else {
    let opened = match &storage.path {
      Some(path) => SqliteBackend::open_at(path),
      None => SqliteBackend::open(),
    };
    match opened {
      Ok(backend) => Arc::new(backend),
      Err(e) => {
        warn!(error = %e, "Persistent storage unavailable, using memory for this session");
        Arc::new(MemoryBackend::new())
      }
    }
  };

  DurableStore::new(backend, Arc::new(SystemClock))
}
