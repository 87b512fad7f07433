//! Request client with in-flight deduplication and time-boxed caching.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, instrument, trace};

use super::error::RequestError;
use super::request::{hash_key, normalize_key, ApiRequest, Method, RequestOptions};
use super::transport::Transport;
use crate::bus::UpdateBus;
use crate::store::DurableStore;

/// Store key prefix for cached read responses.
pub const CACHE_PREFIX: &str = "http-cache:";

type SharedResponse = Shared<BoxFuture<'static, Result<Value, RequestError>>>;

/// A successful read as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
  value: Value,
  /// Epoch milliseconds at which the response arrived
  resolved_at: i64,
}

/// Generate a fresh idempotency key.
pub fn new_idempotency_key() -> String {
  uuid::Uuid::new_v4().to_string()
}

struct ClientInner {
  transport: Arc<dyn Transport>,
  store: DurableStore,
  bus: UpdateBus,
  default_cache_ttl: Duration,
  in_flight: Mutex<HashMap<String, SharedResponse>>,
}

impl ClientInner {
  fn in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedResponse>> {
    self
      .in_flight
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn cache_key(normalized: &str) -> String {
    format!("{}{}", CACHE_PREFIX, hash_key(normalized))
  }

  /// Cached value for `normalized` if it is younger than `ttl`.
  fn cached(&self, normalized: &str, ttl: Duration) -> Option<Value> {
    if ttl.is_zero() {
      return None;
    }

    let cached: CachedResponse = self.store.read(&Self::cache_key(normalized))?;
    let age = self.store.now_ms().saturating_sub(cached.resolved_at);
    (age < ttl.as_millis() as i64).then_some(cached.value)
  }

  fn store_cached(&self, normalized: &str, value: &Value, ttl: Duration) {
    if ttl.is_zero() {
      return;
    }

    let cached = CachedResponse {
      value: value.clone(),
      resolved_at: self.store.now_ms(),
    };
    self
      .store
      .write(&Self::cache_key(normalized), &cached, Some(ttl));
  }

  /// Issue a read and cache it on success.
  async fn fetch(&self, normalized: &str, path: &str, ttl: Duration) -> Result<Value, RequestError> {
    let request = ApiRequest::new(Method::Get, path);
    let value = self.transport.send(&request).await?;
    self.store_cached(normalized, &value, ttl);
    Ok(value)
  }

  /// Run a deduplicated read and release its in-flight slot once settled.
  async fn fetch_and_settle(
    self: Arc<Self>,
    normalized: String,
    path: String,
    ttl: Duration,
  ) -> Result<Value, RequestError> {
    let result = self.fetch(&normalized, &path, ttl).await;
    self.in_flight().remove(&normalized);
    result
  }
}

/// HTTP client shared by all feature code. Cheap to clone.
#[derive(Clone)]
pub struct RequestClient {
  inner: Arc<ClientInner>,
}

impl RequestClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    store: DurableStore,
    bus: UpdateBus,
    default_cache_ttl: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        transport,
        store,
        bus,
        default_cache_ttl,
        in_flight: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Read `path` and decode the response into `T`.
  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, RequestError> {
    decode(self.get_value(path, options).await?)
  }

  /// Read `path` as raw JSON.
  ///
  /// 1. Serve from cache if a fresh entry exists
  /// 2. Otherwise join an identical in-flight read (unless `dedupe` is off)
  /// 3. Otherwise issue the request on its own task and cache the result
  ///
  /// The request task runs to completion even if every caller stops waiting.
  #[instrument(skip(self, options), fields(dedupe = options.dedupe))]
  pub async fn get_value(&self, path: &str, options: RequestOptions) -> Result<Value, RequestError> {
    let options = options.resolve(self.inner.default_cache_ttl);
    let normalized = normalize_key(Method::Get, path);

    if let Some(value) = self.inner.cached(&normalized, options.cache_ttl) {
      trace!(key = %normalized, "Cache hit");
      return Ok(value);
    }

    if !options.dedupe {
      return self
        .inner
        .fetch(&normalized, path, options.cache_ttl)
        .await;
    }

    let shared = {
      let mut in_flight = self.inner.in_flight();
      match in_flight.get(&normalized) {
        Some(existing) => {
          debug!(key = %normalized, "Joining in-flight request");
          existing.clone()
        }
        None => {
          let task = tokio::spawn(Arc::clone(&self.inner).fetch_and_settle(
            normalized.clone(),
            path.to_string(),
            options.cache_ttl,
          ));
          let shared = async move {
            task
              .await
              .unwrap_or_else(|e| Err(RequestError::Network(format!("request task failed: {}", e))))
          }
          .boxed()
          .shared();
          in_flight.insert(normalized, shared.clone());
          shared
        }
      }
    };

    shared.await
  }

  pub async fn post<B, T>(&self, path: &str, body: &B, options: RequestOptions) -> Result<T, RequestError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let body = encode(body)?;
    decode(self.mutate(Method::Post, path, Some(body), options).await?)
  }

  pub async fn put<B, T>(&self, path: &str, body: &B, options: RequestOptions) -> Result<T, RequestError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let body = encode(body)?;
    decode(self.mutate(Method::Put, path, Some(body), options).await?)
  }

  pub async fn delete<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, RequestError> {
    decode(self.mutate(Method::Delete, path, None, options).await?)
  }

  async fn mutate(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
    options: RequestOptions,
  ) -> Result<Value, RequestError> {
    let key = options
      .resolve(self.inner.default_cache_ttl)
      .idempotency_key
      .unwrap_or_else(new_idempotency_key);
    let request = ApiRequest::new(method, path)
      .with_body(body)
      .with_idempotency_key(key);
    let reason = format!("{} {}", method, path);
    self.send_mutation(&request, &reason).await
  }

  /// Send a prepared mutation; on success invalidate the cached read of the
  /// same path and notify the update bus with `reason`.
  ///
  /// A request without an idempotency key gets a fresh one.
  #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
  pub async fn send_mutation(&self, request: &ApiRequest, reason: &str) -> Result<Value, RequestError> {
    let value = if request.idempotency_key.is_some() {
      self.execute(request).await?
    } else {
      let keyed = request.clone().with_idempotency_key(new_idempotency_key());
      self.execute(&keyed).await?
    };

    self.invalidate(&request.path);
    self.inner.bus.notify(reason);
    Ok(value)
  }

  /// Send `request` as-is: no cache, deduplication or notification.
  pub async fn execute(&self, request: &ApiRequest) -> Result<Value, RequestError> {
    self.inner.transport.send(request).await
  }

  /// Drop the cached read of `path`.
  pub fn invalidate(&self, path: &str) {
    let normalized = normalize_key(Method::Get, path);
    self.inner.store.remove(&ClientInner::cache_key(&normalized));
  }

  /// Drop every cached read. Returns how many entries were removed.
  pub fn clear_cache(&self) -> usize {
    self.inner.store.reset_prefix(CACHE_PREFIX)
  }

  /// Number of reads currently on the wire.
  pub fn in_flight_len(&self) -> usize {
    self.inner.in_flight().len()
  }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value, RequestError> {
  serde_json::to_value(body)
    .map_err(|e| RequestError::Malformed(format!("failed to encode request body: {}", e)))
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RequestError> {
  serde_json::from_value(value)
    .map_err(|e| RequestError::Malformed(format!("unexpected response shape: {}", e)))
}
