//! JSON key-value store with TTL expiry on top of a `StorageBackend`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{MemoryBackend, StorageBackend};
use super::clock::{Clock, SystemClock};

/// Envelope persisted for every value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry<T> {
  pub value: T,
  /// Expiry in epoch milliseconds; `None` never expires
  #[serde(rename = "expiresAt")]
  pub expires_at: Option<i64>,
}

impl<T> StoredEntry<T> {
  fn is_expired(&self, now_ms: i64) -> bool {
    self.expires_at.is_some_and(|at| at <= now_ms)
  }
}

/// Best-effort durable store.
///
/// Reads never fail: missing, malformed and expired entries all read as
/// absent. Writes never fail either; a broken backend degrades to a no-op
/// and the failure is logged.
#[derive(Clone)]
pub struct DurableStore {
  backend: Arc<dyn StorageBackend>,
  clock: Arc<dyn Clock>,
}

impl DurableStore {
  pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
    Self { backend, clock }
  }

  /// Session-only store backed by process memory.
  pub fn in_memory() -> Self {
    Self::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock))
  }

  /// Current time according to the store's clock.
  pub fn now_ms(&self) -> i64 {
    self.clock.now_ms()
  }

  /// Serialize and persist `value` under `key`, overwriting any prior value.
  ///
  /// With a `ttl` the entry expires `ttl` after now; without one it never does.
  pub fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    let entry = StoredEntry {
      value,
      expires_at: ttl.map(|ttl| self.now_ms().saturating_add(ttl.as_millis() as i64)),
    };

    let raw = match serde_json::to_string(&entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key, error = %e, "Failed to serialize store entry, skipping write");
        return;
      }
    };

    if let Err(e) = self.backend.set(key, &raw) {
      warn!(key, error = %e, "Store write failed, continuing without persistence");
    }
  }

  /// Read the value under `key`.
  ///
  /// Expired or undecodable entries are removed and read as `None`.
  pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = match self.backend.get(key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "Store read failed, treating as absent");
        return None;
      }
    };

    let entry: StoredEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        debug!(key, error = %e, "Dropping malformed store entry");
        self.remove(key);
        return None;
      }
    };

    if entry.is_expired(self.now_ms()) {
      debug!(key, "Evicting expired store entry");
      self.remove(key);
      return None;
    }

    Some(entry.value)
  }

  /// Read the value under `key`, or `fallback` when it is absent.
  pub fn read_or<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
    self.read(key).unwrap_or(fallback)
  }

  /// Delete `key`. No-op when it does not exist.
  pub fn remove(&self, key: &str) {
    if let Err(e) = self.backend.delete(key) {
      warn!(key, error = %e, "Store delete failed");
    }
  }

  /// Remove every key in `keys`.
  pub fn reset(&self, keys: &[&str]) {
    for key in keys {
      self.remove(key);
    }
  }

  /// Remove every key starting with `prefix`. Returns how many were removed.
  pub fn reset_prefix(&self, prefix: &str) -> usize {
    let keys = match self.backend.keys(prefix) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(prefix, error = %e, "Store key scan failed, nothing reset");
        return 0;
      }
    };

    for key in &keys {
      self.remove(key);
    }
    keys.len()
  }
}
