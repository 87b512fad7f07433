//! Request description types shared by the client, transport and outbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// HTTP methods the data layer issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    }
  }

  pub fn is_mutation(&self) -> bool {
    !matches!(self, Self::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "DELETE" => Ok(Self::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// A fully described request, ready for a `Transport`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  /// Sent as the `Idempotency-Key` header when present
  pub idempotency_key: Option<String>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      body: None,
      idempotency_key: None,
    }
  }

  pub fn with_body(mut self, body: Option<Value>) -> Self {
    self.body = body;
    self
  }

  pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }
}

/// Per-call options. Unset fields fall back to the client's defaults.
#[derive(Debug, Clone)]
pub struct RequestOptions {
  /// Join an identical in-flight read instead of issuing a new one
  pub dedupe: bool,
  /// How long a successful read stays servable; zero disables caching
  pub cache_ttl: Option<Duration>,
  /// Reuse an existing idempotency key instead of generating one
  pub idempotency_key: Option<String>,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      dedupe: true,
      cache_ttl: None,
      idempotency_key: None,
    }
  }
}

impl RequestOptions {
  /// Bypass in-flight deduplication (forced refresh).
  pub fn fresh(mut self) -> Self {
    self.dedupe = false;
    self
  }

  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn no_cache(self) -> Self {
    self.cache_ttl(Duration::ZERO)
  }

  pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }

  /// Fill unset fields from the client defaults.
  pub(crate) fn resolve(self, default_cache_ttl: Duration) -> ResolvedOptions {
    ResolvedOptions {
      dedupe: self.dedupe,
      cache_ttl: self.cache_ttl.unwrap_or(default_cache_ttl),
      idempotency_key: self.idempotency_key,
    }
  }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
  pub dedupe: bool,
  pub cache_ttl: Duration,
  pub idempotency_key: Option<String>,
}

/// Normalize a `(method, path)` pair into a stable key.
///
/// Trims whitespace, drops a trailing slash and sorts query parameters so
/// that equivalent paths share cache and in-flight entries.
pub fn normalize_key(method: Method, path: &str) -> String {
  let path = path.trim();
  let (base, query) = match path.split_once('?') {
    Some((base, query)) => (base, Some(query)),
    None => (path, None),
  };

  let base = base.trim_end_matches('/');
  let base = if base.is_empty() { "/" } else { base };

  let mut key = format!("{} {}", method, base);
  if let Some(query) = query {
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_unstable();
    if !params.is_empty() {
      key.push('?');
      key.push_str(&params.join("&"));
    }
  }
  key
}

/// Hash a normalized key into a fixed-length storage key component.
pub fn hash_key(normalized: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(normalized.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_trims_and_sorts_query() {
    assert_eq!(
      normalize_key(Method::Get, " /courses/7/?b=2&a=1 "),
      "GET /courses/7?a=1&b=2"
    );
    assert_eq!(
      normalize_key(Method::Get, "/courses/7"),
      normalize_key(Method::Get, "/courses/7/")
    );
  }

  #[test]
  fn test_normalize_distinguishes_methods() {
    assert_ne!(
      normalize_key(Method::Get, "/lessons"),
      normalize_key(Method::Delete, "/lessons")
    );
  }

  #[test]
  fn test_normalize_root_path() {
    assert_eq!(normalize_key(Method::Get, "/"), "GET /");
  }

  #[test]
  fn test_hash_key_is_stable_hex() {
    let hash = hash_key("GET /lessons");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, hash_key("GET /lessons"));
  }

  #[test]
  fn test_method_parse() {
    assert_eq!("put".parse::<Method>(), Ok(Method::Put));
    assert!("PATCH".parse::<Method>().is_err());
    assert!(Method::Delete.is_mutation());
    assert!(!Method::Get.is_mutation());
  }

  #[test]
  fn test_options_resolve_defaults() {
    let resolved = RequestOptions::default().resolve(Duration::from_secs(30));
    assert!(resolved.dedupe);
    assert_eq!(resolved.cache_ttl, Duration::from_secs(30));
    assert_eq!(resolved.idempotency_key, None);

    let resolved = RequestOptions::default()
      .fresh()
      .no_cache()
      .idempotency_key("k-1")
      .resolve(Duration::from_secs(30));
    assert!(!resolved.dedupe);
    assert_eq!(resolved.cache_ttl, Duration::ZERO);
    assert_eq!(resolved.idempotency_key.as_deref(), Some("k-1"));
  }
}
