use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{ApiRequest, Method};

/// A queued mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
  pub id: String,
  /// Human-readable label for retry UI
  pub title: String,
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  /// Logical resource key; unique among queued items
  pub dedupe_key: String,
  /// Sent unchanged on every replay of this item
  pub idempotency_key: String,
  /// Epoch milliseconds
  pub enqueued_at: i64,
  pub attempts: u32,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl OutboxItem {
  pub fn to_request(&self) -> ApiRequest {
    ApiRequest::new(self.method, self.path.clone())
      .with_body(self.body.clone())
      .with_idempotency_key(self.idempotency_key.clone())
  }
}

/// What a caller hands to `Outbox::enqueue`.
#[derive(Debug, Clone)]
pub struct NewOutboxItem {
  pub title: String,
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  pub dedupe_key: String,
  /// Key of the failed original call; a fresh one is generated when absent
  pub idempotency_key: Option<String>,
}

impl NewOutboxItem {
  pub fn new(
    title: impl Into<String>,
    method: Method,
    path: impl Into<String>,
    dedupe_key: impl Into<String>,
  ) -> Self {
    Self {
      title: title.into(),
      method,
      path: path.into(),
      body: None,
      dedupe_key: dedupe_key.into(),
      idempotency_key: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_persisted_shape() {
    let item = OutboxItem {
      id: "1".into(),
      title: "Save availability".into(),
      method: Method::Put,
      path: "/teacher-availability/42".into(),
      body: Some(json!({"slots": []})),
      dedupe_key: "teacher-availability:42".into(),
      idempotency_key: "abc".into(),
      enqueued_at: 10,
      attempts: 0,
      last_error: None,
    };

    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["method"], "PUT");
    assert_eq!(value["dedupeKey"], "teacher-availability:42");
    assert_eq!(value["enqueuedAt"], 10);

    let request = item.to_request();
    assert_eq!(request.idempotency_key.as_deref(), Some("abc"));
    assert_eq!(request.body, item.body);
  }
}
