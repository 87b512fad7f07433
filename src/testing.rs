//! Test doubles shared by unit tests across modules.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::http::{ApiRequest, RequestError, Transport};

/// Transport that replays scripted responses and records every request.
///
/// Scripted responses are consumed in order; once exhausted the default
/// response is returned, or a network error if there is none.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
  script: Mutex<VecDeque<Result<Value, RequestError>>>,
  default: Option<Value>,
  delay: Duration,
  calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn with_default(mut self, value: Value) -> Self {
    self.default = Some(value);
    self
  }

  pub fn then_ok(self, value: Value) -> Self {
    self.push(Ok(value));
    self
  }

  pub fn then_err(self, err: RequestError) -> Self {
    self.push(Err(err));
    self
  }

  pub fn push(&self, result: Result<Value, RequestError>) {
    self.script.lock().unwrap().push_back(result);
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: &ApiRequest) -> Result<Value, RequestError> {
    self.calls.lock().unwrap().push(request.clone());

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    let scripted = self.script.lock().unwrap().pop_front();
    match scripted {
      Some(result) => result,
      None => self
        .default
        .clone()
        .ok_or_else(|| RequestError::Network("no scripted response".into())),
    }
  }
}
