//! Network transport seam and its reqwest implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::error::RequestError;
use super::request::{ApiRequest, Method};
use crate::config::ApiConfig;

/// Header carrying the idempotency key of a mutation.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Error bodies are kept to this many characters.
const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// Sends a single request and returns the decoded JSON body.
///
/// Implementations classify every failure into a `RequestError`; timeouts are
/// the transport's job.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &ApiRequest) -> Result<Value, RequestError>;
}

/// REST transport over reqwest with bearer authentication.
pub struct ReqwestTransport {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ReqwestTransport {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with a slash
    let mut base = config.base_url.trim().to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
    })
  }

  fn url_for(&self, path: &str) -> Result<Url, RequestError> {
    self
      .base_url
      .join(path.trim().trim_start_matches('/'))
      .map_err(|e| RequestError::Malformed(format!("invalid path {}: {}", path, e)))
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn classify(err: reqwest::Error) -> RequestError {
  if err.is_timeout() {
    RequestError::Timeout
  } else if err.is_builder() || err.is_decode() {
    RequestError::Malformed(err.to_string())
  } else {
    RequestError::Network(err.to_string())
  }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
  headers
    .get(reqwest::header::RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}

/// Parse a response body; an empty body (e.g. 204) decodes as `null`.
fn decode_body(bytes: &[u8]) -> Result<Value, RequestError> {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Ok(Value::Null);
  }
  serde_json::from_slice(bytes)
    .map_err(|e| RequestError::Malformed(format!("invalid JSON response: {}", e)))
}

fn truncate_message(body: &str) -> String {
  body.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

#[async_trait]
impl Transport for ReqwestTransport {
  #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
  async fn send(&self, request: &ApiRequest) -> Result<Value, RequestError> {
    let url = self.url_for(&request.path)?;
    let mut builder = self.http.request(to_reqwest_method(request.method), url);

    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(key) = &request.idempotency_key {
      builder = builder.header(IDEMPOTENCY_HEADER, key);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status();
    debug!(status = status.as_u16(), "Response received");

    if !status.is_success() {
      let retry_after = parse_retry_after(response.headers());
      let message = truncate_message(&response.text().await.unwrap_or_default());
      return Err(RequestError::from_status(
        status.as_u16(),
        message,
        retry_after,
      ));
    }

    let bytes = response.bytes().await.map_err(classify)?;
    decode_body(&bytes)
  }
}
