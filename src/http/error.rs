use std::time::Duration;
use thiserror::Error;

/// Whether a failure is worth retrying automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Connectivity, timeout, 5xx or throttling; may succeed later
  Recoverable,
  /// Contract violation; retrying the same request cannot help
  Fatal,
}

/// Failure of a request against the API.
///
/// `Clone` so a single in-flight result can be handed to every caller that
/// joined it.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
  #[error("network unreachable: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },

  #[error("rate limited (retry after {retry_after:?})")]
  RateLimited { retry_after: Option<Duration> },

  #[error("request rejected with status {status}: {message}")]
  Rejected { status: u16, message: String },

  #[error("malformed request or response: {0}")]
  Malformed(String),
}

impl RequestError {
  /// Classify an HTTP error status.
  pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
    match status {
      429 => Self::RateLimited { retry_after },
      408 => Self::Timeout,
      500..=599 => Self::Server { status, message },
      _ => Self::Rejected { status, message },
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Network(_) | Self::Timeout | Self::Server { .. } | Self::RateLimited { .. } => {
        ErrorKind::Recoverable
      }
      Self::Rejected { .. } | Self::Malformed(_) => ErrorKind::Fatal,
    }
  }

  pub fn is_recoverable(&self) -> bool {
    self.kind() == ErrorKind::Recoverable
  }
}
