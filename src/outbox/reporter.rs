use tracing::error;

use super::item::OutboxItem;
use crate::http::RequestError;

/// Receives mutations the outbox gave up on.
pub trait AbandonReporter: Send + Sync {
  fn report(&self, item: &OutboxItem, error: &RequestError);
}

/// Reports abandoned deliveries through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl AbandonReporter for TracingReporter {
  fn report(&self, item: &OutboxItem, err: &RequestError) {
    error!(
      id = %item.id,
      title = %item.title,
      method = %item.method,
      path = %item.path,
      dedupe_key = %item.dedupe_key,
      attempts = item.attempts,
      error = %err,
      "Abandoned queued mutation"
    );
  }
}
