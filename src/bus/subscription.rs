use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use super::DataUpdate;

/// Handle to the update stream. Dropping it (or calling `unsubscribe`) ends
/// the subscription.
pub struct Subscription {
  receiver: broadcast::Receiver<DataUpdate>,
}

impl Subscription {
  pub(super) fn new(receiver: broadcast::Receiver<DataUpdate>) -> Self {
    Self { receiver }
  }

  /// Wait for the next update. Returns `None` once the bus is gone.
  ///
  /// A subscriber that falls behind skips the updates it missed; the next
  /// one it sees is enough to trigger a re-fetch.
  pub async fn recv(&mut self) -> Option<DataUpdate> {
    loop {
      match self.receiver.recv().await {
        Ok(update) => return Some(update),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "Update subscriber lagged behind");
        }
        Err(RecvError::Closed) => return None,
      }
    }
  }

  /// Take the next update if one is already available.
  pub fn try_recv(&mut self) -> Option<DataUpdate> {
    loop {
      match self.receiver.try_recv() {
        Ok(update) => return Some(update),
        Err(TryRecvError::Lagged(_)) => continue,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
      }
    }
  }

  /// End the subscription explicitly.
  pub fn unsubscribe(self) {}
}
