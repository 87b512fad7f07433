//! Client-side resilient data layer.
//!
//! - [`store`]: durable key-value storage with TTL expiry
//! - [`http`]: request client with deduplication, caching and idempotency keys
//! - [`outbox`]: persistent queue replaying mutations that failed recoverably
//! - [`bus`]: coalesced, rate-limited "data changed" notifications
//! - [`layer`]: the service instance wiring them together

pub mod bus;
pub mod config;
pub mod http;
pub mod layer;
pub mod logging;
pub mod outbox;
pub mod store;

#[cfg(test)]
mod testing;

pub use layer::{DataLayer, MutationOutcome, MutationRequest};
