//! Durable key-value storage with TTL expiry.
//!
//! This module provides the persistence foundation for the rest of the crate:
//! - A `StorageBackend` capability trait with SQLite and in-memory implementations
//! - A `DurableStore` that adds JSON (de)serialization and lazy TTL eviction
//! - A `Clock` abstraction so expiry can be driven deterministically in tests
//!
//! Storage failures never reach callers: they are logged and degrade to
//! "absent" on read and "no-op" on write.

mod backend;
mod clock;
mod durable;

pub use backend::{MemoryBackend, SqliteBackend, StorageBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use durable::{DurableStore, StoredEntry};
