//! HTTP access to the platform API.

mod client;
mod error;
mod request;
mod transport;

pub(crate) use client::decode;
pub use client::{new_idempotency_key, RequestClient, CACHE_PREFIX};
pub use error::{ErrorKind, RequestError};
pub use request::{hash_key, normalize_key, ApiRequest, Method, RequestOptions};
pub use transport::{ReqwestTransport, Transport, IDEMPOTENCY_HEADER};
