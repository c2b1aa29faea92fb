//! Coordination store for pullci.
//!
//! The store is the single source of truth for per-commit build state and
//! results. It provides the two atomic primitives the pipeline relies on:
//! set-if-absent for admission and a multi-key transaction for result
//! commits. Redis backs it in production; [`MemoryStore`] stands in for tests.

pub mod coordination;
pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_backend;

pub use coordination::{Admission, CoordinationStore};
pub use error::{StoreError, StoreResult};
pub use keys::{DEFAULT_NAMESPACE, KeySpace};
pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

/// Connect to the Redis coordination store.
pub async fn connect(redis_url: &str, namespace: &str) -> StoreResult<RedisStore> {
    RedisStore::connect(redis_url, KeySpace::new(namespace)).await
}
