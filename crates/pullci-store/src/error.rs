//! Coordination store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt value at {key}: {message}")]
    Corrupt { key: String, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for pullci_core::Error {
    fn from(err: StoreError) -> Self {
        pullci_core::Error::Store(err.to_string())
    }
}
