//! Error types for the workflow state layer

use crate::codec::{DecodeError, EncodeError};
use thiserror::Error;

/// Result type for state operations
pub type Result<T, E = StateError> = std::result::Result<T, E>;

/// Errors that can occur while reading or mutating workflow state
///
/// A missing entity is never an error; lookups return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum StateError {
    /// The underlying store failed; callers decide whether to retry the cycle
    #[error("Store error: {0}")]
    Db(String),

    /// A stored record could not be decoded (corruption or layout mismatch)
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A record or key could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// A variables document was not a MessagePack map with string keys
    #[error("Invalid variables document: {0}")]
    Document(String),

    /// The model transformer rejected a deployed resource
    #[error("Failed to transform workflow '{process_id}': {reason}")]
    Transform { process_id: String, reason: String },

    /// A counter grew past the width of the value it hands out
    #[error("Counter '{counter}' overflowed at {value}")]
    CounterOverflow { counter: String, value: i64 },

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "persistent-storage")]
impl From<rocksdb::Error> for StateError {
    fn from(e: rocksdb::Error) -> Self {
        StateError::Db(e.into_string())
    }
}
