//! Error types for the persistence crate.

use thiserror::Error;

/// Errors that can occur in the persistence crate.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Error when the storage backend fails.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Error when serialization or deserialization fails.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
