//! Error types for the common crate.

use thiserror::Error;

/// Errors that can occur in the common crate.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Error when an address string cannot be parsed.
    #[error("Invalid address '{0}': expected host:port")]
    InvalidAddress(String),

    /// Error when key material has the wrong length or encoding.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}
