//! Error types for the network crate.

use common::addressing::TransportKind;
use persistence::PersistenceError;
use std::error::Error as StdError;
use std::fmt;

/// Errors that can occur in the network crate.
#[derive(Debug)]
pub enum NetworkError {
    /// Error when a transport cannot start or bind.
    TransportError(String),

    /// Error when a peer address cannot be reached.
    Unreachable(String),

    /// Error when a connection was closed before the operation completed.
    ConnectionClosed(String),

    /// Error when serialization or deserialization fails.
    SerializationError(String),

    /// Error when the persistence collaborator fails.
    StorageError(String),

    /// Error when an envelope fails the authorization check.
    AuthorizationFailed(String),

    /// Error when an operation needs a service the configuration did not enable.
    ServiceNotSupported(&'static str),

    /// Error when no transport implementation exists for the kind.
    UnsupportedTransport(TransportKind),

    /// Error when a record fails validation.
    InvalidRecord(String),

    /// Error when a message is malformed or carries an unknown version.
    InvalidMessage(String),

    /// Error when a timeout occurs.
    Timeout(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::TransportError(msg) => write!(f, "Transport error: {}", msg),
            NetworkError::Unreachable(msg) => write!(f, "Peer unreachable: {}", msg),
            NetworkError::ConnectionClosed(msg) => write!(f, "Connection closed: {}", msg),
            NetworkError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            NetworkError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            NetworkError::AuthorizationFailed(msg) => write!(f, "Authorization failed: {}", msg),
            NetworkError::ServiceNotSupported(service) => {
                write!(f, "Service not enabled for this configuration: {}", service)
            }
            NetworkError::UnsupportedTransport(kind) => {
                write!(f, "No transport implementation for {}", kind)
            }
            NetworkError::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            NetworkError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            NetworkError::Timeout(msg) => write!(f, "Timeout waiting for {}", msg),
        }
    }
}

impl StdError for NetworkError {}

impl From<PersistenceError> for NetworkError {
    fn from(error: PersistenceError) -> Self {
        NetworkError::StorageError(error.to_string())
    }
}
