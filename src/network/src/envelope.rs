//! Wire envelope and payload types for the overlay network.

use crate::authorization::AuthToken;
use crate::confidential::ConfidentialEnvelope;
use crate::errors::NetworkError;
use crate::record::{Record, RecordKey};
use serde::{Deserialize, Serialize};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Application payloads routed by the overlay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    /// Replicate a record to the receiver
    AddRecord(Record),
    /// Ask the receiver to drop a record
    RemoveRecord {
        /// Store the record lives in
        store_id: String,
        /// Content key of the record
        key: RecordKey,
    },
    /// Confidential point-to-point message
    Confidential(ConfidentialEnvelope),
    /// Delivery acknowledgement for a confidential message
    Ack {
        /// Id of the acknowledged message
        message_id: [u8; 32],
    },
    /// Keep-alive probe
    Ping {
        /// Echo nonce
        nonce: u64,
    },
    /// Keep-alive reply
    Pong {
        /// Echoed nonce
        nonce: u64,
    },
}

impl Payload {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::AddRecord(_) => "AddRecord",
            Payload::RemoveRecord { .. } => "RemoveRecord",
            Payload::Confidential(_) => "Confidential",
            Payload::Ack { .. } => "Ack",
            Payload::Ping { .. } => "Ping",
            Payload::Pong { .. } => "Pong",
        }
    }

    /// Canonical bytes the authorization token commits to.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::SerializationError(e.to_string()))
    }
}

/// A versioned, authorized wire unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire format version
    pub version: u8,
    /// Anti-spam token covering the payload
    pub token: AuthToken,
    /// The application payload
    pub payload: Payload,
}

impl Envelope {
    /// Wraps a payload and its token into a current-version envelope.
    pub fn new(token: AuthToken, payload: Payload) -> Self {
        Self {
            version: WIRE_VERSION,
            token,
            payload,
        }
    }

    /// Serializes the envelope for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::SerializationError(e.to_string()))
    }

    /// Parses an envelope, rejecting unknown wire versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        let envelope: Envelope = bincode::deserialize(bytes)
            .map_err(|e| NetworkError::SerializationError(e.to_string()))?;
        if envelope.version != WIRE_VERSION {
            return Err(NetworkError::InvalidMessage(format!(
                "unknown wire version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}
