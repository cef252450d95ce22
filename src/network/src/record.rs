//! Replicated record model: authenticated, expiring, content-keyed data.

use crate::errors::NetworkError;
use common::addressing::PubKey;
use common::keys::{verify_signature, KeyBundle};
use common::time::now_millis;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Record bound for stores whose class declares none.
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Store ids of every record class, in declaration order.
pub const STORE_IDS: [&str; 3] = ["offer_listing", "user_profile", "mailbox"];

/// Bounds declared by a record's data class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
    /// Maximum number of live records of this class per store
    pub max_records: usize,
}

/// The replicated data classes of the trading network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPayload {
    /// A tradable offer published to the network
    OfferListing {
        /// Market identifier, e.g. "BTC/EUR"
        market: String,
        /// Serialized offer details
        details: Vec<u8>,
    },
    /// A user profile announcement
    UserProfile {
        /// Display nickname
        nick_name: String,
        /// Serialized profile details
        details: Vec<u8>,
    },
    /// A mailbox entry held for an offline receiver
    MailboxEntry {
        /// Key of the intended receiver
        receiver_key: PubKey,
        /// Sealed message
        sealed: Vec<u8>,
    },
}

impl RecordPayload {
    /// Class-declared bounds.
    pub fn default_meta(&self) -> RecordMeta {
        match self {
            RecordPayload::OfferListing { .. } => RecordMeta {
                ttl_ms: 30 * 60 * 1000,
                max_records: 10_000,
            },
            RecordPayload::UserProfile { .. } => RecordMeta {
                ttl_ms: 15 * 24 * 60 * 60 * 1000,
                max_records: 10_000,
            },
            RecordPayload::MailboxEntry { .. } => RecordMeta {
                ttl_ms: 10 * 24 * 60 * 60 * 1000,
                max_records: 1_000,
            },
        }
    }

    /// The store this payload's class persists into.
    pub fn store_id(&self) -> &'static str {
        match self {
            RecordPayload::OfferListing { .. } => "offer_listing",
            RecordPayload::UserProfile { .. } => "user_profile",
            RecordPayload::MailboxEntry { .. } => "mailbox",
        }
    }

    /// Canonical bytes the content key and signature commit to.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::SerializationError(e.to_string()))
    }
}

/// Content-derived key of a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey(pub [u8; 32]);

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// One immutable, signed, expiring unit of replicated data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The data itself
    pub payload: RecordPayload,
    /// Bounds declared by the payload's class
    pub meta: RecordMeta,
    /// Creation wall-clock time in milliseconds
    pub created_at_ms: u64,
    /// Public key of the creator
    pub signer: PubKey,
    /// Ed25519 signature over the payload bytes and creation time
    pub signature: Vec<u8>,
}

impl Record {
    /// Creates and signs a record with its class-default bounds.
    pub fn new(payload: RecordPayload, keys: &KeyBundle) -> Result<Self, NetworkError> {
        let meta = payload.default_meta();
        Self::with_meta(payload, meta, now_millis(), keys)
    }

    /// Creates and signs a record with explicit bounds and creation time.
    pub fn with_meta(
        payload: RecordPayload,
        meta: RecordMeta,
        created_at_ms: u64,
        keys: &KeyBundle,
    ) -> Result<Self, NetworkError> {
        let message = signing_bytes(&payload, created_at_ms)?;
        let signature = keys.sign(&message);
        Ok(Self {
            payload,
            meta,
            created_at_ms,
            signer: keys.pub_key(),
            signature,
        })
    }

    /// The content-derived key: SHA-256 over the canonical payload bytes.
    pub fn key(&self) -> Result<RecordKey, NetworkError> {
        let bytes = self.payload.canonical_bytes()?;
        let digest = Sha256::digest(&bytes);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(RecordKey(key))
    }

    /// Verifies the creator's signature.
    pub fn verify(&self) -> Result<(), NetworkError> {
        let message = signing_bytes(&self.payload, self.created_at_ms)?;
        if verify_signature(&self.signer, &message, &self.signature) {
            Ok(())
        } else {
            Err(NetworkError::InvalidRecord(
                "signature check failed".to_string(),
            ))
        }
    }

    /// Whether the record's TTL has elapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.meta.ttl_ms
    }
}

fn signing_bytes(payload: &RecordPayload, created_at_ms: u64) -> Result<Vec<u8>, NetworkError> {
    let mut bytes = payload.canonical_bytes()?;
    bytes.extend_from_slice(&created_at_ms.to_le_bytes());
    Ok(bytes)
}
