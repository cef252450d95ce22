//! Proof-of-work admission gate for overlay messages.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default difficulty: leading zero bits required in the work hash.
pub const DEFAULT_DIFFICULTY: u32 = 8;

/// Anti-spam token attached to every envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Nonce found by the worker
    pub counter: u64,
    /// Difficulty the token claims to satisfy
    pub difficulty: u32,
}

/// Validates and attaches anti-spam tokens per message.
pub trait AuthorizationGate: Send + Sync {
    /// Produces a token covering the given payload bytes.
    fn create_token(&self, payload: &[u8]) -> AuthToken;

    /// Checks an inbound token against the payload it arrived with.
    fn verify(&self, token: &AuthToken, payload: &[u8]) -> bool;
}

/// SHA-256 partial pre-image proof-of-work.
pub struct HashCashGate {
    difficulty: u32,
}

impl HashCashGate {
    /// Creates a gate requiring `difficulty` leading zero bits.
    pub fn new(difficulty: u32) -> Self {
        Self { difficulty }
    }

    fn work_hash(counter: u64, payload: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(payload);
        hasher.finalize().into()
    }

    fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
        let mut bits = 0;
        for byte in hash {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

impl AuthorizationGate for HashCashGate {
    fn create_token(&self, payload: &[u8]) -> AuthToken {
        let mut counter = 0u64;
        loop {
            let hash = Self::work_hash(counter, payload);
            if Self::leading_zero_bits(&hash) >= self.difficulty {
                return AuthToken {
                    counter,
                    difficulty: self.difficulty,
                };
            }
            counter += 1;
        }
    }

    fn verify(&self, token: &AuthToken, payload: &[u8]) -> bool {
        // Underpriced tokens are rejected outright
        if token.difficulty < self.difficulty {
            return false;
        }
        let hash = Self::work_hash(token.counter, payload);
        Self::leading_zero_bits(&hash) >= token.difficulty
    }
}
