//! Ed25519 key handling for identities, envelopes and records.

use crate::addressing::PubKey;
use crate::errors::CommonError;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An Ed25519 keypair used for signing envelopes and records.
pub struct KeyBundle {
    keypair: Keypair,
}

impl KeyBundle {
    /// Generates a bundle from fresh random seed bytes.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let secret = SecretKey::from_bytes(&seed).expect("32-byte seed is always valid");
        let public = PublicKey::from(&secret);
        Self {
            keypair: Keypair { secret, public },
        }
    }

    /// Restores a bundle from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CommonError> {
        let secret =
            SecretKey::from_bytes(seed).map_err(|e| CommonError::InvalidKey(e.to_string()))?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            keypair: Keypair { secret, public },
        })
    }

    /// The public half as raw bytes.
    pub fn pub_key(&self) -> PubKey {
        PubKey(self.keypair.public.to_bytes())
    }

    /// Signs a message, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).to_bytes().to_vec()
    }
}

/// Verifies an Ed25519 signature against raw public key bytes.
pub fn verify_signature(pub_key: &PubKey, message: &[u8], signature: &[u8]) -> bool {
    let public = match PublicKey::from_bytes(&pub_key.0) {
        Ok(public) => public,
        Err(_) => return false,
    };
    let signature = match Signature::from_bytes(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    public.verify(message, &signature).is_ok()
}

/// Tag-keyed keyring handing out stable key bundles per identity tag.
#[derive(Default)]
pub struct KeyRing {
    bundles: Mutex<HashMap<String, Arc<KeyBundle>>>,
}

impl KeyRing {
    /// Creates an empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bundle for `tag`, generating one on first use.
    pub fn get_or_generate(&self, tag: &str) -> Arc<KeyBundle> {
        let mut bundles = self.bundles.lock().unwrap();
        bundles
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(KeyBundle::generate()))
            .clone()
    }
}
