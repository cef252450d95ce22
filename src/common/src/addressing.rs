//! Addressing primitives: transport kinds, addresses and network identities.

use crate::errors::CommonError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The transport substrates a node can be reached over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Plain TCP over the public internet
    Clear,
    /// Onion-routed via Tor hidden services
    Tor,
    /// Garlic-routed via I2P
    I2p,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Clear => write!(f, "clear"),
            TransportKind::Tor => write!(f, "tor"),
            TransportKind::I2p => write!(f, "i2p"),
        }
    }
}

/// A host/port endpoint on one transport.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Host name, IP or onion address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Address {
    /// Creates an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Convenience constructor for loopback addresses.
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CommonError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(CommonError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CommonError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Addresses of one identity, keyed by transport kind.
pub type AddressByTransport = BTreeMap<TransportKind, Address>;

/// Raw Ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PubKey(pub [u8; 32]);

impl PubKey {
    /// Short hex tag used in logs and store keys.
    pub fn id(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.id())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// An addressable endpoint: a public key plus one address per transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// The identity's public key
    pub pub_key: PubKey,
    /// One address per transport the identity is reachable over
    pub addresses: AddressByTransport,
}

impl NetworkIdentity {
    /// Creates an identity from a key and its per-transport addresses.
    pub fn new(pub_key: PubKey, addresses: AddressByTransport) -> Self {
        Self { pub_key, addresses }
    }

    /// The identity's address on the given transport, if any.
    pub fn address_for(&self, kind: TransportKind) -> Option<&Address> {
        self.addresses.get(&kind)
    }

    /// Short tag used in logs.
    pub fn short_id(&self) -> String {
        self.pub_key.id()
    }
}
