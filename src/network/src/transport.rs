//! Transport abstraction over the supported network substrates.

use crate::errors::NetworkError;
use async_trait::async_trait;
use common::addressing::{Address, TransportKind};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A bidirectional byte stream produced by a transport.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// An accepted stream together with the dialing peer's address.
pub type InboundStream = (Box<dyn RawStream>, Address);

/// A bound listener accepting inbound streams for one node.
pub struct TransportListener {
    /// The address the listener is reachable under
    pub local_address: Address,
    /// Channel of accepted streams
    pub incoming: mpsc::Receiver<InboundStream>,
}

/// One concrete network substrate (clear-net, onion-routed, ...).
///
/// Framing and message semantics live above this seam; a transport only
/// moves bytes and owns its own bootstrap and teardown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The kind this transport implements.
    fn kind(&self) -> TransportKind;

    /// The port the default node listens on.
    fn default_port(&self) -> u16;

    /// Bootstraps the transport. Must complete before any node binds.
    async fn initialize(&self) -> Result<(), NetworkError>;

    /// Binds a listener on the given port (0 picks an ephemeral port).
    async fn listen(&self, port: u16) -> Result<TransportListener, NetworkError>;

    /// Opens an outbound stream to a peer address.
    async fn dial(&self, address: &Address) -> Result<Box<dyn RawStream>, NetworkError>;

    /// Tears the transport down. Returns whether teardown succeeded.
    async fn shutdown(&self) -> bool;
}

/// Per-transport settings fed into a service unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Default listening port for the default node
    pub default_port: u16,
    /// Socket timeout in milliseconds
    pub socket_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_port: 8885,
            socket_timeout_ms: 120_000,
        }
    }
}
