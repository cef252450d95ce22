//! Clear-net transport over plain TCP.

use crate::errors::NetworkError;
use crate::transport::{RawStream, Transport, TransportConfig, TransportListener};
use async_trait::async_trait;
use common::addressing::{Address, TransportKind};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// TCP transport for the clear-net substrate.
pub struct ClearNetTransport {
    config: TransportConfig,
    active: AtomicBool,
}

impl ClearNetTransport {
    /// Creates the transport; nothing is bound until a node listens.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            active: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for ClearNetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Clear
    }

    fn default_port(&self) -> u16 {
        self.config.default_port
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        // Clear-net has no bootstrap phase beyond marking the transport usable
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn listen(&self, port: u16) -> Result<TransportListener, NetworkError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(NetworkError::TransportError(
                "clear-net transport not initialized".to_string(),
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            NetworkError::TransportError(format!("bind failed on port {}: {}", port, e))
        })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| NetworkError::TransportError(e.to_string()))?
            .port();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        let address = Address::new(peer.ip().to_string(), peer.port());
                        let boxed: Box<dyn RawStream> = Box::new(stream);
                        if tx.send((boxed, address)).await.is_err() {
                            // Receiver gone: the node stopped listening
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        debug!("Listening on clear-net port {}", local_port);
        Ok(TransportListener {
            local_address: Address::localhost(local_port),
            incoming: rx,
        })
    }

    async fn dial(&self, address: &Address) -> Result<Box<dyn RawStream>, NetworkError> {
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| NetworkError::Unreachable(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    async fn shutdown(&self) -> bool {
        self.active.store(false, Ordering::SeqCst);
        true
    }
}
