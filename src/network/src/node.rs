//! Per-identity transport endpoints.

use crate::authorization::AuthorizationGate;
use crate::connection::{CloseReason, Connection, ConnectionId};
use crate::envelope::{Envelope, Payload};
use crate::errors::NetworkError;
use crate::peer_group::BanList;
use crate::transport::Transport;
use common::addressing::{Address, NetworkIdentity, TransportKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, warn};

/// Observer of one node's traffic.
pub trait NodeListener: Send + Sync {
    /// Called for every authorized inbound payload.
    fn on_message(&self, payload: &Payload, connection: &Connection, identity: &NetworkIdentity);

    /// Called when a connection is established.
    fn on_connection(&self, _connection: &Connection) {}

    /// Called when a connection goes away.
    fn on_disconnect(&self, _connection_id: ConnectionId, _reason: CloseReason) {}
}

type InboundSender = mpsc::UnboundedSender<(Connection, Envelope)>;
type ClosedSender = mpsc::UnboundedSender<(ConnectionId, CloseReason)>;

/// One live endpoint binding an identity to a transport.
///
/// A node listens on its identity's port for this transport, admits inbound
/// envelopes through the authorization gate and the ban list, and reuses one
/// outbound connection per peer address.
pub struct Node {
    identity: NetworkIdentity,
    transport: Arc<dyn Transport>,
    gate: Arc<dyn AuthorizationGate>,
    ban_list: BanList,
    listeners: Mutex<Vec<Arc<dyn NodeListener>>>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    bound_address: Mutex<Option<Address>>,
    wires: Mutex<Option<(InboundSender, ClosedSender)>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    init: OnceCell<()>,
}

impl Node {
    /// Creates a node. Nothing is bound until `ensure_initialized`.
    pub fn new(
        identity: NetworkIdentity,
        transport: Arc<dyn Transport>,
        gate: Arc<dyn AuthorizationGate>,
        ban_list: BanList,
        listeners: Vec<Arc<dyn NodeListener>>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            identity,
            transport,
            gate,
            ban_list,
            listeners: Mutex::new(listeners),
            connections: Mutex::new(HashMap::new()),
            bound_address: Mutex::new(None),
            wires: Mutex::new(None),
            stop_tx,
            stop_rx,
            init: OnceCell::new(),
        }
    }

    /// The identity this node serves.
    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }

    /// The transport kind this node is bound to.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// The address the node is actually listening on, once initialized.
    pub fn address(&self) -> Option<Address> {
        self.bound_address.lock().unwrap().clone()
    }

    /// Whether initialization has completed.
    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Binds the listener and starts the accept and dispatch tasks.
    ///
    /// Idempotent: concurrent and repeated calls share one initialization.
    pub async fn ensure_initialized(self: Arc<Self>) -> Result<(), NetworkError> {
        let node = Arc::clone(&self);
        self.init
            .get_or_try_init(|| async move { node.start_listening().await })
            .await?;
        Ok(())
    }

    async fn start_listening(self: Arc<Self>) -> Result<(), NetworkError> {
        let port = self
            .identity
            .address_for(self.transport.kind())
            .map(|address| address.port)
            .unwrap_or_else(|| self.transport.default_port());
        let listener = self.transport.listen(port).await?;
        let local_address = listener.local_address;
        let mut incoming = listener.incoming;
        *self.bound_address.lock().unwrap() = Some(local_address.clone());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        *self.wires.lock().unwrap() = Some((inbound_tx.clone(), closed_tx.clone()));

        // Accept loop: admit streams and register their connections
        let node = Arc::clone(&self);
        let mut stop = self.stop_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = incoming.recv() => match accepted {
                        Some((stream, peer_address)) => {
                            if node.ban_list.is_banned(&peer_address) {
                                debug!("Rejecting banned peer {}", peer_address);
                                continue;
                            }
                            let connection = Connection::spawn(
                                stream,
                                peer_address,
                                inbound_tx.clone(),
                                closed_tx.clone(),
                            );
                            node.register_connection(connection);
                        }
                        None => break,
                    },
                }
            }
        });

        // Inbound pump: authorize and dispatch payloads
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.pump_inbound(inbound_rx).await });

        // Close pump: drop finished connections and notify listeners
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.pump_closed(closed_rx).await });

        debug!(
            "Node {} listening on {} ({})",
            self.identity.short_id(),
            local_address,
            self.transport.kind()
        );
        Ok(())
    }

    async fn pump_inbound(&self, mut rx: mpsc::UnboundedReceiver<(Connection, Envelope)>) {
        while let Some((connection, envelope)) = rx.recv().await {
            let payload_bytes = match envelope.payload.canonical_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping inbound payload: {}", e);
                    continue;
                }
            };
            if !self.gate.verify(&envelope.token, &payload_bytes) {
                warn!(
                    "Dropping {} from {}: authorization failed",
                    envelope.payload.name(),
                    connection.peer_address()
                );
                continue;
            }
            if let Payload::Ping { nonce } = envelope.payload {
                self.reply(&connection, Payload::Pong { nonce });
            }
            let listeners = self.listeners.lock().unwrap().clone();
            for listener in listeners {
                listener.on_message(&envelope.payload, &connection, &self.identity);
            }
        }
    }

    async fn pump_closed(&self, mut rx: mpsc::UnboundedReceiver<(ConnectionId, CloseReason)>) {
        while let Some((connection_id, reason)) = rx.recv().await {
            self.connections.lock().unwrap().remove(&connection_id);
            let listeners = self.listeners.lock().unwrap().clone();
            for listener in listeners {
                listener.on_disconnect(connection_id, reason);
            }
        }
    }

    fn reply(&self, connection: &Connection, payload: Payload) {
        match payload.canonical_bytes() {
            Ok(bytes) => {
                let token = self.gate.create_token(&bytes);
                if let Err(e) = connection.send(Envelope::new(token, payload)) {
                    debug!("Reply failed: {}", e);
                }
            }
            Err(e) => warn!("Could not encode reply: {}", e),
        }
    }

    fn register_connection(&self, connection: Connection) {
        self.connections
            .lock()
            .unwrap()
            .insert(connection.id(), connection.clone());
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_connection(&connection);
        }
    }

    fn find_connection(&self, address: &Address) -> Option<Connection> {
        self.connections
            .lock()
            .unwrap()
            .values()
            .find(|connection| connection.peer_address() == address)
            .cloned()
    }

    /// Sends a payload to `address`, reusing an existing connection when one
    /// is open. Returns the connection the payload was queued on.
    ///
    /// Delivery failures are returned to the caller; there is no retry.
    pub async fn send(&self, payload: Payload, address: &Address) -> Result<Connection, NetworkError> {
        let connection = match self.find_connection(address) {
            Some(connection) => connection,
            None => self.open_connection(address).await?,
        };
        let token = self.gate.create_token(&payload.canonical_bytes()?);
        connection.send(Envelope::new(token, payload))?;
        Ok(connection)
    }

    async fn open_connection(&self, address: &Address) -> Result<Connection, NetworkError> {
        let (inbound_tx, closed_tx) = self
            .wires
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| NetworkError::TransportError("node not initialized".to_string()))?;
        let stream = self.transport.dial(address).await?;
        let connection = Connection::spawn(stream, address.clone(), inbound_tx, closed_tx);
        self.register_connection(connection.clone());
        Ok(connection)
    }

    /// Registers a traffic listener.
    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, listener: &Arc<dyn NodeListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Stops accepting, drops all connections and refuses further sends.
    pub async fn shutdown(&self) -> bool {
        let _ = self.stop_tx.send(true);
        self.wires.lock().unwrap().take();
        self.connections.lock().unwrap().clear();
        true
    }
}
