//! Per-transport composition root and its lifecycle.

use crate::authorization::AuthorizationGate;
use crate::confidential::{
    ConfidentialDeliveryService, ConfidentialMessageListener, ConfidentialRouter,
    SendConfidentialResult,
};
use crate::connection::Connection;
use crate::envelope::Payload;
use crate::errors::NetworkError;
use crate::monitor::NetworkLoadMonitor;
use crate::node::{Node, NodeListener};
use crate::peer_group::{BanList, PeerGroupConfig, PeerGroupManager};
use crate::registry::NodeRegistry;
use crate::replication::{DataReplicationService, StoreRegistry};
use crate::transport::Transport;
use common::addressing::{Address, NetworkIdentity, PubKey, TransportKind};
use common::keys::KeyBundle;
use persistence::PersistenceService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// The optional services a unit can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Peer-group membership
    PeerGroup,
    /// Record replication
    DataReplication,
    /// Confidential point-to-point delivery
    ConfidentialDelivery,
    /// Delivery acknowledgements
    Acknowledgement,
    /// Network load monitoring
    Monitoring,
}

/// Immutable set of enabled services.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSet(BTreeSet<ServiceKind>);

impl ServiceSet {
    /// The full service set of a regular trading node.
    pub fn all() -> Self {
        Self::from_kinds([
            ServiceKind::PeerGroup,
            ServiceKind::DataReplication,
            ServiceKind::ConfidentialDelivery,
            ServiceKind::Acknowledgement,
            ServiceKind::Monitoring,
        ])
    }

    /// Builds a set from the given kinds.
    pub fn from_kinds(kinds: impl IntoIterator<Item = ServiceKind>) -> Self {
        Self(kinds.into_iter().collect())
    }

    /// Whether the kind is enabled.
    pub fn contains(&self, kind: ServiceKind) -> bool {
        self.0.contains(&kind)
    }
}

/// Lifecycle states of a service unit, in rank order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    New,
    InitializingTransport,
    TransportReady,
    InitializingDefaultNode,
    DefaultNodeReady,
    InitializingPeerGroup,
    PeerGroupReady,
    Stopping,
    Terminated,
}

impl UnitState {
    /// Position in the lifecycle. Transitions must strictly increase it.
    pub fn rank(self) -> u8 {
        match self {
            UnitState::New => 0,
            UnitState::InitializingTransport => 1,
            UnitState::TransportReady => 2,
            UnitState::InitializingDefaultNode => 3,
            UnitState::DefaultNodeReady => 4,
            UnitState::InitializingPeerGroup => 5,
            UnitState::PeerGroupReady => 6,
            UnitState::Stopping => 7,
            UnitState::Terminated => 8,
        }
    }
}

/// Observer of unit lifecycle transitions.
pub trait UnitStateListener: Send + Sync {
    /// Called off the transitioning task for every state change.
    fn on_state_changed(&self, state: UnitState);
}

/// Everything needed to assemble one transport's unit.
pub struct ServiceUnitConfig {
    /// Services to enable
    pub service_set: ServiceSet,
    /// The transport this unit runs on
    pub transport: Arc<dyn Transport>,
    /// Admission gate shared by this unit's nodes
    pub gate: Arc<dyn AuthorizationGate>,
    /// Seed addresses for the peer group
    pub seed_addresses: BTreeSet<Address>,
    /// Peer group tuning
    pub peer_group: PeerGroupConfig,
    /// Bound on the concurrent delegate-shutdown phase
    pub shutdown_timeout: Duration,
}

/// Composition root owning one transport's services and their lifecycle.
///
/// `create_default_node` builds the configured services around the default
/// node and runs transport, node and peer-group initialization strictly in
/// that order; `shutdown` stops the delegates concurrently, then tears the
/// transport down unconditionally.
pub struct ServiceUnit {
    kind: TransportKind,
    service_set: ServiceSet,
    transport: Arc<dyn Transport>,
    gate: Arc<dyn AuthorizationGate>,
    registry: Arc<NodeRegistry>,
    ban_list: BanList,
    persistence_service: PersistenceService,
    stores: Option<Arc<StoreRegistry>>,
    seed_addresses: BTreeSet<Address>,
    peer_group_config: PeerGroupConfig,
    shutdown_timeout: Duration,
    state: Mutex<UnitState>,
    state_listeners: Arc<Mutex<Vec<Arc<dyn UnitStateListener>>>>,
    dispatcher: Mutex<Option<tokio::sync::mpsc::UnboundedSender<UnitState>>>,
    default_node: Mutex<Option<Arc<Node>>>,
    peer_group: Mutex<Option<Arc<PeerGroupManager>>>,
    replication: Mutex<Option<Arc<DataReplicationService>>>,
    confidential: Mutex<Option<Arc<ConfidentialDeliveryService>>>,
    monitor: Option<Arc<NetworkLoadMonitor>>,
    lifecycle_lock: tokio::sync::Mutex<()>,
}

impl ServiceUnit {
    /// Assembles a unit. No network I/O happens here.
    pub fn new(
        config: ServiceUnitConfig,
        persistence_service: PersistenceService,
        stores: Option<Arc<StoreRegistry>>,
    ) -> Arc<Self> {
        let ban_list = BanList::new();
        let registry = Arc::new(NodeRegistry::new(
            config.transport.clone(),
            config.gate.clone(),
            ban_list.clone(),
        ));

        let monitor = if config.service_set.contains(ServiceKind::Monitoring) {
            let monitor = Arc::new(NetworkLoadMonitor::new());
            let listener: Arc<dyn NodeListener> = monitor.clone();
            registry.add_node_listener(listener);
            Some(monitor)
        } else {
            None
        };

        Arc::new(Self {
            kind: config.transport.kind(),
            service_set: config.service_set,
            transport: config.transport,
            gate: config.gate,
            registry,
            ban_list,
            persistence_service,
            stores,
            seed_addresses: config.seed_addresses,
            peer_group_config: config.peer_group,
            shutdown_timeout: config.shutdown_timeout,
            state: Mutex::new(UnitState::New),
            state_listeners: Arc::new(Mutex::new(Vec::new())),
            dispatcher: Mutex::new(None),
            default_node: Mutex::new(None),
            peer_group: Mutex::new(None),
            replication: Mutex::new(None),
            confidential: Mutex::new(None),
            monitor,
            lifecycle_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The transport kind this unit runs on.
    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// The current lifecycle state.
    pub fn state(&self) -> UnitState {
        *self.state.lock().unwrap()
    }

    /// The load monitor, when the Monitoring service is enabled.
    pub fn monitor(&self) -> Option<&Arc<NetworkLoadMonitor>> {
        self.monitor.as_ref()
    }

    /// The ban list shared by this unit's nodes.
    pub fn ban_list(&self) -> &BanList {
        &self.ban_list
    }

    /// Builds the default node and the services the configured set implies,
    /// then initializes transport, node and peer group strictly in order.
    ///
    /// Idempotent per unit: repeated calls return the node created first.
    /// A failure propagates to the caller and leaves the unit unusable.
    pub async fn create_default_node(
        &self,
        identity: &NetworkIdentity,
    ) -> Result<Arc<Node>, NetworkError> {
        let _guard = self.lifecycle_lock.lock().await;
        if let Some(node) = self.default_node.lock().unwrap().clone() {
            return Ok(node);
        }

        let node = self.registry.get_or_create(identity);

        if self.service_set.contains(ServiceKind::PeerGroup) {
            let manager = Arc::new(PeerGroupManager::new(
                &self.persistence_service,
                node.clone(),
                self.ban_list.clone(),
                self.peer_group_config.clone(),
                self.seed_addresses.clone(),
            ));
            *self.peer_group.lock().unwrap() = Some(manager);
        }

        if self.service_set.contains(ServiceKind::DataReplication) {
            let peer_group = self.peer_group.lock().unwrap().clone();
            match (peer_group, &self.stores) {
                (Some(group), Some(stores)) => {
                    *self.replication.lock().unwrap() = Some(DataReplicationService::new(
                        node.clone(),
                        group,
                        stores.clone(),
                    ));
                }
                (None, _) => warn!(
                    "Data replication requested without peer group on {}; disabled",
                    self.kind
                ),
                (_, None) => warn!(
                    "Data replication requested without a store registry on {}; disabled",
                    self.kind
                ),
            }
        }

        if self.service_set.contains(ServiceKind::ConfidentialDelivery) {
            let track_acks = self.service_set.contains(ServiceKind::Acknowledgement);
            let service = Arc::new(ConfidentialDeliveryService::new(
                self.registry.clone(),
                track_acks,
            ));
            self.registry.add_node_listener(Arc::new(ConfidentialRouter::new(
                service.clone(),
                self.gate.clone(),
            )));
            *self.confidential.lock().unwrap() = Some(service);
        }

        self.initialize_transport().await?;
        self.initialize_default_node(&node).await?;
        self.initialize_peer_group().await?;

        *self.default_node.lock().unwrap() = Some(node.clone());
        Ok(node)
    }

    async fn initialize_transport(&self) -> Result<(), NetworkError> {
        self.set_state(UnitState::InitializingTransport);
        self.transport.initialize().await?;
        self.set_state(UnitState::TransportReady);
        Ok(())
    }

    async fn initialize_default_node(&self, node: &Arc<Node>) -> Result<(), NetworkError> {
        self.set_state(UnitState::InitializingDefaultNode);
        node.clone().ensure_initialized().await?;
        self.set_state(UnitState::DefaultNodeReady);
        Ok(())
    }

    async fn initialize_peer_group(&self) -> Result<(), NetworkError> {
        let peer_group = self.peer_group.lock().unwrap().clone();
        if let Some(group) = peer_group {
            self.set_state(UnitState::InitializingPeerGroup);
            group.initialize().await?;
            self.set_state(UnitState::PeerGroupReady);
        }
        Ok(())
    }

    /// The default node, once `create_default_node` has completed.
    pub fn default_node(&self) -> Option<Arc<Node>> {
        self.default_node.lock().unwrap().clone()
    }

    /// Returns an initialized node for `identity` on this transport.
    pub async fn get_initialized_node(
        &self,
        identity: &NetworkIdentity,
    ) -> Result<Arc<Node>, NetworkError> {
        self.registry.get_initialized(identity).await
    }

    /// Whether `identity` has a fully initialized node here.
    pub fn is_node_initialized(&self, identity: &NetworkIdentity) -> bool {
        self.registry.is_initialized(identity)
    }

    /// The node for `identity`, if one exists.
    pub fn find_node(&self, identity: &NetworkIdentity) -> Option<Arc<Node>> {
        self.registry.find(identity)
    }

    /// The replication service, when configured and enabled.
    pub fn replication(&self) -> Option<Arc<DataReplicationService>> {
        self.replication.lock().unwrap().clone()
    }

    /// The confidential-delivery service, when enabled.
    pub fn confidential(&self) -> Option<Arc<ConfidentialDeliveryService>> {
        self.confidential.lock().unwrap().clone()
    }

    /// Sends a payload from `sender`'s node on this transport.
    pub async fn send(
        &self,
        sender: &NetworkIdentity,
        payload: Payload,
        address: &Address,
    ) -> Result<Connection, NetworkError> {
        self.registry.send(sender, payload, address).await
    }

    /// Confidential send. Fails with `ServiceNotSupported` when the
    /// confidential-delivery service is not part of the configured set.
    pub async fn confidential_send(
        &self,
        body: Vec<u8>,
        address: &Address,
        receiver_key: PubKey,
        sender_keys: &KeyBundle,
        sender_identity: &NetworkIdentity,
    ) -> Result<SendConfidentialResult, NetworkError> {
        let service = self
            .confidential
            .lock()
            .unwrap()
            .clone()
            .ok_or(NetworkError::ServiceNotSupported("confidential delivery"))?;
        Ok(service
            .send(body, address, receiver_key, sender_keys, sender_identity)
            .await)
    }

    /// Forwards a seed address to the peer group; no-op without one.
    pub fn add_seed_address(&self, address: Address) {
        if let Some(group) = self.peer_group.lock().unwrap().clone() {
            group.add_seed(address);
        }
    }

    /// Removes a seed address from the peer group; no-op without one.
    pub fn remove_seed_address(&self, address: &Address) {
        if let Some(group) = self.peer_group.lock().unwrap().clone() {
            group.remove_seed(address);
        }
    }

    /// Registers a confidential-message listener; no-op without the service.
    pub fn add_confidential_listener(&self, listener: Arc<dyn ConfidentialMessageListener>) {
        if let Some(service) = self.confidential.lock().unwrap().clone() {
            service.add_listener(listener);
        }
    }

    /// Registers a traffic listener on all of this unit's nodes.
    pub fn add_message_listener(&self, listener: Arc<dyn NodeListener>) {
        self.registry.add_node_listener(listener);
    }

    /// Removes a previously registered traffic listener.
    pub fn remove_message_listener(&self, listener: &Arc<dyn NodeListener>) {
        self.registry.remove_node_listener(listener);
    }

    /// Registers a lifecycle listener.
    pub fn add_state_listener(&self, listener: Arc<dyn UnitStateListener>) {
        self.state_listeners.lock().unwrap().push(listener);
    }

    /// Removes a lifecycle listener.
    pub fn remove_state_listener(&self, listener: &Arc<dyn UnitStateListener>) {
        self.state_listeners
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Stops the delegates concurrently, bounded by the configured timeout,
    /// then unconditionally tears the transport down.
    ///
    /// Safe to call repeatedly; once terminated further calls are no-ops.
    pub async fn shutdown(&self) -> bool {
        let _guard = self.lifecycle_lock.lock().await;
        if *self.state.lock().unwrap() == UnitState::Terminated {
            return true;
        }
        self.set_state(UnitState::Stopping);

        let confidential = self.confidential.lock().unwrap().take();
        let peer_group = self.peer_group.lock().unwrap().take();
        let replication = self.replication.lock().unwrap().take();

        let delegates = async {
            let (confidential_ok, peer_group_ok, replication_ok, registry_ok) = tokio::join!(
                async {
                    match confidential {
                        Some(service) => service.shutdown().await,
                        None => true,
                    }
                },
                async {
                    match peer_group {
                        Some(group) => group.shutdown().await,
                        None => true,
                    }
                },
                async {
                    match replication {
                        Some(service) => service.shutdown().await,
                        None => true,
                    }
                },
                self.registry.shutdown(),
            );
            confidential_ok && peer_group_ok && replication_ok && registry_ok
        };

        let delegates_ok = match timeout(self.shutdown_timeout, delegates).await {
            Ok(ok) => ok,
            Err(_) => {
                warn!("Delegate shutdown timed out on {}", self.kind);
                false
            }
        };

        // The transport teardown runs regardless of the delegate outcome
        let transport_ok = self.transport.shutdown().await;
        self.set_state(UnitState::Terminated);
        delegates_ok && transport_ok
    }

    fn set_state(&self, new_state: UnitState) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == new_state {
                return;
            }
            assert!(
                state.rank() < new_state.rank(),
                "state must not regress: {:?} -> {:?}",
                *state,
                new_state
            );
            *state = new_state;
        }
        info!("{} service unit state: {:?}", self.kind, new_state);
        self.dispatch(new_state);
    }

    /// Queues a state notification on the dispatcher task, so listeners run
    /// off the transitioning task and observe transitions in order.
    fn dispatch(&self, state: UnitState) {
        let mut dispatcher = self.dispatcher.lock().unwrap();
        if dispatcher.is_none() {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<UnitState>();
            let listeners = self.state_listeners.clone();
            tokio::spawn(async move {
                while let Some(state) = rx.recv().await {
                    let current = listeners.lock().unwrap().clone();
                    for listener in current {
                        listener.on_state_changed(state);
                    }
                }
            });
            *dispatcher = Some(tx);
        }
        if let Some(tx) = dispatcher.as_ref() {
            let _ = tx.send(state);
        }
    }
}
