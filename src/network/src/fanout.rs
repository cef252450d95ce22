//! Fan-out across all configured transports.

use crate::confidential::SendConfidentialResult;
use crate::connection::ConnectionId;
use crate::envelope::Payload;
use crate::errors::NetworkError;
use crate::node::{Node, NodeListener};
use crate::replication::StoreRegistry;
use crate::service_unit::{ServiceUnit, ServiceUnitConfig};
use common::addressing::{AddressByTransport, NetworkIdentity, TransportKind};
use common::keys::KeyBundle;
use futures::future::join_all;
use persistence::PersistenceService;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Outcome of one per-transport send attempt.
#[derive(Clone, Debug)]
pub enum SendOutcome {
    /// Queued on a live connection
    Sent(ConnectionId),
    /// The attempt failed
    Failed(String),
}

/// Per-transport outcomes of one logical send, built once per call.
pub type SendMessageResult = HashMap<TransportKind, SendOutcome>;

/// Per-transport outcomes of one confidential send.
pub type ConfidentialSendResult = HashMap<TransportKind, SendConfidentialResult>;

/// Runs one service unit per configured transport and presents them as one
/// network.
///
/// Initialization fans out independently per transport: a slow or failing
/// transport never blocks or fails the others. Operations that need full
/// multi-transport coverage go through `await_fully_initialized`.
pub struct TransportFanout {
    units: Mutex<HashMap<TransportKind, Arc<ServiceUnit>>>,
    supported: BTreeSet<TransportKind>,
    stores: Option<Arc<StoreRegistry>>,
}

impl TransportFanout {
    /// Builds one unit per configured transport. No network I/O happens
    /// here; only `create_default_node` and the initialize calls may block.
    pub fn new(
        configs: HashMap<TransportKind, ServiceUnitConfig>,
        persistence_service: PersistenceService,
        stores: Option<Arc<StoreRegistry>>,
    ) -> Arc<Self> {
        let mut units = HashMap::new();
        let mut supported = BTreeSet::new();
        for (kind, config) in configs {
            supported.insert(kind);
            units.insert(
                kind,
                ServiceUnit::new(config, persistence_service.clone(), stores.clone()),
            );
        }
        Arc::new(Self {
            units: Mutex::new(units),
            supported,
            stores,
        })
    }

    /// The transports this fanout manages.
    pub fn supported_transports(&self) -> &BTreeSet<TransportKind> {
        &self.supported
    }

    /// The unit for `kind`, if managed and not yet shut down.
    pub fn find_unit(&self, kind: TransportKind) -> Option<Arc<ServiceUnit>> {
        self.units.lock().unwrap().get(&kind).cloned()
    }

    /// The node for `identity` on `kind`, if one exists.
    pub fn find_node(&self, kind: TransportKind, identity: &NetworkIdentity) -> Option<Arc<Node>> {
        self.find_unit(kind)
            .and_then(|unit| unit.find_node(identity))
    }

    /// Starts (or returns) `identity`'s node on every transport, each in its
    /// own task. Callers decide per transport whether and how long to wait.
    pub fn initialize_node_for(
        &self,
        identity: &NetworkIdentity,
    ) -> HashMap<TransportKind, JoinHandle<Result<Arc<Node>, NetworkError>>> {
        let units = self.units.lock().unwrap().clone();
        units
            .into_iter()
            .map(|(kind, unit)| {
                let identity = identity.clone();
                let handle = tokio::spawn(async move {
                    if unit.default_node().is_none() {
                        unit.create_default_node(&identity).await
                    } else if unit.is_node_initialized(&identity) {
                        unit.find_node(&identity).ok_or_else(|| {
                            NetworkError::TransportError("initialized node disappeared".to_string())
                        })
                    } else {
                        unit.get_initialized_node(&identity).await
                    }
                });
                (kind, handle)
            })
            .collect()
    }

    /// Waits for every transport to finish initializing `identity` and
    /// returns all nodes. Any single failure fails the whole call; use
    /// `initialize_node_for` when partial coverage is acceptable.
    pub async fn await_fully_initialized(
        &self,
        identity: &NetworkIdentity,
    ) -> Result<Vec<Arc<Node>>, NetworkError> {
        let handles = self.initialize_node_for(identity);
        let mut nodes = Vec::new();
        for (kind, handle) in handles {
            match handle.await {
                Ok(Ok(node)) => nodes.push(node),
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(NetworkError::TransportError(format!(
                        "initialization task for {} failed: {}",
                        kind, e
                    )))
                }
            }
        }
        Ok(nodes)
    }

    /// Whether `identity` is initialized on every managed transport.
    pub fn is_fully_initialized(&self, identity: &NetworkIdentity) -> bool {
        let units = self.units.lock().unwrap();
        !units.is_empty()
            && units
                .values()
                .all(|unit| unit.is_node_initialized(identity))
    }

    /// Whether `identity` is initialized on the given transport.
    pub fn is_initialized_on(&self, kind: TransportKind, identity: &NetworkIdentity) -> bool {
        self.find_unit(kind)
            .map(|unit| unit.is_node_initialized(identity))
            .unwrap_or(false)
    }

    /// Confidential send over every transport present in both the receiver's
    /// address map and this fanout. Absent transports are skipped.
    pub async fn confidential_send(
        &self,
        body: Vec<u8>,
        receiver: &NetworkIdentity,
        sender_keys: &KeyBundle,
        sender_identity: &NetworkIdentity,
    ) -> ConfidentialSendResult {
        let units = self.units.lock().unwrap().clone();
        let mut result = ConfidentialSendResult::new();
        for (kind, address) in &receiver.addresses {
            if let Some(unit) = units.get(kind) {
                let outcome = match unit
                    .confidential_send(
                        body.clone(),
                        address,
                        receiver.pub_key,
                        sender_keys,
                        sender_identity,
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => SendConfidentialResult::Failed {
                        reason: e.to_string(),
                    },
                };
                result.insert(*kind, outcome);
            } else {
                debug!("Skipping unmanaged transport {}", kind);
            }
        }
        result
    }

    /// Plain send keyed off an explicit per-transport address map. Only
    /// transports managed here and present in `receiver` appear in the
    /// result; nothing is null-padded.
    pub async fn send(
        &self,
        sender: &NetworkIdentity,
        payload: Payload,
        receiver: &AddressByTransport,
    ) -> SendMessageResult {
        let units = self.units.lock().unwrap().clone();
        let mut result = SendMessageResult::new();
        for (kind, address) in receiver {
            if let Some(unit) = units.get(kind) {
                let outcome = match unit.send(sender, payload.clone(), address).await {
                    Ok(connection) => SendOutcome::Sent(connection.id()),
                    Err(e) => SendOutcome::Failed(e.to_string()),
                };
                result.insert(*kind, outcome);
            }
        }
        result
    }

    /// Forwards the transport-relevant slice of a seed's addresses to every
    /// managed unit.
    pub fn add_seed_node(&self, seed: &AddressByTransport) {
        let units = self.units.lock().unwrap().clone();
        for (kind, unit) in &units {
            if let Some(address) = seed.get(kind) {
                unit.add_seed_address(address.clone());
            }
        }
    }

    /// Removes a seed's addresses from every managed unit.
    pub fn remove_seed_node(&self, seed: &AddressByTransport) {
        let units = self.units.lock().unwrap().clone();
        for (kind, unit) in &units {
            if let Some(address) = seed.get(kind) {
                unit.remove_seed_address(address);
            }
        }
    }

    /// Registers a traffic listener on every managed unit.
    pub fn add_message_listener(&self, listener: Arc<dyn NodeListener>) {
        let units = self.units.lock().unwrap().clone();
        for unit in units.values() {
            unit.add_message_listener(listener.clone());
        }
    }

    /// Removes a traffic listener from every managed unit.
    pub fn remove_message_listener(&self, listener: &Arc<dyn NodeListener>) {
        let units = self.units.lock().unwrap().clone();
        for unit in units.values() {
            unit.remove_message_listener(listener);
        }
    }

    /// Concurrently stops every unit and flushes the shared stores, then
    /// clears local bookkeeping regardless of the outcome.
    pub async fn shutdown(&self) -> bool {
        let units: Vec<Arc<ServiceUnit>> = self.units.lock().unwrap().values().cloned().collect();
        let results = join_all(units.iter().map(|unit| unit.shutdown())).await;
        let stores_ok = match &self.stores {
            Some(stores) => stores.shutdown(),
            None => true,
        };
        self.units.lock().unwrap().clear();
        results.into_iter().all(|ok| ok) && stores_ok
    }
}
