//! Record replication across the peer group of one transport.

use crate::envelope::Payload;
use crate::errors::NetworkError;
use crate::node::{Node, NodeListener};
use crate::peer_group::PeerGroupManager;
use crate::record::{Record, RecordKey, STORE_IDS};
use crate::store::{AddOutcome, StoreService};
use common::addressing::NetworkIdentity;
use futures::future::join_all;
use persistence::PersistenceService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// All record-class stores, shared across transports.
pub struct StoreRegistry {
    stores: HashMap<&'static str, Arc<StoreService>>,
}

impl StoreRegistry {
    /// Loads one store per record class.
    pub fn load(persistence_service: &PersistenceService, write_interval: Duration) -> Arc<Self> {
        let mut stores = HashMap::new();
        for store_id in STORE_IDS {
            stores.insert(
                store_id,
                StoreService::load(persistence_service, store_id, write_interval),
            );
        }
        Arc::new(Self { stores })
    }

    /// The store holding the given payload's class.
    pub fn store_for(&self, record: &Record) -> &Arc<StoreService> {
        self.stores
            .get(record.payload.store_id())
            .expect("every record class has a store")
    }

    /// The store with the given id, if any.
    pub fn store(&self, store_id: &str) -> Option<&Arc<StoreService>> {
        self.stores.get(store_id)
    }

    /// Flushes every store. True if all writes succeeded.
    pub fn shutdown(&self) -> bool {
        self.stores.values().all(|store| store.shutdown())
    }
}

/// Aggregate outcome of one add-and-broadcast call.
#[derive(Clone, Copy, Debug)]
pub struct BroadcastResult {
    /// What the local store did with the record
    pub outcome: AddOutcome,
    /// Peers a send was attempted to
    pub attempted: usize,
    /// Peers that accepted the message onto a connection
    pub succeeded: usize,
}

/// Propagates records to and from the peer group on one transport.
pub struct DataReplicationService {
    node: Arc<Node>,
    peer_group: Arc<PeerGroupManager>,
    stores: Arc<StoreRegistry>,
}

impl DataReplicationService {
    /// Creates the service and wires inbound record routing into the node.
    pub fn new(
        node: Arc<Node>,
        peer_group: Arc<PeerGroupManager>,
        stores: Arc<StoreRegistry>,
    ) -> Arc<Self> {
        node.add_listener(Arc::new(ReplicationRouter {
            stores: stores.clone(),
        }));
        Arc::new(Self {
            node,
            peer_group,
            stores,
        })
    }

    /// Adds a record locally and fans it out to the active peers.
    ///
    /// Duplicates and expired records are not re-broadcast.
    pub async fn add_and_broadcast(&self, record: Record) -> Result<BroadcastResult, NetworkError> {
        let outcome = self.stores.store_for(&record).add(record.clone())?;
        let (attempted, succeeded) = if outcome == AddOutcome::Added {
            self.broadcast(Payload::AddRecord(record)).await
        } else {
            (0, 0)
        };
        Ok(BroadcastResult {
            outcome,
            attempted,
            succeeded,
        })
    }

    /// Removes a record locally and tells the active peers to drop it.
    pub async fn remove_and_broadcast(
        &self,
        store_id: &str,
        key: RecordKey,
    ) -> Result<BroadcastResult, NetworkError> {
        let store = self
            .stores
            .store(store_id)
            .ok_or_else(|| NetworkError::InvalidRecord(format!("unknown store {}", store_id)))?;
        if store.remove(&key).is_none() {
            return Ok(BroadcastResult {
                outcome: AddOutcome::Duplicate,
                attempted: 0,
                succeeded: 0,
            });
        }
        let payload = Payload::RemoveRecord {
            store_id: store_id.to_string(),
            key,
        };
        let (attempted, succeeded) = self.broadcast(payload).await;
        Ok(BroadcastResult {
            outcome: AddOutcome::Added,
            attempted,
            succeeded,
        })
    }

    /// Sends a payload to every active peer, best-effort and concurrently.
    async fn broadcast(&self, payload: Payload) -> (usize, usize) {
        let peers = self.peer_group.active_peers();
        let attempted = peers.len();
        let sends = peers
            .iter()
            .map(|address| self.node.send(payload.clone(), address));
        let results = join_all(sends).await;
        let succeeded = results
            .iter()
            .zip(peers.iter())
            .filter(|(result, address)| match result {
                Ok(_) => true,
                Err(e) => {
                    debug!("Broadcast to {} failed: {}", address, e);
                    false
                }
            })
            .count();
        (attempted, succeeded)
    }

    /// Nothing to stop per transport; the shared stores flush at fanout
    /// shutdown.
    pub async fn shutdown(&self) -> bool {
        true
    }
}

/// Routes replication payloads from a node into the shared stores.
struct ReplicationRouter {
    stores: Arc<StoreRegistry>,
}

impl NodeListener for ReplicationRouter {
    fn on_message(
        &self,
        payload: &Payload,
        _connection: &crate::connection::Connection,
        _identity: &NetworkIdentity,
    ) {
        match payload {
            Payload::AddRecord(record) => {
                match self.stores.store_for(record).add(record.clone()) {
                    Ok(AddOutcome::Added) => {
                        debug!("Stored replicated record in {}", record.payload.store_id())
                    }
                    Ok(outcome) => debug!("Ignored inbound record: {:?}", outcome),
                    Err(e) => warn!("Rejected inbound record: {}", e),
                }
            }
            Payload::RemoveRecord { store_id, key } => {
                if let Some(store) = self.stores.store(store_id) {
                    if store.remove(key).is_some() {
                        debug!("Removed replicated record {} from {}", key, store_id);
                    }
                } else {
                    warn!("Remove request for unknown store {}", store_id);
                }
            }
            _ => {}
        }
    }
}
