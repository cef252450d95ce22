//! Peer-group membership for one transport.

use crate::errors::NetworkError;
use crate::node::Node;
use common::addressing::Address;
use persistence::{Persistence, PersistenceService};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Shared ban list consulted at connection admission.
#[derive(Clone, Default)]
pub struct BanList {
    banned: Arc<Mutex<HashSet<Address>>>,
}

impl BanList {
    /// Creates an empty ban list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bans an address.
    pub fn ban(&self, address: Address) {
        self.banned.lock().unwrap().insert(address);
    }

    /// Lifts a ban.
    pub fn unban(&self, address: &Address) {
        self.banned.lock().unwrap().remove(address);
    }

    /// Whether the address is currently banned.
    pub fn is_banned(&self, address: &Address) -> bool {
        self.banned.lock().unwrap().contains(address)
    }
}

/// Settings for the peer group of one transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerGroupConfig {
    /// Target number of connected peers
    pub target_peers: usize,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self { target_peers: 8 }
    }
}

/// Persisted snapshot of known peers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PeerStore {
    peers: BTreeSet<Address>,
}

/// Maintains the known-peer set for one transport.
///
/// Seeds and peers learned in earlier runs form the known set; banned
/// addresses never surface from it. The set is persisted so a restarted node
/// can rejoin without fresh seed hints.
pub struct PeerGroupManager {
    node: Arc<Node>,
    ban_list: BanList,
    config: PeerGroupConfig,
    seeds: Mutex<BTreeSet<Address>>,
    peers: Mutex<BTreeSet<Address>>,
    persistence: Persistence<PeerStore>,
    initialized: AtomicBool,
}

impl PeerGroupManager {
    /// Creates the manager; persisted peers are loaded on `initialize`.
    pub fn new(
        persistence_service: &PersistenceService,
        node: Arc<Node>,
        ban_list: BanList,
        config: PeerGroupConfig,
        seeds: BTreeSet<Address>,
    ) -> Self {
        let store_id = format!("peer_group_{}", node.transport_kind());
        let persistence = persistence_service.get_or_create::<PeerStore>(&store_id);
        Self {
            node,
            ban_list,
            config,
            seeds: Mutex::new(seeds),
            peers: Mutex::new(BTreeSet::new()),
            persistence,
            initialized: AtomicBool::new(false),
        }
    }

    /// Loads persisted peers, merges the seeds and marks the group ready.
    pub async fn initialize(&self) -> Result<(), NetworkError> {
        match self.persistence.load() {
            Ok(Some(store)) => {
                self.peers.lock().unwrap().extend(store.peers);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load persisted peers: {}", e),
        }
        let known = {
            let seeds = self.seeds.lock().unwrap().clone();
            let mut peers = self.peers.lock().unwrap();
            peers.extend(seeds);
            let banned: Vec<Address> = peers
                .iter()
                .filter(|address| self.ban_list.is_banned(address))
                .cloned()
                .collect();
            for address in banned {
                peers.remove(&address);
            }
            peers.len()
        };
        self.initialized.store(true, Ordering::SeqCst);
        debug!(
            "Peer group ready with {} known peers (target {})",
            known, self.config.target_peers
        );
        Ok(())
    }

    /// Whether `initialize` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Adds a seed address to the known set.
    pub fn add_seed(&self, address: Address) {
        self.seeds.lock().unwrap().insert(address.clone());
        self.peers.lock().unwrap().insert(address);
        self.persist_peers();
    }

    /// Removes a seed address from the known set.
    pub fn remove_seed(&self, address: &Address) {
        self.seeds.lock().unwrap().remove(address);
        self.peers.lock().unwrap().remove(address);
        self.persist_peers();
    }

    /// Peers eligible for fan-out right now: known, not banned, not us.
    pub fn active_peers(&self) -> Vec<Address> {
        let own_address = self.node.address();
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|address| !self.ban_list.is_banned(address))
            .filter(|address| Some(*address) != own_address.as_ref())
            .cloned()
            .collect()
    }

    fn persist_peers(&self) {
        let snapshot = PeerStore {
            peers: self.peers.lock().unwrap().clone(),
        };
        if let Err(e) = self.persistence.save(&snapshot) {
            warn!("Persisting peer set failed: {}", e);
        }
    }

    /// Persists the peer set and stops the group.
    pub async fn shutdown(&self) -> bool {
        let snapshot = PeerStore {
            peers: self.peers.lock().unwrap().clone(),
        };
        let saved = match self.persistence.save(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!("Persisting peer set at shutdown failed: {}", e);
                false
            }
        };
        self.initialized.store(false, Ordering::SeqCst);
        saved
    }
}
