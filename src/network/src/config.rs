//! Network layer configuration.

use crate::authorization::{AuthorizationGate, HashCashGate, DEFAULT_DIFFICULTY};
use crate::clearnet::ClearNetTransport;
use crate::errors::NetworkError;
use crate::peer_group::PeerGroupConfig;
use crate::service_unit::{ServiceSet, ServiceUnitConfig};
use crate::transport::{Transport, TransportConfig};
use anyhow::Result;
use common::addressing::{Address, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration for the overlay network layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Transports to run, with per-transport settings
    pub transports: BTreeMap<TransportKind, TransportConfig>,
    /// Enabled services
    pub service_set: ServiceSet,
    /// Seed addresses per transport; every configured transport needs an entry
    pub seed_addresses: BTreeMap<TransportKind, BTreeSet<Address>>,
    /// Peer group tuning per transport
    pub peer_group: BTreeMap<TransportKind, PeerGroupConfig>,
    /// Proof-of-work difficulty for outbound messages
    pub pow_difficulty: u32,
    /// Bound on the concurrent delegate-shutdown phase, in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Minimum interval between persisted store writes, in milliseconds
    pub write_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let mut transports = BTreeMap::new();
        transports.insert(TransportKind::Clear, TransportConfig::default());

        let mut seed_addresses = BTreeMap::new();
        seed_addresses.insert(TransportKind::Clear, BTreeSet::new());

        let mut peer_group = BTreeMap::new();
        peer_group.insert(TransportKind::Clear, PeerGroupConfig::default());

        Self {
            transports,
            service_set: ServiceSet::all(),
            seed_addresses,
            peer_group,
            pow_difficulty: DEFAULT_DIFFICULTY,
            shutdown_timeout_ms: 10_000,
            write_interval_ms: 1_000,
        }
    }
}

impl NetworkConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Saves configuration to a JSON file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Builds per-transport unit configs with the in-tree transports.
    ///
    /// Panics when a configured transport has no seed-address entry; that is
    /// a configuration programming error, not a runtime condition.
    pub fn unit_configs(&self) -> Result<HashMap<TransportKind, ServiceUnitConfig>, NetworkError> {
        let mut configs = HashMap::new();
        for (kind, transport_config) in &self.transports {
            let seeds = self
                .seed_addresses
                .get(kind)
                .unwrap_or_else(|| panic!("seed addresses must be configured for {}", kind));
            let transport: Arc<dyn Transport> = match kind {
                TransportKind::Clear => Arc::new(ClearNetTransport::new(transport_config.clone())),
                other => return Err(NetworkError::UnsupportedTransport(*other)),
            };
            let gate: Arc<dyn AuthorizationGate> = Arc::new(HashCashGate::new(self.pow_difficulty));
            configs.insert(
                *kind,
                ServiceUnitConfig {
                    service_set: self.service_set.clone(),
                    transport,
                    gate,
                    seed_addresses: seeds.clone(),
                    peer_group: self.peer_group.get(kind).cloned().unwrap_or_default(),
                    shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
                },
            );
        }
        Ok(configs)
    }
}
