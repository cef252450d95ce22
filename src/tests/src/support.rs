//! Shared helpers for the integration tests.

use async_trait::async_trait;
use common::addressing::{Address, AddressByTransport, NetworkIdentity, TransportKind};
use common::keys::KeyBundle;
use network::authorization::HashCashGate;
use network::clearnet::ClearNetTransport;
use network::errors::NetworkError;
use network::peer_group::PeerGroupConfig;
use network::service_unit::{ServiceSet, ServiceUnitConfig, UnitState, UnitStateListener};
use network::transport::{RawStream, Transport, TransportConfig, TransportListener};
use persistence::{PersistenceBackend, PersistenceError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Installs the test log subscriber once per process.
pub fn init_logging() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Transport whose initialization always fails; counts shutdown calls.
pub struct FailingTransport {
    kind: TransportKind,
    shutdown_calls: AtomicUsize,
}

impl FailingTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            shutdown_calls: AtomicUsize::new(0),
        }
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FailingTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn default_port(&self) -> u16 {
        0
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        Err(NetworkError::TransportError(
            "transport made to fail".to_string(),
        ))
    }

    async fn listen(&self, _port: u16) -> Result<TransportListener, NetworkError> {
        Err(NetworkError::TransportError(
            "transport made to fail".to_string(),
        ))
    }

    async fn dial(&self, address: &Address) -> Result<Box<dyn RawStream>, NetworkError> {
        Err(NetworkError::Unreachable(address.to_string()))
    }

    async fn shutdown(&self) -> bool {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Loopback TCP transport reporting an arbitrary kind, so multi-transport
/// fanouts can run entirely in-process. Counts shutdown calls.
pub struct LabeledTransport {
    inner: ClearNetTransport,
    kind: TransportKind,
    shutdown_calls: AtomicUsize,
}

impl LabeledTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            inner: ClearNetTransport::new(TransportConfig::default()),
            kind,
            shutdown_calls: AtomicUsize::new(0),
        }
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LabeledTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn default_port(&self) -> u16 {
        self.inner.default_port()
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        self.inner.initialize().await
    }

    async fn listen(&self, port: u16) -> Result<TransportListener, NetworkError> {
        self.inner.listen(port).await
    }

    async fn dial(&self, address: &Address) -> Result<Box<dyn RawStream>, NetworkError> {
        self.inner.dial(address).await
    }

    async fn shutdown(&self) -> bool {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.shutdown().await
    }
}

/// Persistence backend that rejects every write.
pub struct FailingBackend;

impl PersistenceBackend for FailingBackend {
    fn save(&self, _store_id: &str, _bytes: &[u8]) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("writes disabled".to_string()))
    }

    fn load(&self, _store_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(None)
    }
}

/// Builds an identity listening on an ephemeral loopback port per kind.
pub fn ephemeral_identity(keys: &KeyBundle, kinds: &[TransportKind]) -> NetworkIdentity {
    let mut addresses = AddressByTransport::new();
    for kind in kinds {
        addresses.insert(*kind, Address::localhost(0));
    }
    NetworkIdentity::new(keys.pub_key(), addresses)
}

/// Unit config with a cheap proof-of-work gate and the given seeds.
pub fn unit_config(
    transport: Arc<dyn Transport>,
    service_set: ServiceSet,
    seeds: BTreeSet<Address>,
) -> ServiceUnitConfig {
    ServiceUnitConfig {
        service_set,
        transport,
        gate: Arc::new(HashCashGate::new(4)),
        seed_addresses: seeds,
        peer_group: PeerGroupConfig::default(),
        shutdown_timeout: Duration::from_secs(10),
    }
}

/// Lifecycle listener recording every observed transition.
#[derive(Default)]
pub struct RecordingListener {
    states: Mutex<Vec<UnitState>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<UnitState> {
        self.states.lock().unwrap().clone()
    }
}

impl UnitStateListener for RecordingListener {
    fn on_state_changed(&self, state: UnitState) {
        self.states.lock().unwrap().push(state);
    }
}

/// Polls `predicate` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
