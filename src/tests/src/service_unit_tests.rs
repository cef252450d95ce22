//! Tests for the per-transport service unit lifecycle.

use crate::support::{
    ephemeral_identity, init_logging, unit_config, FailingBackend, LabeledTransport,
    RecordingListener,
};
use common::addressing::{Address, TransportKind};
use common::keys::KeyBundle;
use network::clearnet::ClearNetTransport;
use network::errors::NetworkError;
use network::service_unit::{ServiceKind, ServiceSet, ServiceUnit, UnitState};
use network::transport::TransportConfig;
use persistence::{MemoryBackend, PersistenceService};
use serial_test::serial;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn memory_persistence() -> PersistenceService {
    PersistenceService::new(Arc::new(MemoryBackend::new()))
}

/// Observed lifecycle transitions always climb in rank, end in
/// `PeerGroupReady` after initialization and in `Terminated` after shutdown.
#[test]
#[serial]
fn test_lifecycle_states_strictly_increase() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let transport = Arc::new(ClearNetTransport::new(TransportConfig::default()));
        let unit = ServiceUnit::new(
            unit_config(
                transport,
                ServiceSet::from_kinds([ServiceKind::PeerGroup]),
                BTreeSet::new(),
            ),
            memory_persistence(),
            None,
        );

        let listener = Arc::new(RecordingListener::new());
        unit.add_state_listener(listener.clone());

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(&keys, &[TransportKind::Clear]);
        unit.create_default_node(&identity).await.unwrap();
        assert_eq!(unit.state(), UnitState::PeerGroupReady);

        assert!(unit.shutdown().await);
        assert_eq!(unit.state(), UnitState::Terminated);

        // Notifications are dispatched off the lifecycle task
        tokio::time::sleep(Duration::from_millis(200)).await;
        let states = listener.states();
        assert_eq!(states.first(), Some(&UnitState::InitializingTransport));
        assert_eq!(states.last(), Some(&UnitState::Terminated));
        for pair in states.windows(2) {
            assert!(
                pair[0].rank() < pair[1].rank(),
                "state regressed: {:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    });
}

/// Repeated `create_default_node` calls return the node created first.
#[test]
#[serial]
fn test_create_default_node_is_idempotent() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let transport = Arc::new(ClearNetTransport::new(TransportConfig::default()));
        let unit = ServiceUnit::new(
            unit_config(transport, ServiceSet::from_kinds([]), BTreeSet::new()),
            memory_persistence(),
            None,
        );

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(&keys, &[TransportKind::Clear]);
        let first = unit.create_default_node(&identity).await.unwrap();
        let second = unit.create_default_node(&identity).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(unit.shutdown().await);
    });
}

/// Concurrent initialization of the same identity converges on one node.
#[test]
#[serial]
fn test_concurrent_initialization_yields_one_node() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let transport = Arc::new(ClearNetTransport::new(TransportConfig::default()));
        let unit = ServiceUnit::new(
            unit_config(transport, ServiceSet::from_kinds([]), BTreeSet::new()),
            memory_persistence(),
            None,
        );

        let default_keys = KeyBundle::generate();
        let default_identity = ephemeral_identity(&default_keys, &[TransportKind::Clear]);
        unit.create_default_node(&default_identity).await.unwrap();

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(&keys, &[TransportKind::Clear]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let unit = unit.clone();
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                unit.get_initialized_node(&identity).await
            }));
        }

        let mut nodes = Vec::new();
        for handle in handles {
            nodes.push(handle.await.unwrap().unwrap());
        }
        for node in &nodes {
            assert!(Arc::ptr_eq(node, &nodes[0]));
        }
        assert!(unit.is_node_initialized(&identity));
        assert!(unit.shutdown().await);
    });
}

/// Confidential sends on a unit without the service fail fast.
#[test]
fn test_confidential_send_requires_the_service() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let transport = Arc::new(ClearNetTransport::new(TransportConfig::default()));
        let unit = ServiceUnit::new(
            unit_config(
                transport,
                ServiceSet::from_kinds([ServiceKind::PeerGroup]),
                BTreeSet::new(),
            ),
            memory_persistence(),
            None,
        );

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(&keys, &[TransportKind::Clear]);
        let result = unit
            .confidential_send(
                b"hello".to_vec(),
                &Address::localhost(1),
                keys.pub_key(),
                &keys,
                &identity,
            )
            .await;

        assert!(matches!(result, Err(NetworkError::ServiceNotSupported(_))));
    });
}

/// Shutdown is idempotent, and the transport teardown runs exactly once even
/// when a delegate shutdown fails.
#[test]
#[serial]
fn test_shutdown_idempotent_with_unconditional_transport_teardown() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let transport = Arc::new(LabeledTransport::new(TransportKind::Clear));
        // Failing persistence makes the peer-group delegate report failure
        let persistence = PersistenceService::new(Arc::new(FailingBackend));
        let unit = ServiceUnit::new(
            unit_config(
                transport.clone(),
                ServiceSet::from_kinds([ServiceKind::PeerGroup]),
                BTreeSet::new(),
            ),
            persistence,
            None,
        );

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(&keys, &[TransportKind::Clear]);
        unit.create_default_node(&identity).await.unwrap();

        // Delegate failure surfaces in the aggregate...
        assert!(!unit.shutdown().await);
        // ...but the transport was torn down anyway
        assert_eq!(transport.shutdown_calls(), 1);
        assert_eq!(unit.state(), UnitState::Terminated);

        // Second call is a no-op
        assert!(unit.shutdown().await);
        assert_eq!(transport.shutdown_calls(), 1);
    });
}
