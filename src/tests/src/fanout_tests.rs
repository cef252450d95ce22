//! Tests for the multi-transport fanout.

use crate::support::{
    ephemeral_identity, init_logging, unit_config, wait_until, FailingTransport, LabeledTransport,
};
use common::addressing::{Address, AddressByTransport, PubKey, TransportKind};
use common::keys::KeyBundle;
use network::clearnet::ClearNetTransport;
use network::confidential::{ConfidentialMessageListener, DeliveryStatus, SendConfidentialResult};
use network::envelope::Payload;
use network::fanout::{SendOutcome, TransportFanout};
use network::service_unit::{ServiceKind, ServiceSet, ServiceUnitConfig};
use network::transport::TransportConfig;
use persistence::{MemoryBackend, PersistenceService};
use serial_test::serial;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

fn memory_persistence() -> PersistenceService {
    PersistenceService::new(Arc::new(MemoryBackend::new()))
}

fn peer_group_only() -> ServiceSet {
    ServiceSet::from_kinds([ServiceKind::PeerGroup])
}

/// One failing transport out of three must not block or fail the others.
#[test]
#[serial]
fn test_partial_transport_failure_is_tolerated() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut configs: HashMap<TransportKind, ServiceUnitConfig> = HashMap::new();
        configs.insert(
            TransportKind::Clear,
            unit_config(
                Arc::new(ClearNetTransport::new(TransportConfig::default())),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        configs.insert(
            TransportKind::Tor,
            unit_config(
                Arc::new(LabeledTransport::new(TransportKind::Tor)),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        configs.insert(
            TransportKind::I2p,
            unit_config(
                Arc::new(FailingTransport::new(TransportKind::I2p)),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        let fanout = TransportFanout::new(configs, memory_persistence(), None);

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(
            &keys,
            &[TransportKind::Clear, TransportKind::Tor, TransportKind::I2p],
        );

        let handles = fanout.initialize_node_for(&identity);
        assert_eq!(handles.len(), 3);
        for (kind, handle) in handles {
            let result = handle.await.unwrap();
            match kind {
                TransportKind::I2p => assert!(result.is_err()),
                _ => assert!(result.is_ok(), "{} should initialize", kind),
            }
        }

        assert!(!fanout.is_fully_initialized(&identity));
        assert!(fanout.is_initialized_on(TransportKind::Clear, &identity));
        assert!(fanout.is_initialized_on(TransportKind::Tor, &identity));
        assert!(!fanout.is_initialized_on(TransportKind::I2p, &identity));

        fanout.shutdown().await;
    });
}

/// With only healthy transports, full initialization covers all of them.
#[test]
#[serial]
fn test_await_fully_initialized_over_healthy_transports() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut configs: HashMap<TransportKind, ServiceUnitConfig> = HashMap::new();
        configs.insert(
            TransportKind::Clear,
            unit_config(
                Arc::new(ClearNetTransport::new(TransportConfig::default())),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        configs.insert(
            TransportKind::Tor,
            unit_config(
                Arc::new(LabeledTransport::new(TransportKind::Tor)),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        let fanout = TransportFanout::new(configs, memory_persistence(), None);

        let keys = KeyBundle::generate();
        let identity = ephemeral_identity(&keys, &[TransportKind::Clear, TransportKind::Tor]);

        let nodes = fanout.await_fully_initialized(&identity).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(fanout.is_fully_initialized(&identity));

        assert!(fanout.shutdown().await);
        // Bookkeeping is cleared regardless of outcome
        assert!(fanout.find_unit(TransportKind::Clear).is_none());
        assert!(!fanout.is_fully_initialized(&identity));
        // A second shutdown has nothing left to do
        assert!(fanout.shutdown().await);
    });
}

/// Sends are attempted only on transports present in both the receiver's
/// address map and the fanout; neither side is null-padded.
#[test]
#[serial]
fn test_send_result_covers_only_shared_transports() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        // Receiver: a single clear-net unit with a real listening node
        let receiver_unit = network::service_unit::ServiceUnit::new(
            unit_config(
                Arc::new(ClearNetTransport::new(TransportConfig::default())),
                peer_group_only(),
                BTreeSet::new(),
            ),
            memory_persistence(),
            None,
        );
        let receiver_keys = KeyBundle::generate();
        let receiver_identity = ephemeral_identity(&receiver_keys, &[TransportKind::Clear]);
        let receiver_node = receiver_unit
            .create_default_node(&receiver_identity)
            .await
            .unwrap();
        let receiver_address = receiver_node.address().unwrap();

        // Sender fanout manages {Clear, Tor}
        let mut configs: HashMap<TransportKind, ServiceUnitConfig> = HashMap::new();
        configs.insert(
            TransportKind::Clear,
            unit_config(
                Arc::new(ClearNetTransport::new(TransportConfig::default())),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        configs.insert(
            TransportKind::Tor,
            unit_config(
                Arc::new(LabeledTransport::new(TransportKind::Tor)),
                peer_group_only(),
                BTreeSet::new(),
            ),
        );
        let fanout = TransportFanout::new(configs, memory_persistence(), None);

        let sender_keys = KeyBundle::generate();
        let sender_identity =
            ephemeral_identity(&sender_keys, &[TransportKind::Clear, TransportKind::Tor]);
        fanout.await_fully_initialized(&sender_identity).await.unwrap();

        // Receiver is reachable over {Clear, I2p}; the fanout manages {Clear, Tor}
        let mut receiver_addresses = AddressByTransport::new();
        receiver_addresses.insert(TransportKind::Clear, receiver_address);
        receiver_addresses.insert(TransportKind::I2p, Address::localhost(1));

        let result = fanout
            .send(
                &sender_identity,
                Payload::Ping { nonce: 1 },
                &receiver_addresses,
            )
            .await;

        assert_eq!(result.len(), 1);
        assert!(matches!(
            result.get(&TransportKind::Clear),
            Some(SendOutcome::Sent(_))
        ));
        assert!(!result.contains_key(&TransportKind::Tor));
        assert!(!result.contains_key(&TransportKind::I2p));

        fanout.shutdown().await;
        receiver_unit.shutdown().await;
    });
}

struct CollectingListener {
    bodies: Mutex<Vec<(Vec<u8>, PubKey)>>,
}

impl ConfidentialMessageListener for CollectingListener {
    fn on_confidential_message(&self, body: &[u8], sender_key: &PubKey) {
        self.bodies
            .lock()
            .unwrap()
            .push((body.to_vec(), *sender_key));
    }
}

/// End to end: a confidential message reaches the receiver's listener and the
/// sender observes the delivery acknowledgement.
#[test]
#[serial]
fn test_confidential_roundtrip_with_ack() {
    init_logging();
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut receiver_configs: HashMap<TransportKind, ServiceUnitConfig> = HashMap::new();
        receiver_configs.insert(
            TransportKind::Clear,
            unit_config(
                Arc::new(ClearNetTransport::new(TransportConfig::default())),
                ServiceSet::all(),
                BTreeSet::new(),
            ),
        );
        let receiver_fanout = TransportFanout::new(receiver_configs, memory_persistence(), None);

        let receiver_keys = KeyBundle::generate();
        let receiver_identity = ephemeral_identity(&receiver_keys, &[TransportKind::Clear]);
        let receiver_nodes = receiver_fanout
            .await_fully_initialized(&receiver_identity)
            .await
            .unwrap();
        let receiver_address = receiver_nodes[0].address().unwrap();

        let listener = Arc::new(CollectingListener {
            bodies: Mutex::new(Vec::new()),
        });
        receiver_fanout
            .find_unit(TransportKind::Clear)
            .unwrap()
            .add_confidential_listener(listener.clone());

        let mut sender_configs: HashMap<TransportKind, ServiceUnitConfig> = HashMap::new();
        sender_configs.insert(
            TransportKind::Clear,
            unit_config(
                Arc::new(ClearNetTransport::new(TransportConfig::default())),
                ServiceSet::all(),
                BTreeSet::new(),
            ),
        );
        let sender_fanout = TransportFanout::new(sender_configs, memory_persistence(), None);

        let sender_keys = KeyBundle::generate();
        let sender_identity = ephemeral_identity(&sender_keys, &[TransportKind::Clear]);
        sender_fanout
            .await_fully_initialized(&sender_identity)
            .await
            .unwrap();

        // Address the receiver by its actually bound port
        let mut addresses = AddressByTransport::new();
        addresses.insert(TransportKind::Clear, receiver_address);
        let reachable_receiver =
            common::addressing::NetworkIdentity::new(receiver_keys.pub_key(), addresses);

        let result = sender_fanout
            .confidential_send(
                b"trade proposal".to_vec(),
                &reachable_receiver,
                &sender_keys,
                &sender_identity,
            )
            .await;

        let message_id = match result.get(&TransportKind::Clear) {
            Some(SendConfidentialResult::Sent { message_id, .. }) => *message_id,
            other => panic!("send did not succeed: {:?}", other),
        };

        // The receiver sees the body and the original sender key
        assert!(
            wait_until(
                || {
                    let bodies = listener.bodies.lock().unwrap();
                    bodies
                        .iter()
                        .any(|(body, key)| body == b"trade proposal" && *key == sender_keys.pub_key())
                },
                5_000
            )
            .await
        );

        // The ack flows back to the sender's delivery tracking
        let sender_confidential = sender_fanout
            .find_unit(TransportKind::Clear)
            .unwrap()
            .confidential()
            .unwrap();
        assert!(
            wait_until(
                || {
                    sender_confidential.delivery_status(&message_id)
                        == Some(DeliveryStatus::Acknowledged)
                },
                5_000
            )
            .await
        );

        sender_fanout.shutdown().await;
        receiver_fanout.shutdown().await;
    });
}
