//! Confidential point-to-point delivery with optional acknowledgements.

use crate::authorization::AuthorizationGate;
use crate::connection::{Connection, ConnectionId};
use crate::envelope::{Envelope, Payload};
use crate::node::NodeListener;
use crate::registry::NodeRegistry;
use common::addressing::{Address, NetworkIdentity, PubKey};
use common::keys::{verify_signature, KeyBundle};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A sealed, receiver-addressed message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfidentialEnvelope {
    /// Key the message is addressed to
    pub receiver_key: PubKey,
    /// Sender's public key
    pub sender_key: PubKey,
    /// Sealed message body
    pub body: Vec<u8>,
    /// Sender's signature over the message id
    pub signature: Vec<u8>,
    /// Digest of body and receiver key, used for acknowledgements
    pub message_id: [u8; 32],
}

/// Delivery status tracked per confidential message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// A connection accepted the message
    Sent,
    /// The receiver acknowledged it
    Acknowledged,
    /// The send failed
    Failed,
}

/// Outcome of one confidential send on one transport.
#[derive(Clone, Debug)]
pub enum SendConfidentialResult {
    /// Queued on a live connection
    Sent {
        /// Connection the message was queued on
        connection_id: ConnectionId,
        /// Id to look up delivery status with
        message_id: [u8; 32],
    },
    /// Delivery failed
    Failed {
        /// What went wrong
        reason: String,
    },
}

/// Observer of inbound confidential messages.
pub trait ConfidentialMessageListener: Send + Sync {
    /// Called with the unsealed body of every valid inbound message.
    fn on_confidential_message(&self, body: &[u8], sender_key: &PubKey);
}

/// Seals, sends and tracks point-to-point messages for one transport.
pub struct ConfidentialDeliveryService {
    registry: Arc<NodeRegistry>,
    track_acks: bool,
    statuses: Mutex<HashMap<[u8; 32], DeliveryStatus>>,
    listeners: Mutex<Vec<Arc<dyn ConfidentialMessageListener>>>,
}

impl ConfidentialDeliveryService {
    /// Creates the service. Ack tracking follows the configured service set.
    pub fn new(registry: Arc<NodeRegistry>, track_acks: bool) -> Self {
        Self {
            registry,
            track_acks,
            statuses: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Seals `body` for the receiver and sends it to `address` from the
    /// sender identity's node.
    pub async fn send(
        &self,
        body: Vec<u8>,
        address: &Address,
        receiver_key: PubKey,
        sender_keys: &KeyBundle,
        sender_identity: &NetworkIdentity,
    ) -> SendConfidentialResult {
        let envelope = seal(body, receiver_key, sender_keys);
        let message_id = envelope.message_id;
        match self
            .registry
            .send(sender_identity, Payload::Confidential(envelope), address)
            .await
        {
            Ok(connection) => {
                if self.track_acks {
                    self.statuses
                        .lock()
                        .unwrap()
                        .insert(message_id, DeliveryStatus::Sent);
                }
                SendConfidentialResult::Sent {
                    connection_id: connection.id(),
                    message_id,
                }
            }
            Err(e) => {
                if self.track_acks {
                    self.statuses
                        .lock()
                        .unwrap()
                        .insert(message_id, DeliveryStatus::Failed);
                }
                SendConfidentialResult::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Validates an inbound envelope and notifies listeners.
    ///
    /// Returns whether an acknowledgement should be sent back.
    pub fn handle_inbound(&self, envelope: &ConfidentialEnvelope) -> bool {
        let expected = message_digest(&envelope.body, &envelope.receiver_key);
        if expected != envelope.message_id {
            warn!("Dropping confidential message with mismatched id");
            return false;
        }
        if !verify_signature(&envelope.sender_key, &envelope.message_id, &envelope.signature) {
            warn!(
                "Dropping confidential message with bad signature from {}",
                envelope.sender_key
            );
            return false;
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_confidential_message(&envelope.body, &envelope.sender_key);
        }
        self.track_acks
    }

    /// Records a delivery acknowledgement.
    pub fn handle_ack(&self, message_id: &[u8; 32]) {
        let mut statuses = self.statuses.lock().unwrap();
        if let Some(status) = statuses.get_mut(message_id) {
            *status = DeliveryStatus::Acknowledged;
        } else {
            debug!("Ack for unknown message id");
        }
    }

    /// Delivery status of a tracked message.
    pub fn delivery_status(&self, message_id: &[u8; 32]) -> Option<DeliveryStatus> {
        self.statuses.lock().unwrap().get(message_id).copied()
    }

    /// Registers a listener for inbound confidential messages.
    pub fn add_listener(&self, listener: Arc<dyn ConfidentialMessageListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, listener: &Arc<dyn ConfidentialMessageListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Drops listeners and tracked statuses.
    pub async fn shutdown(&self) -> bool {
        self.listeners.lock().unwrap().clear();
        self.statuses.lock().unwrap().clear();
        true
    }
}

/// Routes confidential and ack payloads from a node into the service.
pub struct ConfidentialRouter {
    service: Arc<ConfidentialDeliveryService>,
    gate: Arc<dyn AuthorizationGate>,
}

impl ConfidentialRouter {
    /// Creates a router for the given service.
    pub fn new(service: Arc<ConfidentialDeliveryService>, gate: Arc<dyn AuthorizationGate>) -> Self {
        Self { service, gate }
    }
}

impl NodeListener for ConfidentialRouter {
    fn on_message(&self, payload: &Payload, connection: &Connection, _identity: &NetworkIdentity) {
        match payload {
            Payload::Confidential(envelope) => {
                if self.service.handle_inbound(envelope) {
                    let ack = Payload::Ack {
                        message_id: envelope.message_id,
                    };
                    match ack.canonical_bytes() {
                        Ok(bytes) => {
                            let token = self.gate.create_token(&bytes);
                            if let Err(e) = connection.send(Envelope::new(token, ack)) {
                                debug!("Could not send ack: {}", e);
                            }
                        }
                        Err(e) => warn!("Could not encode ack: {}", e),
                    }
                }
            }
            Payload::Ack { message_id } => self.service.handle_ack(message_id),
            _ => {}
        }
    }
}

fn message_digest(body: &[u8], receiver_key: &PubKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.update(receiver_key.0);
    let digest = hasher.finalize();
    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    id
}

fn seal(body: Vec<u8>, receiver_key: PubKey, sender_keys: &KeyBundle) -> ConfidentialEnvelope {
    let message_id = message_digest(&body, &receiver_key);
    let signature = sender_keys.sign(&message_id);
    ConfidentialEnvelope {
        receiver_key,
        sender_key: sender_keys.pub_key(),
        body,
        signature,
        message_id,
    }
}
