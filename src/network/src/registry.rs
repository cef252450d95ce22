//! Identity-keyed node registry for one transport.

use crate::authorization::AuthorizationGate;
use crate::connection::Connection;
use crate::envelope::Payload;
use crate::errors::NetworkError;
use crate::node::{Node, NodeListener};
use crate::peer_group::BanList;
use crate::transport::Transport;
use common::addressing::{Address, NetworkIdentity};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Owns the nodes of one transport, at most one per identity.
///
/// The registry map is the only place nodes are created; concurrent callers
/// for the same identity converge on a single instance.
pub struct NodeRegistry {
    transport: Arc<dyn Transport>,
    gate: Arc<dyn AuthorizationGate>,
    ban_list: BanList,
    nodes: Mutex<HashMap<NetworkIdentity, Arc<Node>>>,
    node_listeners: Mutex<Vec<Arc<dyn NodeListener>>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new(
        transport: Arc<dyn Transport>,
        gate: Arc<dyn AuthorizationGate>,
        ban_list: BanList,
    ) -> Self {
        Self {
            transport,
            gate,
            ban_list,
            nodes: Mutex::new(HashMap::new()),
            node_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the node for `identity`, creating it if absent.
    pub fn get_or_create(&self, identity: &NetworkIdentity) -> Arc<Node> {
        let listeners = self.node_listeners.lock().unwrap().clone();
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get(identity) {
            return node.clone();
        }
        let node = Arc::new(Node::new(
            identity.clone(),
            self.transport.clone(),
            self.gate.clone(),
            self.ban_list.clone(),
            listeners,
        ));
        nodes.insert(identity.clone(), node.clone());
        node
    }

    /// Returns an initialized node for `identity`, initializing on first use.
    pub async fn get_initialized(
        &self,
        identity: &NetworkIdentity,
    ) -> Result<Arc<Node>, NetworkError> {
        let node = self.get_or_create(identity);
        node.clone().ensure_initialized().await?;
        Ok(node)
    }

    /// The node for `identity`, if one exists.
    pub fn find(&self, identity: &NetworkIdentity) -> Option<Arc<Node>> {
        self.nodes.lock().unwrap().get(identity).cloned()
    }

    /// Whether `identity` has a fully initialized node.
    pub fn is_initialized(&self, identity: &NetworkIdentity) -> bool {
        self.find(identity)
            .map(|node| node.is_initialized())
            .unwrap_or(false)
    }

    /// Sends a payload from the given identity's node.
    pub async fn send(
        &self,
        sender: &NetworkIdentity,
        payload: Payload,
        address: &Address,
    ) -> Result<Connection, NetworkError> {
        let node = self.get_initialized(sender).await?;
        node.send(payload, address).await
    }

    /// Registers a listener on all present and future nodes.
    pub fn add_node_listener(&self, listener: Arc<dyn NodeListener>) {
        self.node_listeners.lock().unwrap().push(listener.clone());
        let nodes: Vec<Arc<Node>> = self.nodes.lock().unwrap().values().cloned().collect();
        for node in nodes {
            node.add_listener(listener.clone());
        }
    }

    /// Removes a listener from the registry and every node.
    pub fn remove_node_listener(&self, listener: &Arc<dyn NodeListener>) {
        self.node_listeners
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
        let nodes: Vec<Arc<Node>> = self.nodes.lock().unwrap().values().cloned().collect();
        for node in nodes {
            node.remove_listener(listener);
        }
    }

    /// Shuts down every node concurrently and clears the registry.
    pub async fn shutdown(&self) -> bool {
        let nodes: Vec<Arc<Node>> = {
            let mut map = self.nodes.lock().unwrap();
            map.drain().map(|(_, node)| node).collect()
        };
        let results = join_all(nodes.iter().map(|node| node.shutdown())).await;
        results.into_iter().all(|ok| ok)
    }
}
