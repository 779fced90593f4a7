//! Node and connection registry.
//!
//! A [`Network`] is the view a local booster has of the mesh: its own node,
//! the remote nodes it has heard of, and at most one live [`Conn`] per remote
//! node. Networks are kept in an explicitly constructed [`Registry`] keyed by
//! the local node id.

mod conn;
mod node;

pub use conn::Conn;
pub use node::{hash_id, join_host_port, node_id, Node, Tunnel};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::protocol::{NetworkStatus, TunnelOperation};
use crate::proxy::LoadBalancer;

/// Peers reachable from one local node.
///
/// Lock order is `conns` before `nodes` wherever both are held.
#[derive(Debug)]
pub struct Network {
    id: String,
    local: Arc<Node>,
    /// Remote nodes by id
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    /// Connections by remote node id
    conns: RwLock<HashMap<String, Arc<Conn>>>,
}

impl Network {
    /// Create a network around `local`. The network shares its id.
    pub fn new(local: Arc<Node>) -> Self {
        Self {
            id: local.id().to_string(),
            local,
            nodes: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local(&self) -> &Arc<Node> {
        &self.local
    }

    /// Register `conn` under its remote node id.
    ///
    /// Fails with [`Error::DuplicatePeer`] if a live connection to the same
    /// peer exists; the registered connection is left untouched and closing
    /// the rejected one is up to the caller.
    pub fn add_conn(&self, conn: Arc<Conn>) -> Result<()> {
        let node = conn
            .remote()
            .ok_or_else(|| Error::InvalidMessage("connection has no remote node".into()))?;
        let id = node.id().to_string();
        if id == self.id {
            return Err(Error::InvalidMessage(
                "refusing to register a connection to the local node".into(),
            ));
        }

        let mut conns = self.conns.write();
        if let Some(existing) = conns.get(&id) {
            if !existing.is_closed() {
                return Err(Error::DuplicatePeer(id));
            }
        }
        conns.insert(id.clone(), conn);
        self.nodes.write().insert(id, node);
        Ok(())
    }

    /// Unregister the connection to `id`, returning it.
    pub fn remove_conn(&self, id: &str) -> Option<Arc<Conn>> {
        self.conns.write().remove(id)
    }

    /// Live connection to `id`.
    pub fn conn(&self, id: &str) -> Option<Arc<Conn>> {
        self.prune();
        self.conns.read().get(id).cloned()
    }

    /// Every live connection.
    pub fn conns(&self) -> Vec<Arc<Conn>> {
        self.prune();
        self.conns.read().values().cloned().collect()
    }

    /// Drop connections that closed since they were registered.
    fn prune(&self) {
        let mut conns = self.conns.write();
        conns.retain(|id, c| {
            let keep = !c.is_closed();
            if !keep {
                tracing::debug!("network {}: pruning closed connection to {}", short(&self.id), short(id));
            }
            keep
        });
    }

    /// Local or remote node by id.
    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        if id == self.id {
            return Some(Arc::clone(&self.local));
        }
        self.nodes.read().get(id).cloned()
    }

    /// All known nodes, local first, remotes sorted by id.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut remotes: Vec<_> = self.nodes.read().values().cloned().collect();
        remotes.sort_by(|a, b| a.id().cmp(b.id()));

        let mut nodes = Vec::with_capacity(remotes.len() + 1);
        nodes.push(Arc::clone(&self.local));
        nodes.extend(remotes);
        nodes
    }

    /// Forget a remote node. Its connection, if any, stays registered.
    pub fn remove_node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.write().remove(id)
    }

    /// Snapshot of every known node.
    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            id: self.id.clone(),
            nodes: self.nodes().iter().map(|n| n.status()).collect(),
        }
    }
}

#[async_trait]
impl LoadBalancer for Network {
    async fn get_node_balanced(&self) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.is_active())
            .min_by(|a, b| {
                a.workload()
                    .cmp(&b.workload())
                    .then_with(|| a.id().cmp(b.id()))
            })
            .cloned()
            .ok_or(Error::NoNodeAvailable)
    }

    async fn close_node(&self, id: &str) -> Result<Arc<Node>> {
        let node = self
            .nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))?;
        node.set_active(false);

        let conn = self.conns.write().remove(id);
        if let Some(conn) = conn {
            conn.close().await?;
        }
        tracing::info!("network {}: closed node {}", short(&self.id), short(id));
        Ok(node)
    }

    async fn update_node(&self, id: &str, op: TunnelOperation, target: &str) -> Result<Arc<Node>> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))?;
        node.apply(target, op)?;
        Ok(node)
    }
}

/// Networks by local node id.
#[derive(Debug, Default)]
pub struct Registry {
    networks: RwLock<HashMap<String, Arc<Network>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `network`, replacing and returning any network with the same id.
    pub fn insert(&self, network: Arc<Network>) -> Option<Arc<Network>> {
        self.networks
            .write()
            .insert(network.id().to_string(), network)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Network>> {
        self.networks.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Network>> {
        self.networks.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.networks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.read().is_empty()
    }
}

/// Abbreviated id for log lines.
pub(crate) fn short(id: &str) -> &str {
    id.get(..10).unwrap_or(id)
}
