//! Booster nodes and the tunnels they relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::{NodeStatus, TunnelOperation, TunnelStatus};

/// Hash `images` in order into a hex identifier.
pub fn hash_id<I, T>(images: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut h = Sha256::new();
    for image in images {
        h.update(image.as_ref());
    }
    hex::encode(h.finalize())
}

/// Identity of a booster listening on the given proxy and booster ports.
///
/// Networks are keyed with the same value as their local node.
pub fn node_id(pport: &str, bport: &str) -> String {
    hash_id([pport, bport])
}

/// A relayed connection path through a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub id: String,
    pub target: String,
    pub acks: i32,
    pub copies: i32,
}

impl Tunnel {
    fn new(target: &str) -> Self {
        Self {
            id: hash_id([target]),
            target: target.to_string(),
            acks: 0,
            copies: 1,
        }
    }
}

impl From<&Tunnel> for TunnelStatus {
    fn from(t: &Tunnel) -> Self {
        TunnelStatus {
            id: t.id.clone(),
            target: t.target.clone(),
            acks: t.acks,
            copies: t.copies,
        }
    }
}

impl From<TunnelStatus> for Tunnel {
    fn from(t: TunnelStatus) -> Self {
        Tunnel {
            id: t.id,
            target: t.target,
            acks: t.acks,
            copies: t.copies,
        }
    }
}

/// A booster node, local or remote.
#[derive(Debug)]
pub struct Node {
    id: String,
    /// Proxy-facing address
    paddr: String,
    /// Booster-facing address
    baddr: String,
    is_local: bool,
    active: AtomicBool,
    /// Keyed by tunnel target
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl Node {
    /// Create a node reachable at `host` on the given ports.
    pub fn new(host: &str, pport: &str, bport: &str, is_local: bool) -> Result<Self> {
        for port in [pport, bport] {
            port.parse::<u16>()
                .map_err(|e| Error::config(format!("invalid port {:?}: {}", port, e)))?;
        }

        Ok(Self {
            id: node_id(pport, bport),
            paddr: join_host_port(host, pport),
            baddr: join_host_port(host, bport),
            is_local,
            active: AtomicBool::new(is_local),
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn paddr(&self) -> &str {
        &self.paddr
    }

    pub fn baddr(&self) -> &str {
        &self.baddr
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Set the active flag, returning the previous value.
    pub fn set_active(&self, active: bool) -> bool {
        self.active.swap(active, Ordering::SeqCst)
    }

    /// Snapshot of the tunnels, sorted by target.
    pub fn tunnels(&self) -> Vec<Tunnel> {
        let mut tunnels: Vec<_> = self.tunnels.lock().values().cloned().collect();
        tunnels.sort_by(|a, b| a.target.cmp(&b.target));
        tunnels
    }

    /// Number of relayed copies across all tunnels.
    pub fn workload(&self) -> u32 {
        self.tunnels
            .lock()
            .values()
            .map(|t| t.copies.max(0) as u32)
            .sum()
    }

    /// Apply a tunnel operation for `target`.
    pub fn apply(&self, target: &str, op: TunnelOperation) -> Result<()> {
        let mut tunnels = self.tunnels.lock();
        match op {
            TunnelOperation::Add => {
                tunnels
                    .entry(target.to_string())
                    .and_modify(|t| t.copies += 1)
                    .or_insert_with(|| Tunnel::new(target));
            }
            TunnelOperation::Ack => {
                let t = tunnels.get_mut(target).ok_or_else(|| unknown_tunnel(target))?;
                t.acks += 1;
            }
            TunnelOperation::Remove => {
                let t = tunnels.get_mut(target).ok_or_else(|| unknown_tunnel(target))?;
                t.copies -= 1;
                if t.copies <= 0 {
                    tunnels.remove(target);
                }
            }
        }
        Ok(())
    }

    /// Replace the tunnel list with the one a peer reported.
    pub fn set_tunnels(&self, tunnels: Vec<TunnelStatus>) {
        *self.tunnels.lock() = tunnels
            .into_iter()
            .map(|t| (t.target.clone(), Tunnel::from(t)))
            .collect();
    }

    /// Wire representation of the node.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            baddr: self.baddr.clone(),
            paddr: self.paddr.clone(),
            active: self.is_active(),
            tunnels: self.tunnels().iter().map(TunnelStatus::from).collect(),
        }
    }
}

fn unknown_tunnel(target: &str) -> Error {
    Error::InvalidMessage(format!("no tunnel to {}", target))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
