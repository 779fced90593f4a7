//! Typed module bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CtrlOperation, Message, TunnelOperation, VERSION};

/// Header module. Present in every packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Message kind of the packet
    pub message: Message,
    /// Protocol version of the sender
    pub protocol_version: String,
    /// Message-specific operation, 0 when unused
    #[serde(default)]
    pub operation: i32,
}

impl Header {
    /// Header for `message` with no operation.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            protocol_version: VERSION.to_string(),
            operation: 0,
        }
    }

    pub fn hello() -> Self {
        Self::new(Message::Hello)
    }

    pub fn heartbeat() -> Self {
        Self::new(Message::Heartbeat)
    }

    /// Asks the receiver to forward its node state on every tunnel change.
    pub fn tunnel_notify() -> Self {
        Self::new(Message::Notify)
    }

    pub fn node_status() -> Self {
        Self::new(Message::NodeStatus)
    }

    pub fn ctrl(op: CtrlOperation) -> Self {
        Self {
            operation: op as i32,
            ..Self::new(Message::Ctrl)
        }
    }
}

/// Sent by both ends right after the TCP connection is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub bport: String,
    pub pport: String,
}

/// Asks the receiver to wire itself to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub target: String,
}

/// Asks the receiver to drop its link to peer `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub id: String,
}

/// Liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender node id
    pub id: String,
    pub hops: i32,
    /// Absolute instant after which the sender considers the link dead
    pub ttl: DateTime<Utc>,
}

/// A tunnel relayed by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub id: String,
    pub target: String,
    pub acks: i32,
    pub copies: i32,
}

/// Full node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: String,
    pub baddr: String,
    pub paddr: String,
    pub active: bool,
    #[serde(default)]
    pub tunnels: Vec<TunnelStatus>,
}

/// A change in a proxy tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub target: String,
    pub event: TunnelOperation,
}

/// Answer to `Monitor`: every node the sender knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub id: String,
    pub nodes: Vec<NodeStatus>,
}
