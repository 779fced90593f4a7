//! Error types for booster operations.

use thiserror::Error;

/// Result type alias for booster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a booster node.
#[derive(Error, Debug)]
pub enum Error {
    /// Unbalanced tags, truncated module or unknown module identifier
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Module encoded with an encoding the codec does not implement
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(u8),

    /// Booster protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    /// SOCKS version byte other than 5
    #[error("socks: unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// SOCKS command outside {Connect, Bind, Associate}
    #[error("socks: unsupported command: {0}")]
    UnsupportedCommand(u8),

    /// SOCKS address type outside {IPv4, domain, IPv6}
    #[error("socks: unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    /// Client offered no method we support
    #[error("socks: no acceptable authentication method")]
    NoAcceptableMethod,

    /// Invalid message content (wrong payload for a message kind, etc.)
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Socket write failed while sending a packet
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Operation attempted on a closed connection
    #[error("connection closed")]
    ConnectionClosed,

    /// A connection to this peer is already registered
    #[error("duplicate peer: {0}")]
    DuplicatePeer(String),

    /// Peer id not present in the network
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Load balancer has no candidate relay
    #[error("no node available")]
    NoNodeAvailable,

    /// Both the chained and the fallback dial failed
    #[error("dial error: {0}")]
    Dial(String),

    /// Operation timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Booster stopped through `close()` or a signal
    #[error("booster: stopped")]
    Stopped,

    /// A notification channel closed unexpectedly
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Payload (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    /// Create a new malformed packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPacket(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new dial error
    pub fn dial(msg: impl Into<String>) -> Self {
        Error::Dial(msg.into())
    }

    /// Protocol errors are fatal to the connection that produced them.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_)
                | Error::UnsupportedEncoding(_)
                | Error::VersionMismatch { .. }
                | Error::Serialization(_)
        )
    }

    /// Check if the caller can recover locally without tearing anything down
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DuplicatePeer(_) | Error::UnknownPeer(_) | Error::NoNodeAvailable
        )
    }
}
