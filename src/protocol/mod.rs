//! Booster wire protocol.
//!
//! A booster packet is a tag-delimited envelope holding up to two modules:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ '>'                                                   (packet) │
//! │   '[' "HE" ':' enc(1) len(4, BE) <header body>  ']'  (module) │
//! │   '[' "PA" ':' enc(1) len(4, BE) <payload body> ']'  (module) │
//! │ '<'                                                            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Module bodies are length-prefixed, so tag characters inside string fields
//! never terminate a module early.

mod packet;
mod payload;

pub use packet::{Module, Packet, PacketCodec, MAX_MODULE_SIZE};
pub use payload::{
    Connect, Disconnect, Header, Heartbeat, Hello, NetworkStatus, NodeStatus, TunnelEvent,
    TunnelStatus,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Booster protocol version. The only one this implementation speaks.
pub const VERSION: &str = "v0.2.0";

/// Opens a packet.
pub const PACKET_OPENING_TAG: u8 = b'>';
/// Closes a packet.
pub const PACKET_CLOSING_TAG: u8 = b'<';
/// Opens a module.
pub const MODULE_OPENING_TAG: u8 = b'[';
/// Closes a module.
pub const MODULE_CLOSING_TAG: u8 = b']';
/// Separates the module identifier from its body.
pub const SEPARATOR: u8 = b':';

/// Returns true if the requested version is compatible with [`VERSION`].
pub fn is_version_supported(v: &str) -> bool {
    v == VERSION
}

/// Fails with [`Error::VersionMismatch`] unless `v` is supported.
pub fn check_version(v: &str) -> Result<()> {
    if is_version_supported(v) {
        Ok(())
    } else {
        Err(Error::VersionMismatch {
            expected: VERSION.to_string(),
            actual: v.to_string(),
        })
    }
}

/// Module identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleId {
    /// Mandatory header module ("HE")
    Header,
    /// Optional payload module ("PA")
    Payload,
}

impl ModuleId {
    /// Two-letter wire identifier.
    pub fn as_bytes(&self) -> &'static [u8; 2] {
        match self {
            ModuleId::Header => b"HE",
            ModuleId::Payload => b"PA",
        }
    }

    /// Parse a two-letter wire identifier.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        match raw {
            b"HE" => Ok(ModuleId::Header),
            b"PA" => Ok(ModuleId::Payload),
            _ => Err(Error::malformed(format!(
                "unknown module identifier: {:?}",
                String::from_utf8_lossy(raw)
            ))),
        }
    }
}

/// Body encodings.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Protobuf (protocol v0.1.x). Recognised, not implemented.
    Protobuf = 1,
    /// JSON
    Json = 2,
}

impl TryFrom<u8> for Encoding {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Encoding::Protobuf),
            2 => Ok(Encoding::Json),
            _ => Err(Error::UnsupportedEncoding(value)),
        }
    }
}

impl Encoding {
    /// Serialize `value` into a module body.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::Protobuf => Err(Error::UnsupportedEncoding(*self as u8)),
        }
    }

    /// Deserialize a module body.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(body)?),
            Encoding::Protobuf => Err(Error::UnsupportedEncoding(*self as u8)),
        }
    }
}

/// Packet message kinds.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Message {
    Hello = 1,
    Connect = 2,
    Disconnect = 3,
    Heartbeat = 4,
    Notify = 5,
    Monitor = 6,
    Ctrl = 7,
    NetworkStatus = 8,
    NodeStatus = 9,
    ProxyUpdate = 10,
}

impl From<Message> for i32 {
    fn from(m: Message) -> i32 {
        m as i32
    }
}

impl TryFrom<i32> for Message {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            1 => Message::Hello,
            2 => Message::Connect,
            3 => Message::Disconnect,
            4 => Message::Heartbeat,
            5 => Message::Notify,
            6 => Message::Monitor,
            7 => Message::Ctrl,
            8 => Message::NetworkStatus,
            9 => Message::NodeStatus,
            10 => Message::ProxyUpdate,
            _ => return Err(Error::InvalidMessage(format!("unknown message: {}", value))),
        })
    }
}

/// Operations carried by `Ctrl` headers.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlOperation {
    Stop = 1,
    Restart = 2,
}

impl TryFrom<i32> for CtrlOperation {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(CtrlOperation::Stop),
            2 => Ok(CtrlOperation::Restart),
            _ => Err(Error::InvalidMessage(format!("unknown ctrl operation: {}", value))),
        }
    }
}

impl std::str::FromStr for CtrlOperation {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "stop" => Ok(CtrlOperation::Stop),
            "restart" => Ok(CtrlOperation::Restart),
            _ => Err(Error::InvalidMessage(format!("undefined operation: {}", raw))),
        }
    }
}

/// Tunnel lifecycle operations.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum TunnelOperation {
    Add = 1,
    Ack = 2,
    Remove = 3,
}

impl From<TunnelOperation> for i32 {
    fn from(op: TunnelOperation) -> i32 {
        op as i32
    }
}

impl TryFrom<i32> for TunnelOperation {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(TunnelOperation::Add),
            2 => Ok(TunnelOperation::Ack),
            3 => Ok(TunnelOperation::Remove),
            _ => Err(Error::InvalidMessage(format!("unknown tunnel operation: {}", value))),
        }
    }
}
