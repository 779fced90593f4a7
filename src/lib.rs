//! # Booster
//!
//! A peer-to-peer tunneling overlay. Every booster node exposes a SOCKS5
//! proxy to local clients and cooperates with other boosters over a framed
//! binary protocol, chaining outbound connections through the least loaded
//! peer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Booster (run / close / wire)               │
//! ├────────────────────────────┬────────────────────────────┤
//! │  SOCKS5 proxy              │  Booster protocol handler  │
//! │  load-balanced dialer      │  Hello, heartbeat, notify  │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Network registry (nodes, tunnels, one Conn per peer)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet codec ('>' '[' HE ... ']' '[' PA ... ']' '<')   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use booster::{Booster, BoosterConfig};
//!
//! # async fn example() -> booster::Result<()> {
//! let node = Booster::new(BoosterConfig::new(1080, 4884))?;
//! node.run().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod booster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod pubsub;

pub use booster::Booster;
pub use config::{BoosterConfig, BoosterConfigFile};
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use network::{Conn, Network, Node, Registry};
pub use protocol::{Packet, VERSION};
pub use proxy::{Dialer, LoadBalancer, Proxy, Socks5, Tracer};
pub use pubsub::{LocalPubSub, PubSub};

/// Default SOCKS5 proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 1080;

/// Default booster protocol port.
pub const DEFAULT_BOOSTER_PORT: u16 = 4884;
