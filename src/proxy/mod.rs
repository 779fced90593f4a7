//! Client-facing proxy.
//!
//! The booster exposes a SOCKS5 endpoint whose outbound connections are
//! chained through other boosters by the [`LoadBalancedDialer`].

pub mod dialer;
mod relay;
pub mod socks5;

pub use dialer::{socks5_dial, Dialer, DirectDialer, LoadBalancedDialer, LoadBalancer, Tracer};
pub use relay::{relay_tcp, relay_udp};
pub use socks5::Socks5;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::TunnelEvent;

/// A proxy server the booster can run and observe.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Start receiving tunnel events. Replaces any earlier registration.
    fn notify(&self) -> mpsc::UnboundedReceiver<TunnelEvent>;

    /// Stop sending tunnel events; the receiver returned by
    /// [`notify`](Proxy::notify) ends.
    fn stop_notifying(&self);

    /// Serve clients on `port` until `ctx` is cancelled, then return
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    async fn listen_and_serve(&self, ctx: CancellationToken, port: u16) -> Result<()>;

    /// Protocol name.
    fn proto(&self) -> &'static str;
}
