//! Outbound dialing.
//!
//! [`LoadBalancedDialer`] is what the booster's SOCKS5 server dials through:
//! it asks a [`LoadBalancer`] for the least loaded peer and chains the
//! connection through that peer's proxy, falling back to a direct dial (and
//! evicting the peer) when the chained attempt fails.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::socks5::{encode_address, read_address, SOCKS5_VERSION};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::network::Node;
use crate::protocol::TunnelOperation;

/// Default connect timeout of [`DirectDialer`].
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default TCP keep-alive of [`DirectDialer`].
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Default limit on a chained gateway's connect plus SOCKS5 handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to `host:port` addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` over `network` ("tcp", "tcp4" or "tcp6"). Returns
    /// [`Error::Cancelled`] promptly once `ctx` fires.
    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<TcpStream>;
}

/// Picks relay nodes and keeps track of their load.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// The node the next chained connection should go through.
    async fn get_node_balanced(&self) -> Result<Arc<Node>>;

    /// Mark a node unusable and drop its connection.
    async fn close_node(&self, id: &str) -> Result<Arc<Node>>;

    /// Apply a tunnel change to a node.
    async fn update_node(&self, id: &str, op: TunnelOperation, target: &str) -> Result<Arc<Node>>;
}

/// Told about every node whose chained dial failed.
pub trait Tracer: Send + Sync {
    fn trace(&self, node: &Node);
}

/// Plain TCP dialer with a connect timeout and keep-alive.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    pub timeout: Duration,
    pub keep_alive: Duration,
}

impl DirectDialer {
    pub fn new(timeout: Duration, keep_alive: Duration) -> Self {
        Self {
            timeout,
            keep_alive,
        }
    }

    async fn connect(&self, network: &str, addr: &str) -> Result<TcpStream> {
        let want: fn(&SocketAddr) -> bool = match network {
            "tcp" => |_| true,
            "tcp4" => |a| a.is_ipv4(),
            "tcp6" => |a| a.is_ipv6(),
            other => return Err(Error::dial(format!("unsupported network: {}", other))),
        };

        let mut last_err = None;
        for candidate in tokio::net::lookup_host(addr).await?.filter(want) {
            match TcpStream::connect(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => Error::Network(e),
            None => Error::dial(format!("no {} address for {}", network, addr)),
        })
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT, DEFAULT_KEEP_ALIVE)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<TcpStream> {
        let stream = tokio::select! {
            res = tokio::time::timeout(self.timeout, self.connect(network, addr)) => {
                res.map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))??
            }
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };

        let keepalive = TcpKeepalive::new().with_time(self.keep_alive);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Connect to `target` through the SOCKS5 proxy at `proxy_addr`.
pub async fn socks5_dial(
    dialer: &dyn Dialer,
    ctx: &CancellationToken,
    network: &str,
    proxy_addr: &str,
    target: &str,
) -> Result<TcpStream> {
    let mut stream = dialer.dial_context(ctx, network, proxy_addr).await?;
    tokio::select! {
        res = socks5_handshake(&mut stream, target) => res?,
        _ = ctx.cancelled() => return Err(Error::Cancelled),
    }
    Ok(stream)
}

/// Client side of the no-auth Connect exchange.
async fn socks5_handshake(stream: &mut TcpStream, target: &str) -> Result<()> {
    stream.write_all(&[SOCKS5_VERSION, 1, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS5_VERSION {
        return Err(Error::UnsupportedVersion(method[0]));
    }
    if method[1] != 0x00 {
        return Err(Error::NoAcceptableMethod);
    }

    let mut req = vec![SOCKS5_VERSION, 0x01, 0x00];
    req.extend_from_slice(&encode_address(target)?);
    stream.write_all(&req).await?;

    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::UnsupportedVersion(reply[0]));
    }
    // Bound address, unused
    read_address(stream).await?;
    if reply[1] != 0x00 {
        return Err(Error::dial(format!(
            "gateway refused {} with reply code {}",
            target, reply[1]
        )));
    }
    Ok(())
}

/// Chains connections through the least loaded peer, with direct fallback.
#[derive(Clone)]
pub struct LoadBalancedDialer {
    balancer: Arc<dyn LoadBalancer>,
    tracer: Option<Arc<dyn Tracer>>,
    fallback: Arc<dyn Dialer>,
    handshake_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl LoadBalancedDialer {
    pub fn new(balancer: Arc<dyn LoadBalancer>, fallback: Arc<dyn Dialer>) -> Self {
        Self {
            balancer,
            tracer: None,
            fallback,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Bound the chained attempt. A gateway that does not complete the
    /// handshake in time is evicted like one that refused.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Chained attempt through `node`; on failure evict it and go direct.
    async fn chain(
        self,
        ctx: CancellationToken,
        node: Arc<Node>,
        network: String,
        addr: String,
    ) -> Result<TcpStream> {
        tracing::debug!("dialer: using SOCKS5 gateway @ {}", node.paddr());

        let chained = tokio::time::timeout(
            self.handshake_timeout,
            socks5_dial(&*self.fallback, &ctx, &network, node.paddr(), &addr),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(self.handshake_timeout.as_millis() as u64)));

        match chained {
            Ok(stream) => {
                self.metrics.chained_dial();
                return Ok(stream);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(
                    "dialer: unable to dial {} using gateway @ {}: {}. Fallback",
                    addr,
                    node.paddr(),
                    e
                );
            }
        }

        if let Err(e) = self.balancer.close_node(node.id()).await {
            tracing::warn!("dialer: unable to close node {}: {}", node.id(), e);
        }
        self.metrics.eviction();
        if let Some(tracer) = &self.tracer {
            tracer.trace(&node);
        }

        self.metrics.direct_dial();
        self.fallback.dial_context(&ctx, &network, &addr).await
    }
}

#[async_trait]
impl Dialer for LoadBalancedDialer {
    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<TcpStream> {
        let node = match self.balancer.get_node_balanced().await {
            Ok(node) => node,
            Err(e) => {
                tracing::debug!("dialer: dialing {} directly: {}", addr, e);
                self.metrics.direct_dial();
                return self.fallback.dial_context(ctx, network, addr).await;
            }
        };

        // The attempt runs on its own task so that cancellation is observed
        // while it is in flight. A result arriving after that is dropped,
        // closing the stream. The attempt is cancelled if this future is
        // dropped before it finishes.
        let attempt_ctx = ctx.child_token();
        let _abandon = attempt_ctx.clone().drop_guard();
        let (tx, rx) = oneshot::channel();
        let attempt = self
            .clone()
            .chain(attempt_ctx, node, network.to_string(), addr.to_string());
        tokio::spawn(async move {
            let _ = tx.send(attempt.await);
        });

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            res = rx => res.map_err(|_| Error::ChannelClosed("dial attempt".into()))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    use crate::proxy::Socks5;

    /// Always offers the same node and counts evictions.
    struct FixedBalancer {
        node: Option<Arc<Node>>,
        closed: AtomicUsize,
    }

    impl FixedBalancer {
        fn new(node: Option<Node>) -> Arc<Self> {
            Arc::new(Self {
                node: node.map(Arc::new),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LoadBalancer for FixedBalancer {
        async fn get_node_balanced(&self) -> Result<Arc<Node>> {
            self.node.clone().ok_or(Error::NoNodeAvailable)
        }

        async fn close_node(&self, id: &str) -> Result<Arc<Node>> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            let node = self.node.clone().ok_or_else(|| Error::UnknownPeer(id.into()))?;
            node.set_active(false);
            Ok(node)
        }

        async fn update_node(&self, id: &str, _: TunnelOperation, _: &str) -> Result<Arc<Node>> {
            Err(Error::UnknownPeer(id.into()))
        }
    }

    #[derive(Default)]
    struct CountingTracer(AtomicUsize);

    impl Tracer for CountingTracer {
        fn trace(&self, _: &Node) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    fn node_on(pport: u16) -> Node {
        Node::new("127.0.0.1", &pport.to_string(), "1", false).unwrap()
    }

    async fn assert_echoes(mut s: TcpStream) {
        s.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_direct_when_no_node() {
        let echo = echo_server().await;
        let metrics = Arc::new(Metrics::new());
        let dialer = LoadBalancedDialer::new(FixedBalancer::new(None), Arc::new(DirectDialer::default()))
            .with_metrics(Arc::clone(&metrics));

        let s = dialer
            .dial_context(&CancellationToken::new(), "tcp", &echo.to_string())
            .await
            .unwrap();
        assert_echoes(s).await;
        assert_eq!(metrics.snapshot().direct_dials, 1);
    }

    #[tokio::test]
    async fn test_fallback_evicts_once() {
        let echo = echo_server().await;
        let balancer = FixedBalancer::new(Some(node_on(closed_port().await)));
        let tracer = Arc::new(CountingTracer::default());
        let metrics = Arc::new(Metrics::new());

        let dialer = LoadBalancedDialer::new(balancer.clone(), Arc::new(DirectDialer::default()))
            .with_tracer(tracer.clone())
            .with_metrics(Arc::clone(&metrics));

        let s = dialer
            .dial_context(&CancellationToken::new(), "tcp", &echo.to_string())
            .await
            .unwrap();
        assert_echoes(s).await;

        assert_eq!(balancer.closed.load(Ordering::SeqCst), 1);
        assert_eq!(tracer.0.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.evictions(), 1);
        assert_eq!(metrics.snapshot().chained_dials, 0);
    }

    #[tokio::test]
    async fn test_chained_through_gateway() {
        let echo = echo_server().await;

        let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gport = gateway.local_addr().unwrap().port();
        let ctx = CancellationToken::new();
        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let serve_ctx = ctx.clone();
        tokio::spawn(async move { proxy.serve(serve_ctx, gateway).await });

        let balancer = FixedBalancer::new(Some(node_on(gport)));
        let metrics = Arc::new(Metrics::new());
        let dialer = LoadBalancedDialer::new(balancer.clone(), Arc::new(DirectDialer::default()))
            .with_metrics(Arc::clone(&metrics));

        let s = dialer
            .dial_context(&ctx, "tcp", &echo.to_string())
            .await
            .unwrap();
        assert_echoes(s).await;
        assert_eq!(balancer.closed.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.snapshot().chained_dials, 1);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_cancel_during_chained_dial() {
        // Accepts but never answers the greeting
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = silent.accept().await {
                held.push(s);
            }
        });

        let balancer = FixedBalancer::new(Some(node_on(port)));
        let dialer = LoadBalancedDialer::new(balancer.clone(), Arc::new(DirectDialer::default()));

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let res = dialer.dial_context(&ctx, "tcp", "127.0.0.1:9").await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(balancer.closed.load(Ordering::SeqCst), 0);
    }

    /// Accepts and hands every connection to the test without answering.
    async fn silent_gateway() -> (u16, tokio::sync::mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((s, _)) = listener.accept().await {
                if tx.send(s).is_err() {
                    break;
                }
            }
        });
        (port, rx)
    }

    /// Read the client greeting, then expect the peer to hang up.
    async fn assert_abandoned(mut gw: TcpStream) {
        let mut greeting = [0u8; 3];
        gw.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [SOCKS5_VERSION, 1, 0x00]);

        let mut rest = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), gw.read(&mut rest))
            .await
            .expect("gateway socket left open")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_silent_gateway_times_out_and_falls_back() {
        let echo = echo_server().await;
        let (port, mut accepted) = silent_gateway().await;
        let balancer = FixedBalancer::new(Some(node_on(port)));
        let tracer = Arc::new(CountingTracer::default());
        let metrics = Arc::new(Metrics::new());

        let dialer = LoadBalancedDialer::new(balancer.clone(), Arc::new(DirectDialer::default()))
            .with_handshake_timeout(Duration::from_millis(200))
            .with_tracer(tracer.clone())
            .with_metrics(Arc::clone(&metrics));

        let s = tokio::time::timeout(
            Duration::from_secs(2),
            dialer.dial_context(&CancellationToken::new(), "tcp", &echo.to_string()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_echoes(s).await;

        assert_eq!(balancer.closed.load(Ordering::SeqCst), 1);
        assert_eq!(tracer.0.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.evictions(), 1);
        assert_eq!(metrics.snapshot().direct_dials, 1);

        assert_abandoned(accepted.recv().await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_dropped_dial_abandons_gateway() {
        let (port, mut accepted) = silent_gateway().await;
        let balancer = FixedBalancer::new(Some(node_on(port)));
        let dialer = LoadBalancedDialer::new(balancer.clone(), Arc::new(DirectDialer::default()));

        let ctx = CancellationToken::new();
        let res = tokio::time::timeout(
            Duration::from_millis(100),
            dialer.dial_context(&ctx, "tcp", "127.0.0.1:9"),
        )
        .await;
        assert!(res.is_err());
        assert!(!ctx.is_cancelled());

        assert_abandoned(accepted.recv().await.unwrap()).await;
        assert_eq!(balancer.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let res = DirectDialer::default()
            .dial_context(&CancellationToken::new(), "udp", "127.0.0.1:80")
            .await;
        assert!(matches!(res, Err(Error::Dial(_))));
    }
}
