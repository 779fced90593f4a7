//! Booster node orchestration.
//!
//! A [`Booster`] ties together the local node, the SOCKS5 proxy and the
//! booster protocol listener:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Booster                             │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────┐  │
//! │  │ booster listener │  │   SOCKS5 proxy   │  │ update_root│  │
//! │  │  (Hello, Handle) │  │ (balanced dials) │  │ (tunnels)  │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └─────┬──────┘  │
//! │           │                     │                  │         │
//! │           ▼                     ▼                  ▼         │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │           Network (nodes, one Conn per peer)           │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Links are set up in two directions. The listener greets every accepted
//! connection with a Hello; the dialing side answers with its own Hello,
//! registers the link, asks for tunnel notifications and starts heartbeating.

mod handler;

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BoosterConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::network::{node_id, short, Conn, Network, Node, Registry};
use crate::protocol::{
    check_version, Header, Heartbeat, Hello, Message, NodeStatus, Packet, TunnelEvent,
};
use crate::proxy::{DirectDialer, LoadBalancedDialer, Proxy, Socks5};
use crate::pubsub::{LocalPubSub, PubSub, TOPIC_NODE_STATUS};

/// A booster node.
pub struct Booster {
    id: String,
    config: Arc<BoosterConfig>,
    registry: Arc<Registry>,
    network: Arc<Network>,
    proxy: Arc<dyn Proxy>,
    pubsub: Arc<dyn PubSub<NodeStatus>>,
    metrics: Arc<Metrics>,
    /// Fired by `close()`; parent of every context `run()` hands out
    stop: CancellationToken,
}

impl Booster {
    /// Create a booster whose SOCKS5 proxy chains through the peers of its
    /// own network.
    pub fn new(config: BoosterConfig) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;

        let registry = Arc::new(Registry::new());
        let network = register_network(&config, &registry)?;
        let metrics = Arc::new(Metrics::new());

        let fallback = Arc::new(DirectDialer::new(config.dial_timeout, config.keep_alive));
        // Half the request budget, leaving the rest for the direct fallback
        let dialer = LoadBalancedDialer::new(network, fallback)
            .with_handshake_timeout(config.request_timeout / 2)
            .with_metrics(Arc::clone(&metrics));
        let proxy = Socks5::new(Arc::new(dialer))
            .with_metrics(Arc::clone(&metrics))
            .with_request_timeout(config.request_timeout)
            .with_replies(config.socks5_replies);

        Self::with_parts(
            config,
            registry,
            Arc::new(proxy),
            Arc::new(LocalPubSub::<NodeStatus>::new()),
            metrics,
        )
    }

    /// Assemble a booster from explicit collaborators. The local network is
    /// taken from `registry` or added to it.
    pub fn with_parts(
        config: BoosterConfig,
        registry: Arc<Registry>,
        proxy: Arc<dyn Proxy>,
        pubsub: Arc<dyn PubSub<NodeStatus>>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;

        let id = node_id(&config.proxy_port.to_string(), &config.booster_port.to_string());
        let network = match registry.get(&id) {
            Some(network) => network,
            None => register_network(&config, &registry)?,
        };

        tracing::info!(
            "booster {}: proxy port {}, booster port {}",
            short(&id),
            config.proxy_port,
            config.booster_port
        );

        Ok(Arc::new(Self {
            id,
            config: Arc::new(config),
            registry,
            network,
            proxy,
            pubsub,
            metrics,
            stop: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &BoosterConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Token fired when the booster is closed. Use it, or a child of it, as
    /// the context of links wired outside `run()`.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run the booster listener, the proxy and the tunnel update loop until
    /// one of them fails, `close()` is called or an interrupt arrives.
    ///
    /// Every task is waited for before returning. Returns [`Error::Stopped`]
    /// when closed, otherwise the error that ended the first task.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let ctx = self.stop.child_token();
        let mut tasks = JoinSet::new();

        {
            let booster = Arc::clone(self);
            let ctx = ctx.clone();
            let port = self.config.booster_port;
            tasks.spawn(async move { booster.listen_and_serve(ctx, port).await });
        }
        {
            let proxy = Arc::clone(&self.proxy);
            let ctx = ctx.clone();
            let port = self.config.proxy_port;
            tasks.spawn(async move { proxy.listen_and_serve(ctx, port).await });
        }
        {
            let booster = Arc::clone(self);
            let ctx = ctx.clone();
            tasks.spawn(async move { booster.update_root(ctx).await });
        }

        let first = tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(Error::Stopped),
            Some(res) = tasks.join_next() => match res {
                Ok(res) => res,
                Err(e) => Err(Error::Task(e.to_string())),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("booster: interrupt received: exiting...");
                self.close();
                Err(Error::Stopped)
            }
        };

        ctx.cancel();
        while tasks.join_next().await.is_some() {}

        for conn in self.network.conns() {
            let _ = conn.close().await;
        }

        if let Err(e) = &first {
            tracing::info!("booster {}: run ended: {}", short(&self.id), e);
        }
        first
    }

    /// Stop `run()`. Safe to call at any time, any number of times.
    pub fn close(&self) {
        self.stop.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Accept booster connections on `port` until `ctx` is cancelled.
    pub async fn listen_and_serve(self: &Arc<Self>, ctx: CancellationToken, port: u16) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        self.serve(ctx, listener).await
    }

    /// Accept booster connections on `listener` until `ctx` is cancelled.
    ///
    /// Each connection is greeted with a Hello before its handler starts and
    /// must answer within the heartbeat TTL. An accept failure, or a failure
    /// to send the Hello, ends the listener.
    pub async fn serve(self: &Arc<Self>, ctx: CancellationToken, listener: TcpListener) -> Result<()> {
        tracing::info!("booster: listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                res = listener.accept() => res.map_err(|e| {
                    tracing::error!("booster: cannot accept conn: {}", e);
                    e
                })?,
                _ = ctx.cancelled() => {
                    tracing::info!("booster: listener stopped");
                    return Err(Error::Cancelled);
                }
            };

            let conn = match Conn::new(stream, Arc::clone(&self.metrics)) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("booster: dropping conn from {}: {}", peer, e);
                    continue;
                }
            };

            if let Err(e) = self.send_hello(&conn).await {
                let _ = conn.close().await;
                return Err(e);
            }
            // A peer that never greets back expires like a silent one
            conn.reset_heartbeat(self.config.heartbeat_ttl);
            tracing::debug!("booster: <- accepted {}", peer);

            let booster = Arc::clone(self);
            let ctx = ctx.clone();
            tokio::spawn(async move { booster.handle(ctx, conn).await });
        }
    }

    /// Dial a booster and complete the Hello exchange.
    pub async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<Arc<Conn>> {
        let dialer = DirectDialer::new(self.config.dial_timeout, self.config.keep_alive);
        let stream = crate::proxy::Dialer::dial_context(&dialer, ctx, network, addr).await?;
        let conn = Conn::new(stream, Arc::clone(&self.metrics))?;

        match self.recv_hello(ctx, &conn).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                let _ = conn.close().await;
                Err(e)
            }
        }
    }

    /// Wait for the peer's Hello, attach the node it describes and answer
    /// with our own.
    pub async fn recv_hello(&self, ctx: &CancellationToken, conn: &Arc<Conn>) -> Result<()> {
        let ttl = self.config.heartbeat_ttl;
        let packet = tokio::select! {
            res = tokio::time::timeout(ttl, conn.recv()) => {
                res.map_err(|_| Error::Timeout(ttl.as_millis() as u64))??
            }
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };

        let header = packet.header()?;
        check_version(&header.protocol_version)?;
        if header.message != Message::Hello {
            return Err(Error::InvalidMessage(format!(
                "expected hello, got {:?}",
                header.message
            )));
        }

        let node = self.node_from_hello(conn, &packet.payload()?)?;
        conn.set_remote(node);
        self.send_hello(conn).await
    }

    /// Establish and register a link to the booster listening at `target`.
    ///
    /// Fails with [`Error::DuplicatePeer`] if a live link to that node
    /// exists; the existing link is not affected.
    pub async fn wire(
        self: &Arc<Self>,
        ctx: CancellationToken,
        network: &str,
        target: &str,
    ) -> Result<Arc<Conn>> {
        let conn = self.dial_context(&ctx, network, target).await?;

        if let Err(e) = self.network.add_conn(Arc::clone(&conn)) {
            let _ = conn.close().await;
            return Err(e);
        }

        if let Err(e) = self.request_notifications(&conn).await {
            let _ = conn.close().await;
            return Err(e);
        }

        self.activate(&ctx, &conn);
        tracing::info!("booster: -> wire: {}", target);
        Ok(conn)
    }

    async fn request_notifications(&self, conn: &Conn) -> Result<()> {
        let notify = Packet::with_header(&Header::tunnel_notify(), self.config.encoding)?;
        conn.send(&notify).await?;
        conn.send(&self.compose_heartbeat(None)?).await
    }

    /// Arm the heartbeat timer, start heartbeating and mark the remote node
    /// active.
    fn arm(self: &Arc<Self>, ctx: &CancellationToken, conn: &Arc<Conn>) {
        conn.reset_heartbeat(self.config.heartbeat_ttl);
        self.spawn_heartbeat(ctx.clone(), Arc::clone(conn));
        if let Some(node) = conn.remote() {
            node.set_active(true);
        }
    }

    /// [`arm`](Self::arm) a freshly wired link and start its handler.
    fn activate(self: &Arc<Self>, ctx: &CancellationToken, conn: &Arc<Conn>) {
        self.arm(ctx, conn);

        let booster = Arc::clone(self);
        let ctx = ctx.clone();
        let conn = Arc::clone(conn);
        tokio::spawn(async move { booster.handle(ctx, conn).await });
    }

    /// Forward proxy tunnel events into the local node until `ctx` fires.
    ///
    /// Returns [`Error::ChannelClosed`] if the proxy stops notifying on its
    /// own and [`Error::Cancelled`] on shutdown.
    pub async fn update_root(&self, ctx: CancellationToken) -> Result<()> {
        let mut events = self.proxy.notify();

        loop {
            let event = tokio::select! {
                ev = events.recv() => ev,
                _ = ctx.cancelled() => {
                    self.proxy.stop_notifying();
                    return Err(Error::Cancelled);
                }
            };

            let Some(event) = event else {
                self.proxy.stop_notifying();
                return Err(Error::ChannelClosed(format!(
                    "{} tunnel notifications",
                    self.proxy.proto()
                )));
            };

            if let Err(e) = self.update_local(&event) {
                tracing::warn!("booster: {}", e);
            }
        }
    }

    /// Apply a tunnel event to the local node and publish its new state.
    pub fn update_local(&self, event: &TunnelEvent) -> Result<()> {
        let local = self.network.local();
        local.apply(&event.target, event.event)?;
        self.pubsub.publish(local.status(), TOPIC_NODE_STATUS)?;
        Ok(())
    }

    async fn send_hello(&self, conn: &Conn) -> Result<()> {
        let hello = Hello {
            bport: self.config.booster_port.to_string(),
            pport: self.config.proxy_port.to_string(),
        };
        let packet = Packet::compose(&Header::hello(), &hello, self.config.encoding)?;
        conn.send(&packet).await
    }

    /// Heartbeat packet from this node. `prev` is the heartbeat being relayed,
    /// if any.
    pub fn compose_heartbeat(&self, prev: Option<&Heartbeat>) -> Result<Packet> {
        let ttl = chrono::Duration::from_std(self.config.heartbeat_ttl)
            .map_err(|e| Error::config(format!("heartbeat_ttl: {}", e)))?;
        let heartbeat = Heartbeat {
            id: self.id.clone(),
            hops: prev.map_or(0, |h| h.hops + 1),
            ttl: chrono::Utc::now() + ttl,
        };
        Packet::compose(&Header::heartbeat(), &heartbeat, self.config.encoding)
    }

    /// Send a heartbeat every half TTL until the link or `ctx` closes.
    fn spawn_heartbeat(self: &Arc<Self>, ctx: CancellationToken, conn: Arc<Conn>) {
        let booster = Arc::clone(self);
        let interval = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = conn.closed() => return,
                    _ = ctx.cancelled() => return,
                }

                let sent = match booster.compose_heartbeat(None) {
                    Ok(packet) => conn.send(&packet).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::debug!("booster: heartbeat to {} failed: {}", conn.peer_addr(), e);
                    return;
                }
            }
        });
    }

    /// Remote node described by a Hello received on `conn`.
    fn node_from_hello(&self, conn: &Conn, hello: &Hello) -> Result<Arc<Node>> {
        let host = conn.peer_addr().ip().to_string();
        Ok(Arc::new(Node::new(&host, &hello.pport, &hello.bport, false)?))
    }
}

fn register_network(config: &BoosterConfig, registry: &Registry) -> Result<Arc<Network>> {
    let local = Node::new(
        "localhost",
        &config.proxy_port.to_string(),
        &config.booster_port.to_string(),
        true,
    )?;
    let network = Arc::new(Network::new(Arc::new(local)));
    registry.insert(Arc::clone(&network));
    Ok(network)
}
