//! Per-connection protocol handling.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::Booster;
use crate::error::{Error, Result};
use crate::network::{short, Conn};
use crate::protocol::{
    check_version, Connect, CtrlOperation, Disconnect, Header, Heartbeat, Message, NetworkStatus,
    NodeStatus, Packet, TunnelEvent,
};
use crate::proxy::LoadBalancer;
use crate::pubsub::TOPIC_NODE_STATUS;

impl Booster {
    /// Process packets from `conn` until it closes or `ctx` fires, then
    /// close it.
    ///
    /// Protocol errors end the connection; anything else is logged and the
    /// loop carries on.
    pub(crate) async fn handle(self: Arc<Self>, ctx: CancellationToken, conn: Arc<Conn>) {
        let mut packets = match conn.consume().await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!("booster: cannot consume {}: {}", conn.peer_addr(), e);
                let _ = conn.close().await;
                return;
            }
        };

        loop {
            let packet = tokio::select! {
                p = packets.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
                _ = ctx.cancelled() => break,
            };

            if let Err(e) = self.handle_packet(&ctx, &conn, packet).await {
                if e.is_protocol_error() {
                    tracing::warn!("booster: closing {}: {}", conn.peer_addr(), e);
                    break;
                }
                if e.is_recoverable() {
                    tracing::debug!("booster: {}: {}", conn.peer_addr(), e);
                } else {
                    tracing::warn!("booster: {}: {}", conn.peer_addr(), e);
                }
            }
        }

        let _ = conn.close().await;
        tracing::debug!("booster: handler for {} done", conn.peer_addr());
    }

    async fn handle_packet(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        conn: &Arc<Conn>,
        packet: Packet,
    ) -> Result<()> {
        let header = packet.header()?;
        check_version(&header.protocol_version)?;

        match header.message {
            Message::Hello => self.on_hello(ctx, conn, &packet).await,
            Message::Connect => {
                let connect: Connect = packet.payload()?;
                self.spawn_wire(ctx, connect.target);
                Ok(())
            }
            Message::Disconnect => {
                let disconnect: Disconnect = packet.payload()?;
                self.network.close_node(&disconnect.id).await?;
                Ok(())
            }
            Message::Heartbeat => {
                let heartbeat: Heartbeat = packet.payload()?;
                self.metrics.heartbeat_received();
                conn.reset_heartbeat(self.config.heartbeat_ttl);
                tracing::trace!(
                    "booster: heartbeat from {} (hops {})",
                    short(&heartbeat.id),
                    heartbeat.hops
                );
                Ok(())
            }
            Message::Notify => {
                self.spawn_status_forwarder(ctx, conn);
                Ok(())
            }
            Message::NodeStatus => {
                let status: NodeStatus = packet.payload()?;
                self.on_node_status(status)
            }
            Message::Ctrl => self.on_ctrl(CtrlOperation::try_from(header.operation)?).await,
            Message::Monitor => {
                let status = self.network.status();
                let reply = Packet::compose(
                    &Header::new(Message::NetworkStatus),
                    &status,
                    self.config.encoding,
                )?;
                conn.send(&reply).await
            }
            Message::NetworkStatus => {
                let status: NetworkStatus = packet.payload()?;
                tracing::info!(
                    "booster: network {} reports {} nodes",
                    short(&status.id),
                    status.nodes.len()
                );
                Ok(())
            }
            Message::ProxyUpdate => {
                let event: TunnelEvent = packet.payload()?;
                let id = conn
                    .id()
                    .ok_or_else(|| Error::UnknownPeer(conn.peer_addr().to_string()))?;
                self.network.update_node(&id, event.event, &event.target).await?;
                Ok(())
            }
        }
    }

    /// Register the dialing peer that greeted us on an accepted connection.
    async fn on_hello(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        conn: &Arc<Conn>,
        packet: &Packet,
    ) -> Result<()> {
        if conn.remote().is_some() {
            return Err(Error::InvalidMessage("hello received twice".into()));
        }

        let node = self.node_from_hello(conn, &packet.payload()?)?;
        conn.set_remote(node);

        if let Err(e) = self.network.add_conn(Arc::clone(conn)) {
            let _ = conn.close().await;
            return Err(e);
        }

        self.arm(ctx, conn);
        tracing::info!("booster: <- wire: {}", conn.peer_addr());
        Ok(())
    }

    fn on_node_status(&self, status: NodeStatus) -> Result<()> {
        let node = self
            .network
            .node(&status.id)
            .ok_or_else(|| Error::UnknownPeer(status.id.clone()))?;
        if node.is_local() {
            return Err(Error::InvalidMessage("status update for the local node".into()));
        }

        node.set_tunnels(status.tunnels);
        tracing::debug!(
            "booster: node {} workload {}",
            short(node.id()),
            node.workload()
        );
        Ok(())
    }

    async fn on_ctrl(&self, op: CtrlOperation) -> Result<()> {
        match op {
            CtrlOperation::Stop => {
                tracing::info!("booster: stop requested by peer");
                self.close();
            }
            CtrlOperation::Restart => {
                tracing::info!("booster: restart requested by peer: dropping links");
                for conn in self.network.conns() {
                    conn.close().await?;
                }
            }
        }
        Ok(())
    }

    /// Wire to `target` in the background.
    fn spawn_wire(self: &Arc<Self>, ctx: &CancellationToken, target: String) {
        let booster = Arc::clone(self);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = booster.wire(ctx, "tcp", &target).await {
                tracing::warn!("booster: cannot wire {}: {}", target, e);
            }
        });
    }

    /// Send the local node state over `conn` now and on every change, until
    /// the connection closes.
    fn spawn_status_forwarder(self: &Arc<Self>, ctx: &CancellationToken, conn: &Arc<Conn>) {
        let booster = Arc::clone(self);
        let ctx = ctx.clone();
        let conn = Arc::clone(conn);
        let mut sub = self.pubsub.sub(TOPIC_NODE_STATUS);

        tokio::spawn(async move {
            let mut next = Some(booster.network.local().status());
            while let Some(status) = next {
                let sent = match Packet::compose(
                    &Header::node_status(),
                    &status,
                    booster.config.encoding,
                ) {
                    Ok(packet) => conn.send(&packet).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::debug!("booster: status to {} failed: {}", conn.peer_addr(), e);
                    break;
                }

                next = tokio::select! {
                    s = sub.recv() => s,
                    _ = conn.closed() => None,
                    _ = ctx.cancelled() => None,
                };
            }

            let _ = booster.pubsub.unsub(&sub);
        });
    }
}
