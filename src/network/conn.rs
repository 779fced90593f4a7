//! Booster protocol connections.
//!
//! A [`Conn`] owns one TCP stream to a peer booster and speaks in terms of
//! [`Packet`]s. It closes itself when the stream ends, when a received packet
//! cannot be decoded, or when its heartbeat timer expires.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::Node;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::protocol::{Packet, PacketCodec};

/// Capacity of the channel returned by [`Conn::consume`].
const CONSUME_BUFFER: usize = 64;

/// A booster-to-booster connection.
pub struct Conn {
    peer_addr: SocketAddr,
    /// Remote node, known once its Hello has been processed
    remote: RwLock<Option<Arc<Node>>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: tokio::sync::Mutex<Option<FramedRead<OwnedReadHalf, PacketCodec>>>,
    closed: AtomicBool,
    /// Fired on close; stops the reader and the heartbeat timer
    cancel: CancellationToken,
    /// Deadline updates for the running heartbeat timer
    heartbeat: Mutex<Option<watch::Sender<Instant>>>,
    metrics: Arc<Metrics>,
}

impl Conn {
    /// Wrap an established stream.
    pub fn new(stream: TcpStream, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        metrics.connection_opened();

        Ok(Arc::new(Self {
            peer_addr,
            remote: RwLock::new(None),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader: tokio::sync::Mutex::new(Some(FramedRead::new(read_half, PacketCodec))),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            heartbeat: Mutex::new(None),
            metrics,
        }))
    }

    /// Address of the other end of the socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Remote node this connection represents.
    pub fn remote(&self) -> Option<Arc<Node>> {
        self.remote.read().clone()
    }

    /// Attach the remote node.
    pub fn set_remote(&self, node: Arc<Node>) {
        *self.remote.write() = Some(node);
    }

    /// Id of the remote node, if known.
    pub fn id(&self) -> Option<String> {
        self.remote.read().as_ref().map(|n| n.id().to_string())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Serialize and write `packet`. Concurrent sends are serialized.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let data = packet.encode();

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(Error::ConnectionClosed)?;
        tokio::select! {
            res = w.write_all(&data) => res.map_err(Error::WriteFailed)?,
            _ = self.cancel.cancelled() => return Err(Error::ConnectionClosed),
        }

        self.metrics.packet_sent();
        Ok(())
    }

    /// Read a single packet. Used during the handshake, before [`consume`].
    ///
    /// [`consume`]: Conn::consume
    pub async fn recv(&self) -> Result<Packet> {
        let mut reader = self.reader.lock().await;
        let framed = reader.as_mut().ok_or(Error::ConnectionClosed)?;
        let next = tokio::select! {
            next = framed.next() => next,
            _ = self.cancel.cancelled() => return Err(Error::ConnectionClosed),
        };

        match next {
            Some(Ok(packet)) => {
                self.metrics.packet_received();
                Ok(packet)
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Start delivering incoming packets on a channel.
    ///
    /// Packets arrive in wire order. The channel ends when the socket closes
    /// or a packet fails to decode, at which point the connection is closed.
    /// Can be called once per connection.
    pub async fn consume(self: &Arc<Self>) -> Result<mpsc::Receiver<Packet>> {
        let mut framed = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidMessage("connection already consumed".into()))?;

        let (tx, rx) = mpsc::channel(CONSUME_BUFFER);
        let conn = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = framed.next() => next,
                    _ = conn.cancel.cancelled() => break,
                };
                match next {
                    Some(Ok(packet)) => {
                        conn.metrics.packet_received();
                        if tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("conn {}: receive error: {}", conn.peer_addr, e);
                        break;
                    }
                    None => break,
                }
            }
            drop(framed);
            let _ = conn.close().await;
        });

        Ok(rx)
    }

    /// (Re)arm the heartbeat timer. The connection closes itself if the
    /// timer is not reset again within `ttl`.
    ///
    /// Has no effect once the connection is closed.
    pub fn reset_heartbeat(self: &Arc<Self>, ttl: Duration) {
        if self.is_closed() {
            return;
        }
        let deadline = Instant::now() + ttl;

        let mut slot = self.heartbeat.lock();
        if let Some(tx) = slot.as_ref() {
            if tx.send(deadline).is_ok() {
                return;
            }
        }

        let (tx, rx) = watch::channel(deadline);
        *slot = Some(tx);
        drop(slot);

        tokio::spawn(expire(Arc::downgrade(self), rx, self.cancel.clone()));
    }

    /// True while a heartbeat timer is armed.
    pub fn heartbeat_armed(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    /// Close the connection. Safe to call any number of times, from any task.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        self.heartbeat.lock().take();
        self.metrics.connection_closed();

        if let Some(node) = self.remote() {
            if !node.is_local() {
                node.set_active(false);
            }
        }

        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        self.reader.lock().await.take();

        tracing::debug!("conn {}: closed", self.peer_addr);
        Ok(())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer_addr", &self.peer_addr)
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Heartbeat timer task: closes `conn` once the latest deadline passes.
async fn expire(conn: Weak<Conn>, mut rx: watch::Receiver<Instant>, cancel: CancellationToken) {
    loop {
        let deadline = *rx.borrow_and_update();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => break,
            res = rx.changed() => {
                if res.is_err() {
                    return;
                }
            }
        }
    }

    if let Some(conn) = conn.upgrade() {
        tracing::warn!(
            "conn {}: no heartbeat received from {:?}: timer expired",
            conn.peer_addr,
            conn.id()
        );
        let _ = conn.close().await;
    }
}
