//! Byte relays used once a SOCKS5 command is set up.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::socks5::{encode_socket_addr, parse_address};
use crate::error::{Error, Result};

/// Largest UDP datagram the associate relay handles.
const UDP_BUFFER_SIZE: usize = 64 * 1024;
/// Per-direction buffer of the TCP relay.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy bytes both ways between `client` and `remote` until the remote side
/// closes, either direction fails, or `ctx` fires. A client that finishes
/// sending only half-closes the remote; the relay keeps delivering the
/// response. Both sockets are dropped on return.
///
/// Returns (client to remote, remote to client) byte counts.
pub async fn relay_tcp(
    ctx: &CancellationToken,
    mut client: TcpStream,
    mut remote: TcpStream,
) -> Result<(u64, u64)> {
    let (mut client_reader, mut client_writer) = client.split();
    let (mut remote_reader, mut remote_writer) = remote.split();
    let (up_bytes, down_bytes) = (AtomicU64::new(0), AtomicU64::new(0));

    // Client -> remote
    let upstream = async {
        let res = copy_counted(&mut client_reader, &mut remote_writer, &up_bytes).await;
        let _ = remote_writer.shutdown().await;
        res
    };
    tokio::pin!(upstream);
    let mut upstream_done = false;

    // Remote -> client
    let downstream = async {
        let res = copy_counted(&mut remote_reader, &mut client_writer, &down_bytes).await;
        let _ = client_writer.shutdown().await;
        res
    };
    tokio::pin!(downstream);

    loop {
        tokio::select! {
            res = &mut upstream, if !upstream_done => {
                upstream_done = true;
                if let Err(e) = res {
                    tracing::debug!("relay: client side failed: {}", e);
                    break;
                }
            }
            res = &mut downstream => {
                if let Err(e) = res {
                    tracing::debug!("relay: remote side failed: {}", e);
                }
                break;
            }
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        }
    }

    Ok((
        up_bytes.load(Ordering::Relaxed),
        down_bytes.load(Ordering::Relaxed),
    ))
}

/// `tokio::io::copy` that keeps its running total in `count`.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, count: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush().await;
        }
        writer.write_all(&buf[..n]).await?;
        count.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Relay SOCKS5 UDP datagrams through `socket` for as long as the `control`
/// connection stays open.
///
/// The first datagram arriving from the control connection's IP fixes the
/// client's UDP address. Datagrams from the client carry a SOCKS5 UDP header
/// naming their destination; datagrams from anywhere else are wrapped in a
/// header naming their source and sent back to the client. Fragmented
/// datagrams are dropped.
pub async fn relay_udp(
    ctx: &CancellationToken,
    control: &mut TcpStream,
    socket: UdpSocket,
) -> Result<()> {
    let client_ip = control.peer_addr()?.ip();
    let mut client: Option<SocketAddr> = None;
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            res = control.read(&mut scratch) => {
                match res {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => continue,
                }
            }
            res = socket.recv_from(&mut buf) => {
                let (n, from) = res?;

                let from_client = match client {
                    Some(addr) => addr == from,
                    None => from.ip() == client_ip,
                };

                if from_client {
                    client = Some(from);
                    if let Err(e) = forward_to_target(&socket, &buf[..n]).await {
                        tracing::debug!("udp relay: dropping datagram from {}: {}", from, e);
                    }
                } else if let Some(client) = client {
                    let mut out = Vec::with_capacity(n + 22);
                    out.extend_from_slice(&[0, 0, 0]);
                    out.extend_from_slice(&encode_socket_addr(from));
                    out.extend_from_slice(&buf[..n]);
                    socket.send_to(&out, client).await?;
                }
            }
        }
    }
}

/// Strip the SOCKS5 UDP header from `datagram` and send the rest on.
async fn forward_to_target(socket: &UdpSocket, datagram: &[u8]) -> Result<()> {
    if datagram.len() < 4 {
        return Err(Error::malformed("short udp datagram"));
    }
    if datagram[2] != 0 {
        return Err(Error::malformed("fragmented udp datagram"));
    }

    let (target, used) = parse_address(&datagram[3..])?;
    let payload = &datagram[3 + used..];

    let dst = tokio::net::lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| Error::dial(format!("no address for {}", target)))?;
    socket.send_to(payload, dst).await?;
    Ok(())
}
