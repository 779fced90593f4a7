//! SOCKS5 proxy server (RFC 1928, no-auth subset).
//!
//! Accepts client connections, negotiates the method, parses the request and
//! dispatches Connect, Bind and Associate. Outbound connections go through the
//! configured [`Dialer`], which is how the booster chains traffic through
//! other nodes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dialer::Dialer;
use super::relay::{relay_tcp, relay_udp};
use super::Proxy;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::network::join_host_port;
use crate::protocol::{TunnelEvent, TunnelOperation};

pub const SOCKS5_VERSION: u8 = 0x05;

// Methods
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

// Commands
const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_ASSOCIATE: u8 = 0x03;

// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// Reply codes
const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Default time allowed for a command to be set up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 server.
#[derive(Clone)]
pub struct Socks5 {
    dialer: Arc<dyn Dialer>,
    notifier: Arc<Mutex<Option<mpsc::UnboundedSender<TunnelEvent>>>>,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
    /// Send RFC 1928 reply frames after each command
    replies: bool,
}

impl Socks5 {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            notifier: Arc::new(Mutex::new(None)),
            metrics: Arc::new(Metrics::new()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            replies: true,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Disable reply frames. Standard clients, including chained boosters,
    /// wait for them, so only turn this off for peers that do not.
    pub fn with_replies(mut self, replies: bool) -> Self {
        self.replies = replies;
        self
    }

    /// Accept clients on `listener` until `ctx` is cancelled.
    pub async fn serve(&self, ctx: CancellationToken, listener: TcpListener) -> Result<()> {
        tracing::info!("socks5: listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = ctx.cancelled() => {
                    tracing::info!("socks5: listener stopped");
                    return Err(Error::Cancelled);
                }
            };

            let (client, peer) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("socks5: accept error: {}", e);
                    continue;
                }
            };

            let proxy = self.clone();
            let ctx = ctx.child_token();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle(&ctx, client).await {
                    tracing::debug!("socks5: {}: {}", peer, e);
                }
                tracing::debug!("socks5: connection to {} closed", peer);
            });
        }
    }

    /// Serve one client. The client socket is dropped on every return path.
    pub async fn handle(&self, ctx: &CancellationToken, mut client: TcpStream) -> Result<()> {
        let deadline = Instant::now() + self.request_timeout;

        let (cmd, target) = tokio::select! {
            res = tokio::time::timeout_at(deadline, self.read_request(&mut client)) => {
                res.map_err(|_| Error::Timeout(self.request_timeout.as_millis() as u64))??
            }
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };
        self.metrics.socks_request();

        match cmd {
            CMD_CONNECT | CMD_BIND | CMD_ASSOCIATE => {
                self.emit(&target, TunnelOperation::Add);
                let res = match cmd {
                    CMD_CONNECT => self.connect(ctx, client, &target, deadline).await,
                    CMD_BIND => self.bind(ctx, client, &target, deadline).await,
                    _ => self.associate(ctx, client, &target).await,
                };
                self.emit(&target, TunnelOperation::Remove);
                res
            }
            _ => {
                self.reply(&mut client, REP_COMMAND_NOT_SUPPORTED, None).await?;
                Err(Error::UnsupportedCommand(cmd))
            }
        }
    }

    /// Negotiate and read the command and target address.
    async fn read_request(&self, client: &mut TcpStream) -> Result<(u8, String)> {
        negotiate(client).await?;

        let mut header = [0u8; 3];
        client.read_exact(&mut header).await?;
        let (version, cmd) = (header[0], header[1]);
        if version != SOCKS5_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        match read_address(client).await {
            Ok(target) => Ok((cmd, target)),
            Err(e @ Error::UnsupportedAddressType(_)) => {
                self.reply(client, REP_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Dial `target` and relay.
    async fn connect(
        &self,
        ctx: &CancellationToken,
        mut client: TcpStream,
        target: &str,
        deadline: Instant,
    ) -> Result<()> {
        let dial = self.dialer.dial_context(ctx, "tcp", target);
        let remote = match tokio::time::timeout_at(deadline, dial).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                self.reply(&mut client, reply_code(&e), None).await?;
                return Err(e);
            }
            Err(_) => {
                self.reply(&mut client, REP_HOST_UNREACHABLE, None).await?;
                return Err(Error::Timeout(self.request_timeout.as_millis() as u64));
            }
        };

        self.emit(target, TunnelOperation::Ack);
        self.reply(&mut client, REP_SUCCEEDED, remote.local_addr().ok())
            .await?;

        let (up, down) = relay_tcp(ctx, client, remote).await?;
        tracing::debug!("socks5: {}: relayed {} up, {} down", target, up, down);
        Ok(())
    }

    /// Wait for one inbound connection on an ephemeral port and relay it.
    async fn bind(
        &self,
        ctx: &CancellationToken,
        mut client: TcpStream,
        target: &str,
        deadline: Instant,
    ) -> Result<()> {
        let listener = TcpListener::bind((client.local_addr()?.ip(), 0)).await?;
        self.reply(&mut client, REP_SUCCEEDED, listener.local_addr().ok())
            .await?;

        let accepted = tokio::select! {
            res = tokio::time::timeout_at(deadline, listener.accept()) => res,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };
        let (remote, peer) = match accepted {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                self.reply(&mut client, REP_GENERAL_FAILURE, None).await?;
                return Err(e.into());
            }
            Err(_) => {
                self.reply(&mut client, REP_HOST_UNREACHABLE, None).await?;
                return Err(Error::Timeout(self.request_timeout.as_millis() as u64));
            }
        };
        drop(listener);

        tracing::debug!("socks5: bind for {} accepted {}", target, peer);
        self.emit(target, TunnelOperation::Ack);
        self.reply(&mut client, REP_SUCCEEDED, Some(peer)).await?;

        relay_tcp(ctx, client, remote).await?;
        Ok(())
    }

    /// Relay UDP for the client until its control connection closes.
    async fn associate(
        &self,
        ctx: &CancellationToken,
        mut client: TcpStream,
        target: &str,
    ) -> Result<()> {
        let socket = UdpSocket::bind((client.local_addr()?.ip(), 0)).await?;
        self.reply(&mut client, REP_SUCCEEDED, socket.local_addr().ok())
            .await?;

        tracing::debug!("socks5: udp associate for {} on {:?}", target, socket.local_addr());
        self.emit(target, TunnelOperation::Ack);

        relay_udp(ctx, &mut client, socket).await
    }

    /// Send a reply frame, if replies are enabled.
    async fn reply<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        rep: u8,
        bound: Option<SocketAddr>,
    ) -> Result<()> {
        if !self.replies {
            return Ok(());
        }
        let bound = bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

        let mut frame = vec![SOCKS5_VERSION, rep, 0x00];
        frame.extend_from_slice(&encode_socket_addr(bound));
        w.write_all(&frame).await?;
        Ok(())
    }

    /// Report a tunnel change to the registered listener, if any.
    fn emit(&self, target: &str, event: TunnelOperation) {
        if let Some(tx) = self.notifier.lock().as_ref() {
            let _ = tx.send(TunnelEvent {
                target: target.to_string(),
                event,
            });
        }
    }
}

#[async_trait]
impl Proxy for Socks5 {
    fn notify(&self) -> mpsc::UnboundedReceiver<TunnelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notifier.lock() = Some(tx);
        rx
    }

    fn stop_notifying(&self) {
        self.notifier.lock().take();
    }

    async fn listen_and_serve(&self, ctx: CancellationToken, port: u16) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        self.serve(ctx, listener).await
    }

    fn proto(&self) -> &'static str {
        "socks5"
    }
}

/// Method sub-negotiation. Only "no authentication" is accepted.
pub async fn negotiate<S>(s: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    s.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::UnsupportedVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    s.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        s.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        s.write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        Err(Error::NoAcceptableMethod)
    }
}

/// Read an address type byte, the address and a big-endian port, and format
/// them as `host:port`.
pub async fn read_address<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let atyp = r.read_u8().await?;
    let len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => r.read_u8().await? as usize,
        other => return Err(Error::UnsupportedAddressType(other)),
    };

    let mut raw = vec![0u8; len];
    r.read_exact(&mut raw).await?;
    let host = format_host(atyp, &raw)?;
    let port = r.read_u16().await?;

    Ok(join_host_port(&host, &port.to_string()))
}

/// Parse an address from the start of `buf`, returning it and the number of
/// bytes consumed.
pub fn parse_address(buf: &[u8]) -> Result<(String, usize)> {
    let atyp = *buf
        .first()
        .ok_or_else(|| Error::malformed("empty address"))?;

    let (start, len) = match atyp {
        ATYP_IPV4 => (1, 4),
        ATYP_IPV6 => (1, 16),
        ATYP_DOMAIN => {
            let len = *buf
                .get(1)
                .ok_or_else(|| Error::malformed("missing domain length"))?;
            (2, len as usize)
        }
        other => return Err(Error::UnsupportedAddressType(other)),
    };

    let end = start + len;
    if buf.len() < end + 2 {
        return Err(Error::malformed("truncated address"));
    }
    let host = format_host(atyp, &buf[start..end])?;
    let port = u16::from_be_bytes([buf[end], buf[end + 1]]);

    Ok((join_host_port(&host, &port.to_string()), end + 2))
}

fn format_host(atyp: u8, raw: &[u8]) -> Result<String> {
    match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = raw
                .try_into()
                .map_err(|_| Error::malformed("bad ipv4 address"))?;
            Ok(Ipv4Addr::from(octets).to_string())
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = raw
                .try_into()
                .map_err(|_| Error::malformed("bad ipv6 address"))?;
            Ok(Ipv6Addr::from(octets).to_string())
        }
        _ => String::from_utf8(raw.to_vec()).map_err(|_| Error::malformed("domain is not utf-8")),
    }
}

/// Encode `addr` (`host:port`) in SOCKS5 address form.
pub fn encode_address(addr: &str) -> Result<Vec<u8>> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(encode_socket_addr(sa));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::dial(format!("missing port in address {}", addr)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::dial(format!("invalid port in address {}", addr)))?;
    if host.is_empty() || host.len() > 255 {
        return Err(Error::dial(format!("invalid host in address {}", addr)));
    }

    let mut out = Vec::with_capacity(4 + host.len());
    out.push(ATYP_DOMAIN);
    out.push(host.len() as u8);
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(&port.to_be_bytes());
    Ok(out)
}

pub fn encode_socket_addr(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn reply_code(e: &Error) -> u8 {
    match e {
        Error::Network(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            REP_CONNECTION_REFUSED
        }
        Error::Network(_) | Error::Dial(_) | Error::Timeout(_) => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DirectDialer;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_proxy(proxy: Socks5) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = CancellationToken::new();
        let serve_ctx = ctx.clone();
        tokio::spawn(async move { proxy.serve(serve_ctx, listener).await });
        (addr, ctx)
    }

    /// Greets, sends `cmd` for `target` and returns the stream.
    async fn request(proxy: SocketAddr, cmd: u8, target: &[u8]) -> TcpStream {
        let mut s = TcpStream::connect(proxy).await.unwrap();
        s.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        s.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let mut req = vec![5, cmd, 0];
        req.extend_from_slice(target);
        s.write_all(&req).await.unwrap();
        s
    }

    /// Reads a reply frame, returning the code and bound address.
    async fn read_reply(s: &mut TcpStream) -> (u8, String) {
        let mut head = [0u8; 3];
        s.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 5);
        let addr = read_address(s).await.unwrap();
        (head[1], addr)
    }

    #[tokio::test]
    async fn test_read_address_ipv4() {
        let raw = [ATYP_IPV4, 192, 168, 1, 1, 0x1F, 0x90];
        let addr = read_address(&mut &raw[..]).await.unwrap();
        assert_eq!(addr, "192.168.1.1:8000");
    }

    #[tokio::test]
    async fn test_read_address_domain() {
        let mut raw = vec![ATYP_DOMAIN, 11];
        raw.extend_from_slice(b"example.com");
        raw.extend_from_slice(&[0x1F, 0x90]);
        let addr = read_address(&mut &raw[..]).await.unwrap();
        assert_eq!(addr, "example.com:8000");
    }

    #[tokio::test]
    async fn test_read_address_ipv6() {
        let mut raw = vec![ATYP_IPV6];
        raw.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        raw.extend_from_slice(&[0x00, 0x50]);
        let addr = read_address(&mut &raw[..]).await.unwrap();
        assert_eq!(addr, "[::1]:80");
    }

    #[tokio::test]
    async fn test_read_address_unsupported_type() {
        let raw = [0x02, 1, 2, 3, 4, 0, 80];
        assert!(matches!(
            read_address(&mut &raw[..]).await,
            Err(Error::UnsupportedAddressType(0x02))
        ));
    }

    #[test]
    fn test_parse_address_consumes_exactly() {
        let mut raw = encode_address("example.com:443").unwrap();
        raw.extend_from_slice(b"payload");
        let (addr, used) = parse_address(&raw).unwrap();
        assert_eq!(addr, "example.com:443");
        assert_eq!(&raw[used..], b"payload");

        assert!(matches!(
            parse_address(&[ATYP_IPV4, 1, 2]),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_encode_address() {
        assert_eq!(
            encode_address("10.0.0.1:80").unwrap(),
            vec![ATYP_IPV4, 10, 0, 0, 1, 0, 80]
        );
        assert!(encode_address("no-port").is_err());
        assert!(encode_address("host:99999").is_err());
    }

    #[tokio::test]
    async fn test_negotiate_rejects_auth_only_clients() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[5, 1, 2]).await.unwrap();

        let res = negotiate(&mut server).await;
        assert!(matches!(res, Err(Error::NoAcceptableMethod)));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xff]);
    }

    #[tokio::test]
    async fn test_connect_relays_and_emits_events() {
        let echo = echo_server().await;
        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let mut events = proxy.notify();
        let (addr, ctx) = start_proxy(proxy).await;

        let mut s = request(addr, CMD_CONNECT, &encode_socket_addr(echo)).await;
        let (rep, _) = read_reply(&mut s).await;
        assert_eq!(rep, REP_SUCCEEDED);

        s.write_all(b"hello booster").await.unwrap();
        let mut buf = [0u8; 13];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello booster");
        drop(s);

        let target = echo.to_string();
        for op in [TunnelOperation::Add, TunnelOperation::Ack, TunnelOperation::Remove] {
            let ev = events.recv().await.unwrap();
            assert_eq!(ev.target, target);
            assert_eq!(ev.event, op);
        }
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_connect_removes_tunnel_when_target_closes() {
        // Target answers once and hangs up
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut s, _)) = target.accept().await {
                let _ = s.write_all(b"hello world").await;
            }
        });

        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let mut events = proxy.notify();
        let (addr, ctx) = start_proxy(proxy).await;

        let mut s = request(addr, CMD_CONNECT, &encode_socket_addr(target_addr)).await;
        let (rep, _) = read_reply(&mut s).await;
        assert_eq!(rep, REP_SUCCEEDED);

        // Drain to EOF without closing the client socket
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");

        for op in [TunnelOperation::Add, TunnelOperation::Ack, TunnelOperation::Remove] {
            let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ev.event, op);
        }
        drop(s);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_connect_refused_replies_and_closes() {
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let (addr, ctx) = start_proxy(proxy).await;

        let mut s = request(addr, CMD_CONNECT, &encode_socket_addr(closed)).await;
        let (rep, _) = read_reply(&mut s).await;
        assert_eq!(rep, REP_CONNECTION_REFUSED);

        let mut buf = [0u8; 1];
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut s = request(addr, 0x09, &[ATYP_IPV4, 127, 0, 0, 1, 0, 80]).await;
            let (rep, _) = read_reply(&mut s).await;
            let mut buf = [0u8; 1];
            (rep, s.read(&mut buf).await.unwrap())
        });

        let (conn, _) = listener.accept().await.unwrap();
        let res = proxy.handle(&CancellationToken::new(), conn).await;
        assert!(matches!(res, Err(Error::UnsupportedCommand(0x09))));

        let (rep, eof) = client.await.unwrap();
        assert_eq!(rep, REP_COMMAND_NOT_SUPPORTED);
        assert_eq!(eof, 0);
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let proxy = Socks5::new(Arc::new(DirectDialer::default()))
            .with_request_timeout(Duration::from_millis(100));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (conn, _) = listener.accept().await.unwrap();

        let start = std::time::Instant::now();
        let res = proxy.handle(&CancellationToken::new(), conn).await;
        assert!(matches!(res, Err(Error::Timeout(100))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bind() {
        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let (addr, ctx) = start_proxy(proxy).await;

        let mut s = request(addr, CMD_BIND, &[ATYP_IPV4, 127, 0, 0, 1, 0, 0]).await;
        let (rep, bound) = read_reply(&mut s).await;
        assert_eq!(rep, REP_SUCCEEDED);

        let mut incoming = TcpStream::connect(bound.as_str()).await.unwrap();
        let (rep, peer) = read_reply(&mut s).await;
        assert_eq!(rep, REP_SUCCEEDED);
        assert_eq!(peer, incoming.local_addr().unwrap().to_string());

        incoming.write_all(b"from peer").await.unwrap();
        let mut buf = [0u8; 9];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from peer");
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_associate_relays_datagrams() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        let (addr, ctx) = start_proxy(proxy).await;

        let mut control = request(addr, CMD_ASSOCIATE, &[ATYP_IPV4, 0, 0, 0, 0, 0, 0]).await;
        let (rep, relay) = read_reply(&mut control).await;
        assert_eq!(rep, REP_SUCCEEDED);
        let relay: SocketAddr = relay.parse().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0, 0, 0];
        datagram.extend_from_slice(&encode_socket_addr(echo_addr));
        datagram.extend_from_slice(b"udp!");
        client.send_to(&datagram, relay).await.unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (from, used) = parse_address(&buf[3..n]).unwrap();
        assert_eq!(from, echo_addr.to_string());
        assert_eq!(&buf[3 + used..n], b"udp!");

        drop(control);
        ctx.cancel();
    }

    #[test]
    fn test_proto() {
        let proxy = Socks5::new(Arc::new(DirectDialer::default()));
        assert_eq!(proxy.proto(), "socks5");
    }
}
