//! SIP Transport Layer
//!
//! One [`Transport`] per session, chosen at login. UDP sends each message as
//! an independent datagram. TCP keeps a primary connection to the server
//! with a write-side ring buffer, plus a listener for peers that connect to
//! us directly.

use crate::{codec::InputBuffer, SipError, SipMessage, SipResult};
use bytes::{Buf, BytesMut};
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

const UDP_RECV_BUFFER: usize = 65_535;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    /// Token used in Via headers.
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Value of the Contact `transport=` parameter.
    pub fn uri_param(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
        }
    }

    /// DNS SRV service label, `_sip._udp` or `_sip._tcp`.
    pub fn srv_prefix(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "_sip._udp",
            TransportProtocol::Tcp => "_sip._tcp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri_param())
    }
}

/// Capability interface the session sends and receives through.
///
/// All operations are non-blocking. `readiness` resolves once the
/// transport has made progress (a connect finished, bytes arrived, the
/// socket became writable); the driver then drains `try_recv`.
pub trait Transport: Send {
    fn protocol(&self) -> TransportProtocol;

    fn local_addr(&self) -> SocketAddr;

    /// Sends one serialized message. Stream transports queue whatever
    /// cannot be written right away.
    fn send(&mut self, data: &[u8]) -> SipResult<()>;

    /// Next complete inbound message, if any.
    fn try_recv(&mut self) -> SipResult<Option<SipMessage>>;

    /// Writes queued output.
    fn flush(&mut self) -> SipResult<()>;

    /// Keeps NAT bindings open. A no-op for stream transports.
    fn keepalive(&mut self) -> SipResult<()>;

    fn wants_write(&self) -> bool;

    fn readiness(&mut self) -> BoxFuture<'_, SipResult<()>>;

    fn close(&mut self);
}

/// Output ring buffer for a stream connection.
#[derive(Debug, Default)]
pub struct TxBuffer {
    buf: BytesMut,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message, separated from anything already queued by CRLF.
    pub fn enqueue(&mut self, data: &[u8]) {
        if !self.buf.is_empty() {
            self.buf.extend_from_slice(b"\r\n");
        }
        self.buf.extend_from_slice(data);
    }

    /// Largest span that can be handed to a single write.
    pub fn max_read(&self) -> usize {
        self.buf.len()
    }

    pub fn readable(&self) -> &[u8] {
        &self.buf
    }

    /// Advances past `n` bytes accepted by the socket.
    pub fn mark_read(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// One TCP stream and its partially received input.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    input: InputBuffer,
}

/// Outcome of draining a socket into its input buffer.
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Open,
    Closed,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Unable to set TCP_NODELAY for {}: {}", peer, e);
        }
        Self {
            stream,
            peer,
            input: InputBuffer::new(),
        }
    }

    /// Reads everything available and moves complete messages to `ready`.
    fn read_available(&mut self, ready: &mut VecDeque<SipMessage>) -> SipResult<ReadOutcome> {
        loop {
            match self.stream.try_read_buf(self.input.read_buf()) {
                Ok(0) => {
                    debug!("Connection from {} closed", self.peer);
                    return Ok(ReadOutcome::Closed);
                }
                Ok(n) => debug!("Read {} bytes from {}", n, self.peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(SipError::ConnectionError(format!(
                        "Read error from {}: {}",
                        self.peer, e
                    )))
                }
            }
        }

        loop {
            match self.input.next_message() {
                Ok(Some(message)) => {
                    debug!("Received {} from {}", message, self.peer);
                    ready.push_back(message);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed message from {}: {}", self.peer, e);
                    break;
                }
            }
        }
        Ok(ReadOutcome::Open)
    }
}

/// Writes as much of `txbuf` as the socket accepts.
fn flush_to(stream: &TcpStream, txbuf: &mut TxBuffer) -> SipResult<()> {
    while !txbuf.is_empty() {
        match stream.try_write(txbuf.readable()) {
            Ok(0) => {
                return Err(SipError::ConnectionError(
                    "Connection closed while writing".to_string(),
                ))
            }
            Ok(n) => {
                debug!("Flushed {} of {} queued bytes", n, txbuf.max_read());
                txbuf.mark_read(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SipError::ConnectionError(format!("Write error: {}", e))),
        }
    }
    Ok(())
}

/// Binds a UDP socket on the first free port in `ports`.
pub async fn bind_udp_in_range(ip: IpAddr, ports: RangeInclusive<u16>) -> SipResult<UdpSocket> {
    for port in ports.clone() {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => debug!("UDP port {} unavailable: {}", port, e),
        }
    }
    Err(SipError::ConnectionError(format!(
        "Unable to bind a UDP port in {}-{}",
        ports.start(),
        ports.end()
    )))
}

/// Binds a TCP listener on the first free port in `ports`.
pub async fn bind_tcp_in_range(ip: IpAddr, ports: RangeInclusive<u16>) -> SipResult<TcpListener> {
    for port in ports.clone() {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("TCP port {} unavailable: {}", port, e),
        }
    }
    Err(SipError::ConnectionError(format!(
        "Unable to listen on a TCP port in {}-{}",
        ports.start(),
        ports.end()
    )))
}

/// Datagram transport. No connection state, no output queue.
pub struct UdpTransport {
    socket: UdpSocket,
    server: SocketAddr,
    local_addr: SocketAddr,
    recv_buf: Vec<u8>,
    closed: bool,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, server: SocketAddr) -> SipResult<Self> {
        let local_addr = socket.local_addr()?;
        info!("UDP transport on {} talking to {}", local_addr, server);
        Ok(Self {
            socket,
            server,
            local_addr,
            recv_buf: vec![0u8; UDP_RECV_BUFFER],
            closed: false,
        })
    }

    pub async fn bind(
        ip: IpAddr,
        ports: RangeInclusive<u16>,
        server: SocketAddr,
    ) -> SipResult<Self> {
        let socket = bind_udp_in_range(ip, ports).await?;
        Self::new(socket, server)
    }
}

impl Transport for UdpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&mut self, data: &[u8]) -> SipResult<()> {
        if self.closed {
            return Err(SipError::ConnectionError("Transport closed".to_string()));
        }
        // a lost datagram is recovered by the retransmission sweep
        match self.socket.try_send_to(data, self.server) {
            Ok(n) => debug!("Sent {} byte datagram to {}", n, self.server),
            Err(e) => warn!("Failed to send datagram to {}: {}", self.server, e),
        }
        Ok(())
    }

    fn try_recv(&mut self) -> SipResult<Option<SipMessage>> {
        loop {
            let (len, source) = match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => {
                    warn!("UDP receive error: {}", e);
                    return Ok(None);
                }
            };

            let data = &self.recv_buf[..len];
            if data.iter().all(|b| matches!(b, 0 | b'\r' | b'\n')) {
                continue;
            }

            match crate::parse_sip_message(data) {
                Ok(message) => {
                    debug!("Received {} from {}", message, source);
                    return Ok(Some(message));
                }
                Err(e) => warn!("Failed to parse datagram from {}: {}", source, e),
            }
        }
    }

    fn flush(&mut self) -> SipResult<()> {
        Ok(())
    }

    fn keepalive(&mut self) -> SipResult<()> {
        match self.socket.try_send_to(&[0], self.server) {
            Ok(_) => debug!("Sent keepalive to {}", self.server),
            Err(e) => warn!("Keepalive to {} failed: {}", self.server, e),
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn readiness(&mut self) -> BoxFuture<'_, SipResult<()>> {
        Box::pin(async move {
            if self.closed {
                return future::pending().await;
            }
            self.socket.readable().await.map_err(SipError::from)
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

enum Primary {
    Idle,
    Connecting(BoxFuture<'static, io::Result<TcpStream>>),
    Connected(Connection),
}

enum Wake {
    Connected(io::Result<TcpStream>),
    PrimaryReady(io::Result<tokio::io::Ready>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    InboundReady(usize),
}

/// Stream transport: one primary connection to the server, connected on
/// demand, and any number of inbound peer connections.
pub struct TcpTransport {
    server: SocketAddr,
    listener: TcpListener,
    local_addr: SocketAddr,
    primary: Primary,
    inbound: Vec<Connection>,
    txbuf: TxBuffer,
    ready: VecDeque<SipMessage>,
    closed: bool,
}

impl TcpTransport {
    pub fn new(listener: TcpListener, server: SocketAddr) -> SipResult<Self> {
        let local_addr = listener.local_addr()?;
        info!("TCP transport listening on {}, server {}", local_addr, server);
        Ok(Self {
            server,
            listener,
            local_addr,
            primary: Primary::Idle,
            inbound: Vec::new(),
            txbuf: TxBuffer::new(),
            ready: VecDeque::new(),
            closed: false,
        })
    }

    pub async fn bind(
        ip: IpAddr,
        ports: RangeInclusive<u16>,
        server: SocketAddr,
    ) -> SipResult<Self> {
        let listener = bind_tcp_in_range(ip, ports).await?;
        Self::new(listener, server)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.primary, Primary::Connected(_))
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    fn start_connecting(&mut self) {
        if matches!(self.primary, Primary::Idle) {
            debug!("Connecting to {}", self.server);
            self.primary = Primary::Connecting(Box::pin(TcpStream::connect(self.server)));
        }
    }

    fn handle_wake(&mut self, wake: Wake) -> SipResult<()> {
        match wake {
            Wake::Connected(Ok(stream)) => {
                info!("Connected to {}", self.server);
                self.primary = Primary::Connected(Connection::new(stream, self.server));
                self.flush()
            }
            Wake::Connected(Err(e)) => {
                self.primary = Primary::Idle;
                Err(SipError::ConnectionError(format!(
                    "Could not connect to {}: {}",
                    self.server, e
                )))
            }
            Wake::PrimaryReady(Err(e)) => Err(SipError::ConnectionError(format!(
                "Connection to {} failed: {}",
                self.server, e
            ))),
            Wake::PrimaryReady(Ok(ready)) => {
                if ready.is_writable() {
                    self.flush()?;
                }
                if ready.is_readable() || ready.is_read_closed() {
                    if let Primary::Connected(conn) = &mut self.primary {
                        if conn.read_available(&mut self.ready)? == ReadOutcome::Closed {
                            warn!("Server {} closed the connection", self.server);
                            self.primary = Primary::Idle;
                        }
                    }
                }
                Ok(())
            }
            Wake::Accepted(Ok((stream, peer))) => {
                debug!("Accepted connection from {}", peer);
                self.inbound.push(Connection::new(stream, peer));
                Ok(())
            }
            Wake::Accepted(Err(e)) => {
                warn!("TCP accept error: {}", e);
                Ok(())
            }
            Wake::InboundReady(index) => {
                let outcome = match self.inbound.get_mut(index) {
                    Some(conn) => conn.read_available(&mut self.ready),
                    None => return Ok(()),
                };
                match outcome {
                    Ok(ReadOutcome::Open) => {}
                    Ok(ReadOutcome::Closed) => {
                        self.inbound.swap_remove(index);
                    }
                    Err(e) => {
                        warn!("Dropping inbound connection: {}", e);
                        self.inbound.swap_remove(index);
                    }
                }
                Ok(())
            }
        }
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&mut self, data: &[u8]) -> SipResult<()> {
        if self.closed {
            return Err(SipError::ConnectionError("Transport closed".to_string()));
        }

        let written = match &self.primary {
            Primary::Connected(conn) if self.txbuf.is_empty() => match conn.stream.try_write(data) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => {
                    return Err(SipError::ConnectionError(format!(
                        "Write to {} failed: {}",
                        self.server, e
                    )))
                }
            },
            _ => 0,
        };

        if written < data.len() {
            debug!("Queued {} unsent bytes", data.len() - written);
            self.txbuf.enqueue(&data[written..]);
            self.start_connecting();
        }
        Ok(())
    }

    fn try_recv(&mut self) -> SipResult<Option<SipMessage>> {
        Ok(self.ready.pop_front())
    }

    fn flush(&mut self) -> SipResult<()> {
        if let Primary::Connected(conn) = &self.primary {
            return flush_to(&conn.stream, &mut self.txbuf);
        }
        if !self.txbuf.is_empty() {
            self.start_connecting();
        }
        Ok(())
    }

    fn keepalive(&mut self) -> SipResult<()> {
        Ok(())
    }

    fn wants_write(&self) -> bool {
        !self.txbuf.is_empty()
    }

    fn readiness(&mut self) -> BoxFuture<'_, SipResult<()>> {
        Box::pin(async move {
            if self.closed {
                return future::pending().await;
            }

            let wants_write = self.wants_write();
            let wake = {
                let TcpTransport {
                    primary,
                    listener,
                    inbound,
                    ..
                } = &mut *self;

                let primary_wait = async {
                    match primary {
                        Primary::Idle => future::pending().await,
                        Primary::Connecting(connect) => Wake::Connected(connect.await),
                        Primary::Connected(conn) => {
                            let interest = if wants_write {
                                Interest::READABLE | Interest::WRITABLE
                            } else {
                                Interest::READABLE
                            };
                            Wake::PrimaryReady(conn.stream.ready(interest).await)
                        }
                    }
                };

                let inbound_wait = async {
                    if inbound.is_empty() {
                        return future::pending().await;
                    }
                    let readable = inbound.iter().map(|conn| Box::pin(conn.stream.readable()));
                    let (_, index, _) = future::select_all(readable).await;
                    Wake::InboundReady(index)
                };

                tokio::select! {
                    wake = primary_wait => wake,
                    accepted = listener.accept() => Wake::Accepted(accepted),
                    wake = inbound_wait => wake,
                }
            };

            self.handle_wake(wake)
        })
    }

    fn close(&mut self) {
        self.closed = true;
        self.primary = Primary::Idle;
        self.inbound.clear();
        self.txbuf.clear();
        self.ready.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn options(call_id: &str) -> Vec<u8> {
        format!(
            "OPTIONS sip:bob@x SIP/2.0\r\nVia: SIP/2.0/TCP 127.0.0.1\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:bob@x>\r\nCall-ID: {}\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n",
            call_id
        )
        .into_bytes()
    }

    #[test]
    fn test_txbuffer_separates_messages() {
        let mut txbuf = TxBuffer::new();
        txbuf.enqueue(b"first");
        txbuf.enqueue(b"second");
        assert_eq!(txbuf.readable(), b"first\r\nsecond");

        txbuf.mark_read(7);
        assert_eq!(txbuf.readable(), b"second");
        assert_eq!(txbuf.max_read(), 6);

        txbuf.mark_read(100);
        assert!(txbuf.is_empty());
        txbuf.enqueue(b"third");
        assert_eq!(txbuf.readable(), b"third");
    }

    #[test]
    fn test_protocol_tokens() {
        assert_eq!(TransportProtocol::Udp.via_token(), "UDP");
        assert_eq!(TransportProtocol::Tcp.uri_param(), "tcp");
        assert_eq!(TransportProtocol::Tcp.srv_prefix(), "_sip._tcp");
        let parsed: TransportProtocol = serde_json::from_str("\"udp\"").unwrap();
        assert_eq!(parsed, TransportProtocol::Udp);
    }

    #[tokio::test]
    async fn test_udp_send_and_receive() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut transport = UdpTransport::bind(LOCALHOST, 0..=0, server_addr)
            .await
            .unwrap();

        transport.send(&options("udp-1")).unwrap();
        let mut buf = [0u8; 2048];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, transport.local_addr());
        assert!(buf[..len].starts_with(b"OPTIONS sip:bob@x"));

        transport.keepalive().unwrap();
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0]);

        server.send_to(b"garbage", from).await.unwrap();
        server.send_to(&options("udp-2"), from).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                transport.readiness().await.unwrap();
                if let Some(message) = transport.try_recv().unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message.header("Call-ID"), Some("udp-2"));
    }

    #[tokio::test]
    async fn test_tcp_queues_until_connected() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut transport = TcpTransport::bind(LOCALHOST, 0..=0, server_addr)
            .await
            .unwrap();

        transport.send(&options("tcp-1")).unwrap();
        transport.send(&options("tcp-2")).unwrap();
        assert!(!transport.is_connected());
        assert!(transport.wants_write());

        let (mut peer, _) = tokio::time::timeout(Duration::from_secs(2), async {
            let accept = server.accept();
            tokio::pin!(accept);
            loop {
                tokio::select! {
                    accepted = &mut accept => return accepted.unwrap(),
                    result = transport.readiness() => result.unwrap(),
                }
            }
        })
        .await
        .unwrap();

        while transport.wants_write() || !transport.is_connected() {
            transport.readiness().await.unwrap();
        }

        let mut expected = options("tcp-1");
        expected.extend_from_slice(b"\r\n");
        expected.extend_from_slice(&options("tcp-2"));
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        peer.write_all(&options("tcp-3")).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                transport.readiness().await.unwrap();
                if let Some(message) = transport.try_recv().unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message.header("Call-ID"), Some("tcp-3"));
    }

    #[tokio::test]
    async fn test_tcp_accepts_inbound_peers() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut transport = TcpTransport::bind(LOCALHOST, 0..=0, unused.local_addr().unwrap())
            .await
            .unwrap();

        let mut peer = TcpStream::connect(transport.local_addr()).await.unwrap();
        peer.write_all(b"\r\n").await.unwrap();
        peer.write_all(&options("inbound-1")).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                transport.readiness().await.unwrap();
                if let Some(message) = transport.try_recv().unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message.header("Call-ID"), Some("inbound-1"));
        assert_eq!(transport.inbound_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut transport = UdpTransport::bind(LOCALHOST, 0..=0, server.local_addr().unwrap())
            .await
            .unwrap();
        transport.close();
        assert!(matches!(
            transport.send(b"x"),
            Err(SipError::ConnectionError(_))
        ));

        // a closed transport never wakes the driver
        let mut readiness = tokio_test::task::spawn(transport.readiness());
        tokio_test::assert_pending!(readiness.poll());
    }
}
