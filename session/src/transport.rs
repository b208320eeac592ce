//! Transport adapters for TCP, UDP, and WebSocket connections.
//!
//! This module puts three connection models behind one capability set: byte
//! reads for streams, datagram reads for UDP, frame reads for WebSocket,
//! plus uniform writes, deadlines, close, and statistics. Byte counters and
//! the activity timestamp are maintained here; packet counters are bumped by
//! the layers that know when a whole message succeeded.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use futures::{Sink, SinkExt};
use parking_lot::Mutex as SyncMutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::session::DEFAULT_IO_TIMEOUT;

type WsSink = Box<dyn Sink<Message, Error = WsError> + Send + Unpin>;
type WsSource = Box<dyn Stream<Item = Result<Message, WsError>> + Send + Unpin>;

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket I/O failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket layer failed.
    #[error("websocket: {0}")]
    Ws(#[from] WsError),

    /// The per-operation deadline expired. Transient: callers loop.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Eof,

    /// The transport has been closed locally.
    #[error("connection closed")]
    Closed,

    /// Datagram write attempted without a peer address.
    #[error("no datagram peer configured")]
    NoPeer,

    /// The operation does not apply to this transport variant.
    #[error("{0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Whether this error is a transient timeout rather than a failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::TimedOut => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// The three connection models a session can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Stream-oriented TCP.
    Tcp,
    /// Datagram-oriented UDP.
    Udp,
    /// Frame-oriented WebSocket.
    Ws,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Ws => f.write_str("ws"),
        }
    }
}

/// Atomic per-connection counters and the activity timestamp.
#[derive(Debug)]
pub struct TransportStats {
    epoch: Instant,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    read_pkgs: AtomicU64,
    write_pkgs: AtomicU64,
    last_active_ms: AtomicU64,
}

impl TransportStats {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            read_pkgs: AtomicU64::new(0),
            write_pkgs: AtomicU64::new(0),
            last_active_ms: AtomicU64::new(0),
        }
    }

    /// Total bytes successfully read.
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes successfully written.
    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    /// Messages successfully decoded and dispatched.
    pub fn read_pkgs(&self) -> u64 {
        self.read_pkgs.load(Ordering::Relaxed)
    }

    /// Messages successfully encoded and written.
    pub fn write_pkgs(&self) -> u64 {
        self.write_pkgs.load(Ordering::Relaxed)
    }

    /// The moment of the last recorded activity.
    pub fn last_active(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn add_read_bytes(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_write_bytes(&self, n: u64) {
        self.write_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_read_pkgs(&self, n: u64) {
        self.read_pkgs.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_write_pkgs(&self, n: u64) {
        self.write_pkgs.fetch_add(n, Ordering::Relaxed);
    }

    /// Record activity now.
    pub(crate) fn touch(&self) {
        self.last_active_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

enum Io {
    // The halves sit behind Options so close() can drop them, releasing the
    // socket, while shared references remain elsewhere.
    Tcp {
        reader: Mutex<Option<OwnedReadHalf>>,
        writer: Mutex<Option<OwnedWriteHalf>>,
    },
    Udp {
        socket: UdpSocket,
    },
    Ws {
        source: Mutex<WsSource>,
        sink: Mutex<WsSink>,
    },
}

/// One bidirectional connection behind the session capability set.
pub struct Transport {
    stats: TransportStats,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    read_timeout: SyncMutex<Duration>,
    write_timeout: SyncMutex<Duration>,
    read_deadline: SyncMutex<Option<Instant>>,
    write_deadline: SyncMutex<Option<Instant>>,
    io: Io,
}

impl Transport {
    fn new(local: Option<SocketAddr>, peer: Option<SocketAddr>, io: Io) -> Self {
        Self {
            stats: TransportStats::new(),
            local,
            peer,
            read_timeout: SyncMutex::new(DEFAULT_IO_TIMEOUT),
            write_timeout: SyncMutex::new(DEFAULT_IO_TIMEOUT),
            read_deadline: SyncMutex::new(None),
            write_deadline: SyncMutex::new(None),
            io,
        }
    }

    /// Wrap an established TCP stream.
    pub fn tcp(stream: TcpStream) -> Self {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::new(
            local,
            peer,
            Io::Tcp {
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
            },
        )
    }

    /// Wrap a bound UDP socket. `peer` is the destination for writes; pass
    /// `None` for receive-only sessions.
    pub fn udp(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        let local = socket.local_addr().ok();
        Self::new(local, peer, Io::Udp { socket })
    }

    /// Wrap an established WebSocket. The underlying addresses are not
    /// visible through the WebSocket layer, so the peer is caller-supplied.
    pub fn ws<S>(stream: WebSocketStream<S>, peer: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        Self::new(
            None,
            peer,
            Io::Ws {
                source: Mutex::new(Box::new(source)),
                sink: Mutex::new(Box::new(sink)),
            },
        )
    }

    /// Which connection model this transport drives.
    pub fn kind(&self) -> TransportKind {
        match self.io {
            Io::Tcp { .. } => TransportKind::Tcp,
            Io::Udp { .. } => TransportKind::Udp,
            Io::Ws { .. } => TransportKind::Ws,
        }
    }

    /// Connection counters.
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Local socket address, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Remote socket address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Per-read timeout applied when no explicit deadline is earlier.
    pub fn read_timeout(&self) -> Duration {
        *self.read_timeout.lock()
    }

    /// Per-write timeout applied when no explicit deadline is earlier.
    pub fn write_timeout(&self) -> Duration {
        *self.write_timeout.lock()
    }

    /// Set the per-read timeout.
    pub fn set_read_timeout(&self, timeout: Duration) {
        *self.read_timeout.lock() = timeout;
    }

    /// Set the per-write timeout.
    pub fn set_write_timeout(&self, timeout: Duration) {
        *self.write_timeout.lock() = timeout;
    }

    /// Set or clear the wall-clock read deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    /// Set or clear the wall-clock write deadline.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }

    fn next_read_deadline(&self) -> Instant {
        let natural = Instant::now() + self.read_timeout();
        match *self.read_deadline.lock() {
            Some(explicit) if explicit < natural => explicit,
            _ => natural,
        }
    }

    fn next_write_deadline(&self) -> Instant {
        let natural = Instant::now() + self.write_timeout();
        match *self.write_deadline.lock() {
            Some(explicit) if explicit < natural => explicit,
            _ => natural,
        }
    }

    async fn timed<T>(
        deadline: Instant,
        op: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout_at(deadline.into(), op).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::TimedOut),
        }
    }

    /// Read bytes from a stream transport into `buf`.
    ///
    /// Returns the number of bytes read; the end of stream surfaces as
    /// [`TransportError::Eof`].
    pub(crate) async fn read_stream(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let Io::Tcp { reader, .. } = &self.io else {
            return Err(TransportError::Unsupported(
                "byte reads on a non-stream transport",
            ));
        };

        let deadline = self.next_read_deadline();
        let n = Self::timed(deadline, async {
            let mut reader = reader.lock().await;
            let reader = reader.as_mut().ok_or(TransportError::Closed)?;
            Ok(reader.read(buf).await?)
        })
        .await?;

        if n == 0 {
            return Err(TransportError::Eof);
        }
        self.stats.add_read_bytes(n as u64);
        Ok(n)
    }

    /// Read one datagram into `buf`, returning its length and sender.
    pub(crate) async fn read_datagram(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr), TransportError> {
        let Io::Udp { socket } = &self.io else {
            return Err(TransportError::Unsupported(
                "datagram reads on a non-datagram transport",
            ));
        };

        let deadline = self.next_read_deadline();
        let (n, peer) = Self::timed(deadline, async { Ok(socket.recv_from(buf).await?) }).await?;
        self.stats.add_read_bytes(n as u64);
        Ok((n, peer))
    }

    /// Read the next data frame from a WebSocket transport.
    ///
    /// Control frames are handled transparently; a close frame or exhausted
    /// stream surfaces as [`TransportError::Eof`].
    pub(crate) async fn read_frame(&self) -> Result<Bytes, TransportError> {
        let Io::Ws { source, .. } = &self.io else {
            return Err(TransportError::Unsupported(
                "frame reads on a non-websocket transport",
            ));
        };

        let deadline = self.next_read_deadline();
        Self::timed(deadline, async {
            let mut source = source.lock().await;
            loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.add_read_bytes(data.len() as u64);
                        return Ok(Bytes::from(data));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let data = text.into_bytes();
                        self.stats.add_read_bytes(data.len() as u64);
                        return Ok(Bytes::from(data));
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(TransportError::Eof),
                    // Ping/pong and low-level frames carry no payload for us.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        })
        .await
    }

    /// Write `bytes` in full: all bytes on a stream, one datagram on UDP,
    /// one binary frame on WebSocket.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let deadline = self.next_write_deadline();
        match &self.io {
            Io::Tcp { writer, .. } => {
                Self::timed(deadline, async {
                    let mut writer = writer.lock().await;
                    let writer = writer.as_mut().ok_or(TransportError::Closed)?;
                    writer.write_all(bytes).await?;
                    Ok(())
                })
                .await?;
            }
            Io::Udp { socket } => {
                let peer = self.peer.ok_or(TransportError::NoPeer)?;
                Self::timed(deadline, async {
                    socket.send_to(bytes, peer).await?;
                    Ok(())
                })
                .await?;
            }
            Io::Ws { sink, .. } => {
                Self::timed(deadline, async {
                    let mut sink = sink.lock().await;
                    sink.send(Message::Binary(bytes.to_vec())).await?;
                    Ok(())
                })
                .await?;
            }
        }
        self.stats.add_write_bytes(bytes.len() as u64);
        Ok(())
    }

    /// Send one datagram to an explicit peer, regardless of the configured
    /// destination. UDP only.
    pub async fn write_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), TransportError> {
        let Io::Udp { socket } = &self.io else {
            return Err(TransportError::Unsupported(
                "explicit-peer writes on a non-datagram transport",
            ));
        };

        let deadline = self.next_write_deadline();
        Self::timed(deadline, async {
            socket.send_to(bytes, peer).await?;
            Ok(())
        })
        .await?;
        self.stats.add_write_bytes(bytes.len() as u64);
        Ok(())
    }

    /// Send a PING control frame. WebSocket only.
    pub async fn write_ping(&self) -> Result<(), TransportError> {
        let Io::Ws { sink, .. } = &self.io else {
            return Err(TransportError::Unsupported(
                "ping frames on a non-websocket transport",
            ));
        };

        let deadline = self.next_write_deadline();
        Self::timed(deadline, async {
            let mut sink = sink.lock().await;
            sink.send(Message::Ping(Vec::new())).await?;
            Ok(())
        })
        .await
    }

    /// Close the connection.
    ///
    /// TCP is half-closed first so the peer sees EOF, given up to `wait` to
    /// finish sending, and then the socket is released. WebSocket sends a
    /// normal-closure close frame, bounded by `wait`. Subsequent operations
    /// fail with [`TransportError::Closed`].
    pub(crate) async fn close(&self, wait: Duration) {
        match &self.io {
            Io::Tcp { reader, writer } => {
                let mut writer = writer.lock().await;
                if let Some(writer) = writer.as_mut() {
                    if let Err(e) = writer.shutdown().await {
                        debug!("tcp shutdown: {e}");
                    }
                }
                // Let the peer finish sending for up to `wait`, then drop
                // both halves to release the socket.
                let mut reader = reader.lock().await;
                if let Some(mut reader) = reader.take() {
                    let _ = tokio::time::timeout(wait, async {
                        let mut scratch = [0u8; 1024];
                        while matches!(reader.read(&mut scratch).await, Ok(n) if n > 0) {}
                    })
                    .await;
                }
                writer.take();
            }
            Io::Udp { .. } => {}
            Io::Ws { sink, .. } => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session closed".into(),
                };
                let mut sink = sink.lock().await;
                match tokio::time::timeout(wait, sink.send(Message::Close(Some(frame)))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("websocket close: {e}"),
                    Err(_) => debug!("websocket close timed out"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let client = TcpStream::connect(bound).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_tcp_read_write_and_counters() {
        let (client, server) = tcp_pair().await;
        let near = Transport::tcp(client);
        let far = Transport::tcp(server);

        near.write(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let n = far.read_stream(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(near.stats().write_bytes(), 5);
        assert_eq!(far.stats().read_bytes(), 5);
    }

    #[tokio::test]
    async fn test_tcp_read_timeout_is_transient() {
        let (client, _server) = tcp_pair().await;
        let transport = Transport::tcp(client);
        transport.set_read_timeout(Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let err = transport.read_stream(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_tcp_eof_on_peer_close() {
        let (client, server) = tcp_pair().await;
        drop(server);

        let transport = Transport::tcp(client);
        let mut buf = [0u8; 16];
        let err = transport.read_stream(&mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::Eof));
    }

    #[tokio::test]
    async fn test_close_releases_the_socket_within_wait() {
        let (client, _server) = tcp_pair().await;
        let transport = Transport::tcp(client);

        let started = Instant::now();
        transport.close(Duration::from_millis(100)).await;
        // The peer stays silent, so the drain runs the full window.
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(matches!(
            transport.write(b"late").await,
            Err(TransportError::Closed)
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            transport.read_stream(&mut buf).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_explicit_deadline_wins_when_earlier() {
        let (client, _server) = tcp_pair().await;
        let transport = Transport::tcp(client);
        transport.set_read_timeout(Duration::from_secs(30));
        transport.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let err = transport.read_stream(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_udp_roundtrip_with_peer() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let near = Transport::udp(a, Some(b_addr));
        let far = Transport::udp(b, None);

        near.write(b"datagram").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = far.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from, a_addr);
    }

    #[tokio::test]
    async fn test_udp_write_without_peer_fails() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::udp(socket, None);
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::NoPeer)
        ));
    }

    #[tokio::test]
    async fn test_variant_mismatch_is_rejected() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::udp(socket, None);
        let mut buf = [0u8; 8];
        assert!(matches!(
            transport.read_stream(&mut buf).await,
            Err(TransportError::Unsupported(_))
        ));
        assert!(matches!(
            transport.write_ping().await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
