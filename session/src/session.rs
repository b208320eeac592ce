//! The session controller: lifecycle, configuration, and the write surface.

use crate::error::{Result, SessionError};
use crate::listener::{Endpoint, EventListener, Inbound};
use crate::pool::buffer_pool;
use crate::queue::WriteQueue;
use crate::task::TaskPool;
use crate::transport::{Transport, TransportKind, TransportStats};
use crate::{recv, send};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::{Duration, Instant};
use strand_codec::{Decoder, Encoder};
use strand_timer::Timer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Process-unique session identifier.
pub type SessionId = u64;

/// Default read buffer size for stream reads.
pub const DEFAULT_READ_BUF_LEN: usize = 4 * 1024;

/// Default per-operation I/O timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Default heartbeat/cron interval.
pub const DEFAULT_CRON_PERIOD: Duration = Duration::from_secs(60);

/// Default drain window after a close request.
pub const DEFAULT_WAIT_ON_CLOSE: Duration = Duration::from_secs(3);

/// Default write queue capacity.
pub const DEFAULT_WRITE_QUEUE_CAP: usize = 1024;

/// Reserved datagram the surrounding runtime sends to keep NAT paths warm;
/// sessions discard it without dispatching a message.
pub const CONNECT_PING: &[u8] = b"strand/connect-ping";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration, collaborators, and attributes behind the session lock.
struct Shared<P> {
    name: String,
    endpoint: Option<Arc<dyn Endpoint>>,
    listener: Option<Arc<dyn EventListener<P>>>,
    decoder: Option<Arc<dyn Decoder<Item = P>>>,
    encoder: Option<Arc<dyn Encoder<Item = P>>>,
    task_pool: Option<Arc<dyn TaskPool>>,
    timer: Option<Arc<dyn Timer>>,
    queue: Option<Arc<WriteQueue<P>>>,
    max_msg_len: usize,
    cron_period: Duration,
    wait_on_close: Duration,
    attrs: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

/// One connection driven as an asynchronous framed message channel.
///
/// `P` is the application message type produced by the decoder and consumed
/// by the encoder; it defaults to [`Bytes`].
///
/// Configuration happens between construction and [`Session::run`]; the
/// queue capacity, message length limit, cron period, and drain window must
/// not be changed after the loops start.
pub struct Session<P = Bytes> {
    id: SessionId,
    this: Weak<Self>,
    transport: Transport,
    done: CancellationToken,
    rdone: CancellationToken,
    stop_once: Once,
    shared: RwLock<Shared<P>>,
}

impl<P: Send + Sync + 'static> Session<P> {
    /// Wrap an established TCP stream.
    pub fn tcp(stream: TcpStream) -> Arc<Self> {
        Self::with_transport(Transport::tcp(stream))
    }

    /// Wrap a bound UDP socket; `peer` is the destination for writes.
    pub fn udp(socket: UdpSocket, peer: Option<SocketAddr>) -> Arc<Self> {
        Self::with_transport(Transport::udp(socket, peer))
    }

    /// Wrap an established WebSocket.
    pub fn ws<S>(stream: WebSocketStream<S>, peer: Option<SocketAddr>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_transport(Transport::ws(stream, peer))
    }

    /// Wrap an already-built transport.
    pub fn with_transport(transport: Transport) -> Arc<Self> {
        let name = match transport.kind() {
            TransportKind::Tcp => "tcp-session",
            TransportKind::Udp => "udp-session",
            TransportKind::Ws => "ws-session",
        };
        Arc::new_cyclic(|this| Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            transport,
            done: CancellationToken::new(),
            rdone: CancellationToken::new(),
            stop_once: Once::new(),
            shared: RwLock::new(Shared {
                name: name.to_string(),
                endpoint: None,
                listener: None,
                decoder: None,
                encoder: None,
                task_pool: None,
                timer: None,
                queue: None,
                max_msg_len: 0,
                cron_period: DEFAULT_CRON_PERIOD,
                wait_on_close: DEFAULT_WAIT_ON_CLOSE,
                attrs: HashMap::new(),
            }),
        })
    }

    // ---- identity and statistics -------------------------------------------

    /// Process-unique identifier of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// A strong handle to this session.
    fn arc(&self) -> Arc<Self> {
        self.this
            .upgrade()
            .expect("a live session always has a strong handle")
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.shared.read().name.clone()
    }

    /// The underlying transport adapter.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The transport model this session drives.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Connection counters.
    pub fn stats(&self) -> &TransportStats {
        self.transport.stats()
    }

    /// Moment of the last read or dispatched message.
    pub fn last_active(&self) -> Instant {
        self.transport.stats().last_active()
    }

    /// Human-readable counter summary.
    pub fn stat(&self) -> String {
        let stats = self.transport.stats();
        format!(
            "session {}, read bytes: {}, write bytes: {}, read pkgs: {}, write pkgs: {}",
            self.token(),
            stats.read_bytes(),
            stats.write_bytes(),
            stats.read_pkgs(),
            stats.write_pkgs(),
        )
    }

    /// `{name:endpoint:id:local<->peer}` tag used in logs.
    pub(crate) fn token(&self) -> String {
        let shared = self.shared.read();
        let endpoint = shared
            .endpoint
            .as_ref()
            .map(|e| e.endpoint_type().to_string())
            .unwrap_or_else(|| "-".to_string());
        let addr =
            |a: Option<SocketAddr>| a.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        format!(
            "{{{}:{}:{}:{}<->{}}}",
            shared.name,
            endpoint,
            self.id,
            addr(self.transport.local_addr()),
            addr(self.transport.peer_addr()),
        )
    }

    // ---- configuration ------------------------------------------------------

    /// Set the display name.
    pub fn set_name(&self, name: impl Into<String>) {
        self.shared.write().name = name.into();
    }

    /// Attach the owning endpoint; its `on_stop` hook fires at shutdown.
    pub fn set_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.shared.write().endpoint = Some(endpoint);
    }

    /// The owning endpoint, when attached.
    pub fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        self.shared.read().endpoint.clone()
    }

    /// Install the event listener. Required before [`Session::run`].
    pub fn set_event_listener(&self, listener: Arc<dyn EventListener<P>>) {
        self.shared.write().listener = Some(listener);
    }

    /// Install the decoder.
    pub fn set_decoder(&self, decoder: Arc<dyn Decoder<Item = P>>) {
        self.shared.write().decoder = Some(decoder);
    }

    /// Install the encoder. Required before [`Session::run`].
    pub fn set_encoder(&self, encoder: Arc<dyn Encoder<Item = P>>) {
        self.shared.write().encoder = Some(encoder);
    }

    /// Install one object as both decoder and encoder.
    pub fn set_codec<C>(&self, codec: Arc<C>)
    where
        C: Decoder<Item = P> + Encoder<Item = P>,
    {
        let mut shared = self.shared.write();
        shared.decoder = Some(codec.clone());
        shared.encoder = Some(codec);
    }

    /// Offload `on_message` dispatch to an executor instead of running it
    /// inline on the receive loop.
    pub fn set_task_pool(&self, pool: Arc<dyn TaskPool>) {
        self.shared.write().task_pool = Some(pool);
    }

    /// Replace the shared timing wheel, e.g. with a deterministic timer in
    /// tests or a finer wheel for sub-tick cron periods.
    pub fn set_timer(&self, timer: Arc<dyn Timer>) {
        self.shared.write().timer = Some(timer);
    }

    /// Cap the byte length of decoded messages; `0` means unlimited.
    pub fn set_max_message_length(&self, len: usize) {
        self.shared.write().max_msg_len = len;
    }

    /// Byte length cap for decoded messages; `0` means unlimited.
    pub fn max_message_length(&self) -> usize {
        self.shared.read().max_msg_len
    }

    /// Set the heartbeat interval.
    ///
    /// # Panics
    ///
    /// Panics if `period` is below one millisecond.
    pub fn set_cron_period(&self, period: Duration) {
        assert!(
            period >= Duration::from_millis(1),
            "cron period must be at least 1ms"
        );
        self.shared.write().cron_period = period;
    }

    /// The heartbeat interval.
    pub fn cron_period(&self) -> Duration {
        self.shared.read().cron_period
    }

    /// Size the write queue. Only valid before [`Session::run`].
    ///
    /// # Panics
    ///
    /// Panics if `cap` is zero.
    pub fn set_write_queue_capacity(&self, cap: usize) {
        assert!(cap >= 1, "write queue capacity must be at least 1");
        self.shared.write().queue = Some(Arc::new(WriteQueue::new(cap)));
    }

    /// Capacity of the write queue (the default until `run` creates it).
    pub fn write_queue_capacity(&self) -> usize {
        self.shared
            .read()
            .queue
            .as_ref()
            .map(|q| q.capacity())
            .unwrap_or(DEFAULT_WRITE_QUEUE_CAP)
    }

    /// Bound the drain window after close.
    ///
    /// # Panics
    ///
    /// Panics if `wait` is zero.
    pub fn set_wait_on_close(&self, wait: Duration) {
        assert!(!wait.is_zero(), "wait on close must be non-zero");
        self.shared.write().wait_on_close = wait;
    }

    /// The drain window after close.
    pub fn wait_on_close(&self) -> Duration {
        self.shared.read().wait_on_close
    }

    /// Set the per-read I/O timeout.
    pub fn set_read_timeout(&self, timeout: Duration) {
        self.transport.set_read_timeout(timeout);
    }

    /// Set the per-write I/O timeout.
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.transport.set_write_timeout(timeout);
    }

    // ---- attributes ---------------------------------------------------------

    /// Store an attribute for the lifetime of the session.
    pub fn set_attribute<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.shared.write().attrs.insert(key.into(), Arc::new(value));
    }

    /// Fetch an attribute, if present and of the requested type.
    pub fn attribute<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let value = self.shared.read().attrs.get(key).cloned()?;
        value.downcast::<V>().ok()
    }

    /// Drop an attribute.
    pub fn remove_attribute(&self, key: &str) {
        self.shared.write().attrs.remove(key);
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Whether close has been requested.
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Validate configuration, deliver `on_open`, and start both loops.
    ///
    /// Fails with [`SessionError::Configuration`] when the listener or
    /// encoder is missing, when a raw (decoder-less) WebSocket session
    /// carries a message type other than [`Bytes`], or when the session was
    /// already started. Fails with [`SessionError::Rejected`] when `on_open`
    /// refuses the session; `on_close` is still delivered in that case.
    pub async fn run(&self) -> Result<()> {
        let (listener, queue_rx) = {
            let mut shared = self.shared.write();
            let listener = shared
                .listener
                .clone()
                .ok_or(SessionError::Configuration("event listener not set"))?;
            if shared.encoder.is_none() {
                return Err(SessionError::Configuration("encoder not set"));
            }
            if self.transport.kind() == TransportKind::Ws
                && shared.decoder.is_none()
                && TypeId::of::<P>() != TypeId::of::<Bytes>()
            {
                return Err(SessionError::Configuration(
                    "raw websocket delivery requires Bytes messages",
                ));
            }
            let queue = shared
                .queue
                .get_or_insert_with(|| Arc::new(WriteQueue::new(DEFAULT_WRITE_QUEUE_CAP)))
                .clone();
            let queue_rx = queue
                .take_receiver()
                .ok_or(SessionError::Configuration("session already started"))?;
            (listener, queue_rx)
        };

        let this = self.arc();
        self.transport.stats().touch();
        if let Err(e) = listener.on_open(&this).await {
            error!("{} listener rejected open: {e:#}", self.token());
            self.stop();
            listener.on_close(&this).await;
            self.reap(queue_rx).await;
            return Err(SessionError::Rejected(format!("{e:#}")));
        }

        info!("{} opened", self.token());
        tokio::spawn(recv::run(Arc::clone(&this)));
        tokio::spawn(send::run(this, queue_rx));
        Ok(())
    }

    /// Request shutdown. Safe to call any number of times; only the first
    /// call has an effect.
    pub fn close(&self) {
        self.stop();
        debug!("{} close requested", self.token());
    }

    /// Latch `done` exactly once, force imminent I/O deadlines so both loops
    /// wake promptly, and fire the endpoint stop hook.
    pub(crate) fn stop(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.stop_once.call_once(|| {
            let now = Instant::now();
            self.transport
                .set_read_deadline(Some(now + self.transport.read_timeout()));
            self.transport
                .set_write_deadline(Some(now + self.transport.write_timeout()));
            self.done.cancel();

            let endpoint = self.shared.read().endpoint.clone();
            if let Some(endpoint) = endpoint {
                endpoint.on_stop(self.id);
            }
        });
    }

    pub(crate) async fn done_wait(&self) {
        self.done.cancelled().await;
    }

    pub(crate) async fn rdone_wait(&self) {
        self.rdone.cancelled().await;
    }

    pub(crate) fn latch_rdone(&self) {
        self.rdone.cancel();
    }

    /// Release everything the loops held: attributes, the queue, and the
    /// transport. Runs exactly once, after both loops have exited.
    pub(crate) async fn reap(&self, mut queue_rx: tokio::sync::mpsc::Receiver<P>) {
        self.shared.write().attrs.clear();

        // Close the queue so late offers fail fast, then discard leftovers.
        queue_rx.close();
        while queue_rx.try_recv().is_ok() {}

        self.transport.close(self.wait_on_close()).await;
        debug!("{} reaped", self.token());
    }

    // ---- writes -------------------------------------------------------------

    /// Submit a message for writing.
    ///
    /// With a zero `timeout` the encoder runs immediately on the caller and
    /// the queue is bypassed. Otherwise the message is offered to the write
    /// queue, giving up with [`SessionError::Blocked`] after `timeout` as
    /// measured on the session timer.
    pub async fn write_message(&self, message: P, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        if timeout.is_zero() {
            return match AssertUnwindSafe(self.encode_and_write(&message))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let msg = crate::panic_message(&panic);
                    error!("{} panic while writing message: {msg}", self.token());
                    self.stop();
                    Err(SessionError::Panicked(msg))
                }
            };
        }

        let queue = self
            .shared
            .read()
            .queue
            .clone()
            .ok_or(SessionError::Configuration("session not started"))?;
        let timer = self.timer_handle();
        queue.offer(message, timeout, timer.as_ref()).await
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.transport.write(bytes).await?;
        self.transport.stats().inc_write_pkgs(1);
        Ok(())
    }

    /// Write raw bytes to an explicit datagram peer, e.g. to answer the
    /// sender of an [`Inbound`] message on a server-side UDP session.
    pub async fn write_bytes_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.transport.write_to(bytes, peer).await?;
        self.transport.stats().inc_write_pkgs(1);
        Ok(())
    }

    /// Write several byte slices as one transport write; counts one package
    /// per part.
    pub async fn write_bytes_vector(&self, parts: &[&[u8]]) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match parts {
            [] => Ok(()),
            [single] => self.write_bytes(single).await,
            parts => {
                let total = parts.iter().map(|p| p.len()).sum();
                let pool = buffer_pool();
                let mut buf = pool.acquire(total);
                for part in parts {
                    buf.extend_from_slice(part);
                }
                let result = self.transport.write(&buf).await;
                pool.release(buf);
                result?;
                self.transport.stats().inc_write_pkgs(parts.len() as u64);
                Ok(())
            }
        }
    }

    /// Encode `message` and write the result; bumps `write_pkgs` only on
    /// success.
    pub(crate) async fn encode_and_write(&self, message: &P) -> Result<()> {
        let encoder = self
            .shared
            .read()
            .encoder
            .clone()
            .ok_or(SessionError::Configuration("encoder not set"))?;

        let pool = buffer_pool();
        let mut buf = pool.acquire(DEFAULT_READ_BUF_LEN);
        let result = match encoder.encode(message, &mut buf) {
            Ok(()) => self
                .transport
                .write(&buf)
                .await
                .map_err(SessionError::Transport),
            Err(e) => Err(SessionError::Framing(e)),
        };
        pool.release(buf);

        if result.is_ok() {
            self.transport.stats().inc_write_pkgs(1);
        }
        result
    }

    // ---- plumbing shared with the loops ------------------------------------

    pub(crate) fn listener(&self) -> Option<Arc<dyn EventListener<P>>> {
        self.shared.read().listener.clone()
    }

    pub(crate) fn decoder(&self) -> Option<Arc<dyn Decoder<Item = P>>> {
        self.shared.read().decoder.clone()
    }

    pub(crate) fn task_pool(&self) -> Option<Arc<dyn TaskPool>> {
        self.shared.read().task_pool.clone()
    }

    pub(crate) fn timer_handle(&self) -> Arc<dyn Timer> {
        if let Some(timer) = self.shared.read().timer.clone() {
            return timer;
        }
        strand_timer::global()
    }

    /// Hand one decoded message to the listener, through the task pool when
    /// configured, inline otherwise.
    pub(crate) async fn dispatch(&self, message: Inbound<P>) {
        let Some(listener) = self.listener() else {
            return;
        };
        let task_pool = self.task_pool();
        let session = self.arc();
        let unit = async move {
            listener.on_message(&session, message).await;
            session.transport.stats().inc_read_pkgs(1);
        };
        match task_pool {
            Some(pool) => pool.submit(Box::pin(unit)),
            None => unit.await,
        }
    }
}

/// Move a raw WebSocket frame into the session's message type.
///
/// Only succeeds when `P` is [`Bytes`]; `run()` refuses decoder-less
/// WebSocket sessions for any other message type.
pub(crate) fn frame_into_message<P: 'static>(frame: Bytes) -> Option<P> {
    let mut slot = Some(frame);
    let any: &mut dyn Any = &mut slot;
    any.downcast_mut::<Option<P>>().and_then(Option::take)
}
