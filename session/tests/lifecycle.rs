//! Lifecycle and per-transport behavior: open rejection, idempotent close,
//! fatal framing, UDP connect-ping discard, and WebSocket heartbeats.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strand_codec::{LengthDelimitedCodec, RawCodec};
use strand_session::{
    Endpoint, EndpointType, EventListener, Inbound, Session, SessionError, SessionId, CONNECT_PING,
};
use strand_timer::Wheel;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct Recorder {
    reject_open: bool,
    messages: Mutex<Vec<Inbound<Bytes>>>,
    opens: AtomicUsize,
    crons: AtomicUsize,
    errors: AtomicUsize,
    closes: AtomicUsize,
    last_event: Mutex<Option<&'static str>>,
}

impl Recorder {
    fn rejecting() -> Self {
        Self {
            reject_open: true,
            ..Self::default()
        }
    }

    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl EventListener<Bytes> for Recorder {
    async fn on_open(&self, _session: &Arc<Session<Bytes>>) -> anyhow::Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_event.lock().unwrap() = Some("open");
        if self.reject_open {
            anyhow::bail!("not today");
        }
        Ok(())
    }

    async fn on_message(&self, _session: &Arc<Session<Bytes>>, message: Inbound<Bytes>) {
        self.messages.lock().unwrap().push(message);
        *self.last_event.lock().unwrap() = Some("message");
    }

    async fn on_cron(&self, _session: &Arc<Session<Bytes>>) {
        self.crons.fetch_add(1, Ordering::SeqCst);
        *self.last_event.lock().unwrap() = Some("cron");
    }

    async fn on_error(&self, _session: &Arc<Session<Bytes>>, _error: &SessionError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_event.lock().unwrap() = Some("error");
    }

    async fn on_close(&self, _session: &Arc<Session<Bytes>>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.last_event.lock().unwrap() = Some("close");
    }
}

async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_open_still_delivers_on_close() {
    let (client, _server) = tcp_pair().await;
    let session = Session::tcp(client);
    let recorder = Arc::new(Recorder::rejecting());
    session.set_codec(Arc::new(LengthDelimitedCodec::new()));
    session.set_event_listener(recorder.clone());
    session.set_wait_on_close(Duration::from_millis(100));

    let result = session.run().await;
    assert!(matches!(result, Err(SessionError::Rejected(_))));
    assert!(session.is_closed());
    assert_eq!(recorder.opens.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.message_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_is_idempotent_and_on_close_fires_once() {
    let (client, _server) = tcp_pair().await;
    let session = Session::tcp(client);
    let recorder = Arc::new(Recorder::default());
    session.set_codec(Arc::new(LengthDelimitedCodec::new()));
    session.set_event_listener(recorder.clone());
    session.run().await.unwrap();

    session.close();
    session.close();
    session.close();

    assert!(
        wait_until(Duration::from_secs(5), || recorder
            .closes
            .load(Ordering::SeqCst)
            >= 1)
        .await
    );
    // Give a second round of callbacks a chance to misfire before checking.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.last_event.lock().unwrap(), Some("close"));

    assert!(matches!(
        session
            .write_message(Bytes::from_static(b"late"), Duration::from_millis(10))
            .await,
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        session.write_bytes(b"late").await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_message_is_fatal_on_streams() {
    let (mut client, server) = tcp_pair().await;
    let session = Session::tcp(server);
    let recorder = Arc::new(Recorder::default());
    session.set_codec(Arc::new(LengthDelimitedCodec::new()));
    session.set_event_listener(recorder.clone());
    session.set_max_message_length(4);
    session.run().await.unwrap();

    let mut frame = Vec::new();
    frame.extend_from_slice(&10u32.to_be_bytes());
    frame.extend_from_slice(b"0123456789");
    client.write_all(&frame).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || recorder
            .errors
            .load(Ordering::SeqCst)
            == 1)
        .await,
        "framing violation should surface through on_error"
    );
    assert_eq!(recorder.message_count(), 0);
    assert!(
        wait_until(Duration::from_secs(5), || recorder
            .closes
            .load(Ordering::SeqCst)
            == 1)
        .await
    );
    assert!(session.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_connect_ping_is_discarded() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let session = Session::udp(socket, None);
    let recorder = Arc::new(Recorder::default());
    session.set_codec(Arc::new(RawCodec));
    session.set_event_listener(recorder.clone());
    session.run().await.unwrap();

    sender.send_to(CONNECT_PING, addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(recorder.message_count(), 0, "connect ping must not dispatch");
    assert_eq!(session.stats().read_pkgs(), 0);
    assert!(!session.is_closed(), "connect ping must not close the session");

    // A real datagram still flows, tagged with its sender.
    sender.send_to(b"real traffic", addr).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || recorder.message_count() == 1).await);
    {
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(&messages[0].payload[..], b"real traffic");
        assert_eq!(messages[0].peer, Some(sender_addr));
    }
    assert_eq!(session.stats().read_pkgs(), 1);

    session.close();
    assert!(
        wait_until(Duration::from_secs(5), || recorder
            .closes
            .load(Ordering::SeqCst)
            == 1)
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ws_cron_emits_pings_and_on_cron() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let pings = Arc::new(AtomicUsize::new(0));
    let server_pings = Arc::clone(&pings);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Ping(_)) {
                server_pings.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/"), stream)
        .await
        .unwrap();

    // No decoder: raw frame delivery. The cron period is below the global
    // wheel tick, so install a finer wheel.
    let session = Session::ws(ws, Some(addr));
    let recorder = Arc::new(Recorder::default());
    session.set_encoder(Arc::new(RawCodec));
    session.set_event_listener(recorder.clone());
    session.set_cron_period(Duration::from_millis(50));
    session.set_timer(Wheel::new(Duration::from_millis(10), 256));
    session.run().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            pings.load(Ordering::SeqCst) >= 3 && recorder.crons.load(Ordering::SeqCst) >= 3
        })
        .await,
        "expected at least three heartbeats, got pings={} crons={}",
        pings.load(Ordering::SeqCst),
        recorder.crons.load(Ordering::SeqCst)
    );

    session.close();
    assert!(
        wait_until(Duration::from_secs(5), || recorder
            .closes
            .load(Ordering::SeqCst)
            == 1)
        .await
    );
}

struct ReconnectingClient {
    stops: AtomicUsize,
}

impl Endpoint for ReconnectingClient {
    fn endpoint_type(&self) -> EndpointType {
        EndpointType::Client
    }

    fn on_stop(&self, _session_id: SessionId) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_endpoint_stop_hook_fires_once() {
    let (client, _server) = tcp_pair().await;
    let session = Session::tcp(client);
    let recorder = Arc::new(Recorder::default());
    let endpoint = Arc::new(ReconnectingClient {
        stops: AtomicUsize::new(0),
    });
    session.set_codec(Arc::new(LengthDelimitedCodec::new()));
    session.set_event_listener(recorder.clone());
    session.set_endpoint(endpoint.clone());
    session.run().await.unwrap();

    assert!(session.stat().contains(":client:"));

    session.close();
    session.close();
    assert!(
        wait_until(Duration::from_secs(5), || recorder
            .closes
            .load(Ordering::SeqCst)
            == 1)
        .await
    );
    assert_eq!(endpoint.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_bytes_vector_counts_each_part() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = tokio::io::copy(&mut stream, &mut sink).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let session = Session::tcp(stream);
    let recorder = Arc::new(Recorder::default());
    session.set_codec(Arc::new(LengthDelimitedCodec::new()));
    session.set_event_listener(recorder.clone());
    session.run().await.unwrap();

    session
        .write_bytes_vector(&[b"ab", b"cd", b"ef"])
        .await
        .unwrap();
    assert_eq!(session.stats().write_pkgs(), 3);
    assert_eq!(session.stats().write_bytes(), 6);

    session.write_bytes(b"raw").await.unwrap();
    assert_eq!(session.stats().write_pkgs(), 4);
    assert_eq!(session.stats().write_bytes(), 9);

    session.close();
}
