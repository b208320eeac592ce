//! TCP echo over strand sessions.
//!
//! Starts an echo server and a client in one process, sends three framed
//! messages, and prints the session statistics.
//!
//! Run with: `cargo run --example tcp_echo`

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use strand_codec::LengthDelimitedCodec;
use strand_session::{EventListener, Inbound, Session};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

/// Server side: write every message straight back.
struct Echo;

#[async_trait]
impl EventListener<Bytes> for Echo {
    async fn on_message(&self, session: &Arc<Session<Bytes>>, message: Inbound<Bytes>) {
        if let Err(e) = session
            .write_message(message.payload, Duration::from_secs(1))
            .await
        {
            error!("echo write failed: {e}");
        }
    }
}

/// Client side: log every reply.
struct Printer;

#[async_trait]
impl EventListener<Bytes> for Printer {
    async fn on_message(&self, _session: &Arc<Session<Bytes>>, message: Inbound<Bytes>) {
        info!("reply: {:?}", String::from_utf8_lossy(&message.payload));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!("echo server on {addr}");

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            info!("accepted {peer}");
            let session = Session::tcp(stream);
            session.set_codec(Arc::new(LengthDelimitedCodec::new()));
            session.set_event_listener(Arc::new(Echo));
            if let Err(e) = session.run().await {
                error!("server session: {e}");
            }
        }
    });

    let stream = TcpStream::connect(addr).await?;
    let session = Session::tcp(stream);
    session.set_codec(Arc::new(LengthDelimitedCodec::new()));
    session.set_event_listener(Arc::new(Printer));
    session.run().await?;

    for msg in ["one", "two", "three"] {
        session
            .write_message(Bytes::from_static(msg.as_bytes()), Duration::from_secs(1))
            .await?;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("{}", session.stat());
    session.close();
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(())
}
