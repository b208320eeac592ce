//! Transport-agnostic connection session engine.
//!
//! A [`Session`] drives one bidirectional byte connection (a TCP stream, a
//! UDP socket, or a WebSocket) through its lifetime, turning the raw
//! connection into an asynchronous, framed message channel with
//! backpressure, heartbeats, graceful shutdown, and per-connection
//! statistics.
//!
//! ## Features
//!
//! - **One Interface, Three Transports**: stream, datagram, and frame
//!   connections behind the [`Transport`] adapter
//! - **Pluggable Codecs**: incremental [`Decoder`]/[`Encoder`] pairs from
//!   `strand-codec`
//! - **Backpressure**: a bounded write queue with wheel-timed offers
//! - **Heartbeats**: a per-session cron tick driving `on_cron` and WebSocket
//!   PINGs
//! - **Graceful Drain**: queued writes get a bounded window after close
//! - **Statistics**: atomic byte/packet counters and an activity timestamp
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use strand_codec::LengthDelimitedCodec;
//! use strand_session::{EventListener, Inbound, Session};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl EventListener<Bytes> for Echo {
//!     async fn on_message(&self, session: &Arc<Session<Bytes>>, message: Inbound<Bytes>) {
//!         let _ = session
//!             .write_message(message.payload, std::time::Duration::from_secs(1))
//!             .await;
//!     }
//! }
//!
//! # async fn example(stream: tokio::net::TcpStream) -> strand_session::Result<()> {
//! let session = Session::tcp(stream);
//! session.set_codec(Arc::new(LengthDelimitedCodec::new()));
//! session.set_event_listener(Arc::new(Echo));
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod listener;
pub mod pool;
mod queue;
mod recv;
mod send;
pub mod session;
pub mod task;
pub mod transport;

// Re-export main types
pub use error::{Result, SessionError};
pub use listener::{Endpoint, EndpointType, EventListener, Inbound};
pub use pool::{buffer_pool, BufferPool};
pub use session::{
    Session, SessionId, CONNECT_PING, DEFAULT_CRON_PERIOD, DEFAULT_IO_TIMEOUT,
    DEFAULT_READ_BUF_LEN, DEFAULT_WAIT_ON_CLOSE, DEFAULT_WRITE_QUEUE_CAP,
};
pub use task::{Task, TaskPool, WorkerPool};
pub use transport::{Transport, TransportError, TransportKind, TransportStats};

// Codec and timer seams, re-exported for convenience
pub use strand_codec::{Codec, CodecError, DecodeOutcome, Decoder, Encoder};
pub use strand_timer::Timer;

use std::any::Any;

/// Best-effort rendering of a caught panic payload.
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
