//! Upcalls from the engine into user code.

use crate::error::SessionError;
use crate::session::{Session, SessionId};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A decoded inbound message together with its datagram peer, when known.
///
/// `peer` is populated for UDP sessions so listeners know who sent the
/// datagram; stream and frame transports have a fixed remote and leave it
/// empty.
#[derive(Debug)]
pub struct Inbound<P> {
    /// The decoded application message.
    pub payload: P,
    /// Sender address for datagram transports.
    pub peer: Option<SocketAddr>,
}

/// Event callbacks a session delivers to user code.
///
/// All callbacks run on engine tasks: `on_message` on the receive loop (or a
/// task pool worker), `on_cron` and `on_close` on the send loop. Blocking
/// here stalls the corresponding loop.
#[async_trait]
pub trait EventListener<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Invoked once before the loops start. Returning an error closes the
    /// session immediately; `on_close` still fires.
    async fn on_open(&self, _session: &Arc<Session<P>>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked for every decoded inbound message.
    async fn on_message(&self, session: &Arc<Session<P>>, message: Inbound<P>);

    /// Invoked on every cron tick while the session is healthy.
    async fn on_cron(&self, _session: &Arc<Session<P>>) {}

    /// Invoked when the receive loop exits carrying an error.
    async fn on_error(&self, _session: &Arc<Session<P>>, _error: &SessionError) {}

    /// Invoked exactly once, after both loops have exited.
    async fn on_close(&self, _session: &Arc<Session<P>>) {}
}

/// Which side of the connection an endpoint represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// The endpoint dialed out.
    Client,
    /// The endpoint accepted the connection.
    Server,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointType::Client => f.write_str("client"),
            EndpointType::Server => f.write_str("server"),
        }
    }
}

/// The client or server that owns a session.
pub trait Endpoint: Send + Sync {
    /// Tag describing the endpoint side.
    fn endpoint_type(&self) -> EndpointType;

    /// Invoked once when the session begins shutdown. Client endpoints
    /// typically schedule a reconnect here.
    fn on_stop(&self, _session_id: SessionId) {}
}
