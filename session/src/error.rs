//! Session error types.

use crate::transport::TransportError;
use strand_codec::CodecError;
use thiserror::Error;

/// Convenience alias for session results.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the session engine.
///
/// Transient I/O timeouts never appear here: the loops swallow them and
/// iterate (see [`TransportError::is_timeout`]).
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session has been closed; the operation had no effect.
    #[error("session closed")]
    Closed,

    /// The write queue did not accept the message within the caller's
    /// timeout.
    #[error("write queue full: offer timed out")]
    Blocked,

    /// The decoder reported an unrecoverable framing problem, or a message
    /// exceeded the configured length limit. Fatal for the session.
    #[error("framing: {0}")]
    Framing(#[from] CodecError),

    /// The transport failed with a non-timeout error. Fatal.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// A `run()` precondition was violated.
    #[error("configuration: {0}")]
    Configuration(&'static str),

    /// The listener's `on_open` refused the session.
    #[error("listener rejected session open: {0}")]
    Rejected(String),

    /// A panic was caught inside a session task and made fatal.
    #[error("panic in session task: {0}")]
    Panicked(String),
}
