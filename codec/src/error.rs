//! Codec error types.

use thiserror::Error;

/// Errors raised while framing or unframing messages.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The byte stream does not follow the framing rules.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A message exceeds the permitted length.
    #[error("message too long: {length} > {limit}")]
    TooLong {
        /// Observed message length in bytes.
        length: usize,
        /// The configured limit.
        limit: usize,
    },

    /// The payload could not be converted to or from the application type.
    #[error("payload: {0}")]
    Payload(String),
}
