//! Incremental framing contracts for strand sessions.
//!
//! A session turns a raw byte connection into a channel of application
//! messages; the codec is the pluggable piece that knows where one message
//! ends and the next begins. This crate defines the decoder/encoder contracts
//! the session engine drives, and ships two small codecs used by tests and
//! examples.
//!
//! ## Decoder contract
//!
//! For stream transports the engine calls [`Decoder::decode`] against its
//! accumulation buffer and interprets the result as follows:
//!
//! 1. `Err(_)`: fatal framing error; the session fails.
//! 2. `Ok(Incomplete)`: not enough bytes yet; keep the buffer and read more.
//! 3. `Ok(Skip(n))`: discard `n` bytes (padding, junk, wire heartbeats) and
//!    invoke again.
//! 4. `Ok(Complete { item, consumed })`: emit `item`, discard `consumed`
//!    bytes, and invoke again in case another message is buffered.
//!
//! For datagram transports the decoder is invoked exactly once per datagram
//! and `consumed` is informational.
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use strand_codec::{DecodeOutcome, Decoder, Encoder, LengthDelimitedCodec};
//!
//! let codec = LengthDelimitedCodec::new();
//! let mut wire = BytesMut::new();
//! codec.encode(&bytes::Bytes::from_static(b"hello"), &mut wire).unwrap();
//!
//! match codec.decode(&wire).unwrap() {
//!     DecodeOutcome::Complete { item, consumed } => {
//!         assert_eq!(&item[..], b"hello");
//!         assert_eq!(consumed, wire.len());
//!     }
//!     _ => unreachable!(),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod length;
pub mod raw;

// Re-export main types
pub use error::CodecError;
pub use length::{LengthDelimitedCodec, DEFAULT_MAX_FRAME_LEN};
pub use raw::RawCodec;

use bytes::BytesMut;

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome<T> {
    /// A complete message together with the number of bytes it consumed.
    Complete {
        /// The decoded application message.
        item: T,
        /// Bytes to discard from the front of the buffer.
        consumed: usize,
    },
    /// Not enough buffered bytes to make progress.
    Incomplete,
    /// Discard this many bytes without producing a message.
    ///
    /// `Skip(0)` is treated as [`DecodeOutcome::Incomplete`] by the engine so
    /// a misbehaving decoder cannot wedge the receive loop.
    Skip(usize),
}

/// Turns buffered bytes into application messages.
pub trait Decoder: Send + Sync + 'static {
    /// The message type this decoder produces.
    type Item: Send + 'static;

    /// Attempt to decode one message from the front of `src`.
    ///
    /// Implementations must not assume `src` holds a whole message; see the
    /// crate-level contract.
    fn decode(&self, src: &[u8]) -> Result<DecodeOutcome<Self::Item>, CodecError>;
}

/// Turns application messages into wire bytes.
pub trait Encoder: Send + Sync + 'static {
    /// The message type this encoder consumes.
    type Item: Send + 'static;

    /// Append the encoding of `item` to `dst`.
    fn encode(&self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), CodecError>;
}

/// A matched decoder/encoder pair over one message type.
///
/// Blanket-implemented for any type providing both halves.
pub trait Codec: Decoder + Encoder<Item = <Self as Decoder>::Item> {}

impl<C> Codec for C where C: Decoder + Encoder<Item = <C as Decoder>::Item> {}
