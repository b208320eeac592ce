//! Length-prefixed framing.
//!
//! Frames are a u32 big-endian payload length followed by the payload. The
//! decoder enforces a frame cap before buffering so a malicious peer cannot
//! make the session accumulate unbounded state.

use crate::{CodecError, DecodeOutcome, Decoder, Encoder};
use bytes::{BufMut, Bytes, BytesMut};

/// Default frame cap (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
const PREFIX_LEN: usize = 4;

/// A u32-BE length-prefixed codec over [`Bytes`] payloads.
#[derive(Debug, Clone)]
pub struct LengthDelimitedCodec {
    max_frame_len: usize,
}

impl LengthDelimitedCodec {
    /// Create a codec with the default frame cap.
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Create a codec with an explicit frame cap.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for LengthDelimitedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LengthDelimitedCodec {
    type Item = Bytes;

    fn decode(&self, src: &[u8]) -> Result<DecodeOutcome<Bytes>, CodecError> {
        // Need the whole prefix before anything else.
        if src.len() < PREFIX_LEN {
            return Ok(DecodeOutcome::Incomplete);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::TooLong {
                length: len,
                limit: self.max_frame_len,
            });
        }

        if src.len() < PREFIX_LEN + len {
            return Ok(DecodeOutcome::Incomplete);
        }

        Ok(DecodeOutcome::Complete {
            item: Bytes::copy_from_slice(&src[PREFIX_LEN..PREFIX_LEN + len]),
            consumed: PREFIX_LEN + len,
        })
    }
}

impl Encoder for LengthDelimitedCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        if item.len() > self.max_frame_len {
            return Err(CodecError::TooLong {
                length: item.len(),
                limit: self.max_frame_len,
            });
        }

        dst.reserve(PREFIX_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(item);
        Ok(())
    }
}
