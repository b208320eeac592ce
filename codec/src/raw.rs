//! Pass-through framing.
//!
//! For transports that already carry message boundaries (WebSocket frames,
//! UDP datagrams) no reframing is needed; this codec hands the bytes through
//! untouched.

use crate::{CodecError, DecodeOutcome, Decoder, Encoder};
use bytes::{Bytes, BytesMut};

/// A codec that treats every buffer it is given as one whole message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Decoder for RawCodec {
    type Item = Bytes;

    fn decode(&self, src: &[u8]) -> Result<DecodeOutcome<Bytes>, CodecError> {
        if src.is_empty() {
            return Ok(DecodeOutcome::Incomplete);
        }
        Ok(DecodeOutcome::Complete {
            item: Bytes::copy_from_slice(src),
            consumed: src.len(),
        })
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let codec = RawCodec;
        let mut dst = BytesMut::new();
        codec.encode(&Bytes::from_static(b"datagram"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"datagram");

        match codec.decode(&dst).unwrap() {
            DecodeOutcome::Complete { item, consumed } => {
                assert_eq!(&item[..], b"datagram");
                assert_eq!(consumed, 8);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_is_incomplete() {
        assert_eq!(RawCodec.decode(&[]).unwrap(), DecodeOutcome::Incomplete);
    }
}
