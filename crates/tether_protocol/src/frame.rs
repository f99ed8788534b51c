//! Length-prefixed frames.
//!
//! Wire layout:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | tag u8 | length u32 BE  | payload (CBOR)  |
//! +--------+----------------+-----------------+
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest accepted payload.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// A tagged payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message tag.
    pub tag: u8,
    /// Encoded message body.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame.
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> ProtocolResult<()> {
        let len = self.payload.len();
        let wire_len = u32::try_from(len)
            .ok()
            .filter(|_| len <= MAX_FRAME_PAYLOAD)
            .ok_or(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_PAYLOAD,
            })?;
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_u8(self.tag);
        dst.put_u32(wire_len);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Removes one complete frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// prefix is rejected before its payload is buffered.
    pub fn decode_from(src: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[1..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { tag, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        Frame::new(7, vec![0xaa, 0xbb]).encode_into(&mut buf).unwrap();
        assert_eq!(&buf[..], &[7, 0, 0, 0, 2, 0xaa, 0xbb]);
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut full = BytesMut::new();
        Frame::new(8, vec![1, 2, 3]).encode_into(&mut full).unwrap();
        Frame::new(9, Vec::new()).encode_into(&mut full).unwrap();

        let mut src = BytesMut::from(&full[..4]);
        assert_eq!(Frame::decode_from(&mut src).unwrap(), None);
        src.extend_from_slice(&full[4..7]);
        assert_eq!(Frame::decode_from(&mut src).unwrap(), None);
        src.extend_from_slice(&full[7..]);

        let first = Frame::decode_from(&mut src).unwrap().unwrap();
        assert_eq!(first, Frame::new(8, vec![1, 2, 3]));
        let second = Frame::decode_from(&mut src).unwrap().unwrap();
        assert_eq!(second.tag, 9);
        assert!(second.payload.is_empty());
        assert!(src.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut src = BytesMut::new();
        src.put_u8(6);
        src.put_u32(u32::MAX);
        assert!(matches!(
            Frame::decode_from(&mut src),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
