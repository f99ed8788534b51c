//! Frame codec for `tokio_util::codec::Framed`.

use crate::error::SatelliteError;
use bytes::BytesMut;
use tether_protocol::{Frame, WireMessage};
use tokio_util::codec::{Decoder, Encoder};

/// Encodes and decodes [`WireMessage`]s as tagged, length-prefixed frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = SatelliteError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Frame::decode_from(src)? {
            Some(frame) => Ok(Some(WireMessage::from_frame(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = SatelliteError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.to_frame()?.encode_into(dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::{Ping, Pong};

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = WireCodec;
        let mut encoded = BytesMut::new();
        codec.encode(WireMessage::Ping(Ping { nonce: 7 }), &mut encoded).unwrap();
        codec.encode(WireMessage::Pong(Pong { nonce: 8 }), &mut encoded).unwrap();

        let mut src = BytesMut::new();
        src.extend_from_slice(&encoded[..3]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&encoded[3..]);

        assert_eq!(codec.decode(&mut src).unwrap(), Some(WireMessage::Ping(Ping { nonce: 7 })));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(WireMessage::Pong(Pong { nonce: 8 })));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut codec = WireCodec;
        let mut src = BytesMut::from(&[0xEE, 0, 0, 0, 1, 0xA0][..]);
        assert!(matches!(codec.decode(&mut src), Err(SatelliteError::Protocol(_))));
    }
}
