use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, PACKET_HEADER_SIZE};
use crate::net::PacketIoError;

/// MySQL packet codec for use with tokio Framed
///
/// Yields physical packets; joining split payloads is the caller's job.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(super::MAX_PACKET_SIZE + PACKET_HEADER_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketIoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(len) = Packet::peek_len(src) {
            let frame_size = PACKET_HEADER_SIZE + len;
            if frame_size > self.max_frame_size {
                return Err(PacketIoError::PacketTooLarge {
                    size: frame_size,
                    limit: self.max_frame_size,
                });
            }
            src.reserve(frame_size.saturating_sub(src.len()));
        }
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketIoError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = PacketCodec::new(16);
        let mut buf = BytesMut::from(&[0x20u8, 0x00, 0x00, 0x00][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            PacketIoError::PacketTooLarge { size: 36, limit: 16 }
        ));
    }

    #[test]
    fn test_encode_then_decode() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Packet::new(7, &b"\x0e"[..]), &mut buf).unwrap();
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.sequence_id, 7);
        assert_eq!(&packet.payload[..], &[0x0e]);
    }
}
