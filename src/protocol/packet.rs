use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum payload of one physical packet (16MB - 1); longer payloads are split
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// One physical MySQL packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(PACKET_HEADER_SIZE + len);
        dst.put_uint_le(len as u64, 3);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Payload length announced by a header, if enough bytes are buffered
    pub fn peek_len(src: &[u8]) -> Option<usize> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }
        Some(src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16))
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        let len = Self::peek_len(src)?;
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// Command opcodes (first payload byte of a client request)
#[allow(dead_code)]
pub mod command {
    pub const COM_SLEEP: u8 = 0x00;
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_FIELD_LIST: u8 = 0x04;
    pub const COM_STATISTICS: u8 = 0x09;
    pub const COM_PING: u8 = 0x0e;
    pub const COM_CHANGE_USER: u8 = 0x11;
    pub const COM_STMT_PREPARE: u8 = 0x16;
    pub const COM_STMT_EXECUTE: u8 = 0x17;
    pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
    pub const COM_STMT_CLOSE: u8 = 0x19;
    pub const COM_STMT_RESET: u8 = 0x1a;
    pub const COM_SET_OPTION: u8 = 0x1b;
    pub const COM_STMT_FETCH: u8 = 0x1c;
    pub const COM_RESET_CONNECTION: u8 = 0x1f;

    /// Human-readable opcode name for logs
    pub fn name(cmd: u8) -> &'static str {
        match cmd {
            COM_SLEEP => "sleep",
            COM_QUIT => "quit",
            COM_INIT_DB => "init_db",
            COM_QUERY => "query",
            COM_FIELD_LIST => "field_list",
            COM_STATISTICS => "statistics",
            COM_PING => "ping",
            COM_CHANGE_USER => "change_user",
            COM_STMT_PREPARE => "stmt_prepare",
            COM_STMT_EXECUTE => "stmt_execute",
            COM_STMT_SEND_LONG_DATA => "stmt_send_long_data",
            COM_STMT_CLOSE => "stmt_close",
            COM_STMT_RESET => "stmt_reset",
            COM_SET_OPTION => "set_option",
            COM_STMT_FETCH => "stmt_fetch",
            COM_RESET_CONNECTION => "reset_connection",
            _ => "other",
        }
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
}

/// Server status flags carried by OK and EOF packets
#[allow(dead_code)]
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        let mut buf = BytesMut::new();
        Packet::new(3, vec![0x01u8; 300]).encode(&mut buf);
        assert_eq!(&buf[..4], &[0x2c, 0x01, 0x00, 0x03]);
        assert_eq!(buf.len(), 304);
    }

    #[test]
    fn test_decode_needs_full_packet() {
        let mut buf = BytesMut::from(&[0x05u8, 0x00, 0x00, 0x00, 0x03, b's'][..]);
        assert!(Packet::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(b"elx");
        let packet = Packet::decode(&mut buf).unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(&packet.payload[..], b"\x03selx");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_command_names() {
        assert_eq!(command::name(command::COM_QUIT), "quit");
        assert_eq!(command::name(command::COM_QUERY), "query");
        assert_eq!(command::name(0xee), "other");
    }
}
