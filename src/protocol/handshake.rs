//! Connection-phase and generic response packets
//!
//! The proxy relays authentication verbatim, so it only needs enough parsing
//! to rewrite capability flags, spot SSL requests and classify responses.

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::capabilities::*;

/// First byte of an OK packet
pub const OK_HEADER: u8 = 0x00;
/// First byte of an ERR packet
pub const ERR_HEADER: u8 = 0xFF;
/// First byte of an EOF packet, also of an auth switch request
pub const EOF_HEADER: u8 = 0xFE;
/// First byte of a LOCAL INFILE request
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;
/// First byte of an auth-more-data packet
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
/// caching_sha2_password: cached credentials accepted, OK follows
pub const FAST_AUTH_OK: u8 = 0x03;

/// Fixed length of an SSL request (truncated handshake response)
pub const SSL_REQUEST_LEN: usize = 32;

/// Parsed fields of a HandshakeV10 packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Offset of the lower capability half; the upper half sits 5 bytes later
    cap_offset: usize,
}

impl InitialHandshake {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let protocol_version = *payload.first()?;
        if protocol_version != 10 {
            return None;
        }

        let nul = payload[1..].iter().position(|&b| b == 0)? + 1;
        let server_version = String::from_utf8_lossy(&payload[1..nul]).to_string();

        // connection id (4) + auth data part 1 (8) + filler (1)
        let id_offset = nul + 1;
        let cap_offset = id_offset + 13;
        if payload.len() < cap_offset + 7 {
            return None;
        }

        let connection_id = u32::from_le_bytes(payload[id_offset..id_offset + 4].try_into().ok()?);
        let lower = u16::from_le_bytes([payload[cap_offset], payload[cap_offset + 1]]) as u32;
        let character_set = payload[cap_offset + 2];
        let status_flags = u16::from_le_bytes([payload[cap_offset + 3], payload[cap_offset + 4]]);
        let upper = u16::from_le_bytes([payload[cap_offset + 5], payload[cap_offset + 6]]) as u32;

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags: lower | (upper << 16),
            character_set,
            status_flags,
            cap_offset,
        })
    }

    /// Copy of `payload` with the capability fields replaced
    pub fn with_capabilities(&self, payload: &[u8], capability_flags: u32) -> Bytes {
        let mut buf = BytesMut::from(payload);
        let lower = (capability_flags as u16).to_le_bytes();
        let upper = ((capability_flags >> 16) as u16).to_le_bytes();
        buf[self.cap_offset..self.cap_offset + 2].copy_from_slice(&lower);
        buf[self.cap_offset + 5..self.cap_offset + 7].copy_from_slice(&upper);
        buf.freeze()
    }
}

/// Fixed-size prefix of a client handshake response
///
/// An SSL request is exactly this prefix with `CLIENT_SSL` set.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    /// Absent in an SSL request
    pub username: Option<String>,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < SSL_REQUEST_LEN {
            return None;
        }

        let capability_flags = u32::from_le_bytes(payload[0..4].try_into().ok()?);
        let max_packet_size = u32::from_le_bytes(payload[4..8].try_into().ok()?);
        let character_set = payload[8];

        let rest = &payload[SSL_REQUEST_LEN..];
        let username = rest
            .iter()
            .position(|&b| b == 0)
            .map(|nul| String::from_utf8_lossy(&rest[..nul]).to_string());

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
        })
    }

    /// Whether this packet asks to switch the connection to TLS
    pub fn is_ssl_request(payload: &[u8]) -> bool {
        payload.len() == SSL_REQUEST_LEN
            && Self::parse(payload)
                .map(|r| r.capability_flags & CLIENT_SSL != 0)
                .unwrap_or(false)
    }

    /// Copy of a response payload with its capability flags replaced
    pub fn with_capabilities(payload: &[u8], capability_flags: u32) -> Bytes {
        let mut buf = BytesMut::from(payload);
        if buf.len() >= 4 {
            buf[0..4].copy_from_slice(&capability_flags.to_le_bytes());
        }
        buf.freeze()
    }

    /// Encode the SSL request sent before upgrading a backend leg
    pub fn encode_ssl_request(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SSL_REQUEST_LEN);
        buf.put_u32_le(self.capability_flags | CLIENT_SSL);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.put_bytes(0, 23);
        buf.freeze()
    }

    /// Encode a full response logging `username` in with an empty password
    pub fn encode_without_password(&self, auth_plugin: &str) -> Bytes {
        let username = self.username.as_deref().unwrap_or_default();
        let mut buf =
            BytesMut::with_capacity(SSL_REQUEST_LEN + username.len() + auth_plugin.len() + 3);
        buf.put_u32_le(self.capability_flags & !CLIENT_SSL);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.put_bytes(0, 23);
        buf.put_slice(username.as_bytes());
        buf.put_u8(0);
        // Zero-length auth response
        buf.put_u8(0);
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_slice(auth_plugin.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 3 || payload[0] != ERR_HEADER {
            return None;
        }

        let error_code = u16::from_le_bytes([payload[1], payload[2]]);
        let rest = &payload[3..];

        let (sql_state, error_message) = if rest.len() >= 6 && rest[0] == b'#' {
            (
                String::from_utf8_lossy(&rest[1..6]).to_string(),
                String::from_utf8_lossy(&rest[6..]).to_string(),
            )
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(rest).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Header of the response to COM_STMT_PREPARE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
}

impl StmtPrepareOk {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 9 || payload[0] != OK_HEADER {
            return None;
        }
        Some(Self {
            statement_id: u32::from_le_bytes(payload[1..5].try_into().ok()?),
            num_columns: u16::from_le_bytes([payload[5], payload[6]]),
            num_params: u16::from_le_bytes([payload[7], payload[8]]),
        })
    }
}

/// Read a length-encoded integer, returning the value and bytes consumed
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        v @ 0..=0xFA => Some((v as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => Some((
            u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64,
            4,
        )),
        0xFE if data.len() >= 9 => Some((u64::from_le_bytes(data[1..9].try_into().ok()?), 9)),
        _ => None,
    }
}

/// Status flags of an OK packet (also the 0xFE-headed OK that ends rows)
pub fn ok_status(payload: &[u8], capabilities: u32) -> Option<u16> {
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Some(0);
    }
    let mut pos = 1;
    for _ in 0..2 {
        let (_, used) = read_lenenc_int(payload.get(pos..)?)?;
        pos += used;
    }
    let bytes = payload.get(pos..pos + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Status flags of a classic EOF packet
pub fn eof_status(payload: &[u8]) -> Option<u16> {
    let bytes = payload.get(3..5)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Check if packet is a classic EOF packet
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Check if packet terminates a row stream under the negotiated capabilities
///
/// With `CLIENT_DEPRECATE_EOF` rows end with an OK packet that carries the
/// EOF header byte.
pub fn is_result_set_end(payload: &[u8], capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        payload.first() == Some(&EOF_HEADER) && payload.len() < super::MAX_PACKET_SIZE
    } else {
        is_eof_packet(payload)
    }
}

/// Status flags of the packet that terminated a row stream
pub fn result_set_end_status(payload: &[u8], capabilities: u32) -> u16 {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        ok_status(payload, capabilities).unwrap_or(0)
    } else {
        eof_status(payload).unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A HandshakeV10 payload as a MySQL 8 server would send it
    pub(crate) fn sample_handshake(capability_flags: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(10);
        buf.extend_from_slice(b"8.0.36\0");
        buf.extend_from_slice(&42u32.to_le_bytes());
        buf.extend_from_slice(b"abcdefgh");
        buf.push(0);
        buf.extend_from_slice(&(capability_flags as u16).to_le_bytes());
        buf.push(0x21);
        buf.extend_from_slice(&0x0002u16.to_le_bytes());
        buf.extend_from_slice(&((capability_flags >> 16) as u16).to_le_bytes());
        buf.push(21);
        buf.extend_from_slice(&[0u8; 10]);
        buf.extend_from_slice(b"ijklmnopqrst\0");
        buf.extend_from_slice(b"caching_sha2_password\0");
        buf
    }

    #[test]
    fn test_parse_initial_handshake() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SSL | CLIENT_PLUGIN_AUTH | CLIENT_DEPRECATE_EOF;
        let hs = InitialHandshake::parse(&sample_handshake(caps)).unwrap();
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.capability_flags, caps);
        assert_eq!(hs.character_set, 0x21);
        assert_eq!(hs.status_flags, 0x0002);
    }

    #[test]
    fn test_rewrite_capabilities_keeps_other_bytes() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SSL | CLIENT_PLUGIN_AUTH;
        let payload = sample_handshake(caps);
        let hs = InitialHandshake::parse(&payload).unwrap();

        let rewritten = hs.with_capabilities(&payload, caps & !CLIENT_SSL);
        assert_eq!(rewritten.len(), payload.len());
        let reparsed = InitialHandshake::parse(&rewritten).unwrap();
        assert_eq!(reparsed.capability_flags, caps & !CLIENT_SSL);
        assert_eq!(reparsed.server_version, "8.0.36");
        assert!(rewritten.ends_with(b"caching_sha2_password\0"));
    }

    #[test]
    fn test_parse_rejects_truncated_handshake() {
        let payload = sample_handshake(CLIENT_PROTOCOL_41);
        assert!(InitialHandshake::parse(&payload[..12]).is_none());
        assert!(InitialHandshake::parse(&[9u8, 0, 0]).is_none());
    }

    #[test]
    fn test_ssl_request_detection() {
        let response = HandshakeResponse {
            capability_flags: CLIENT_PROTOCOL_41,
            max_packet_size: 1 << 24,
            character_set: 0x21,
            username: None,
        };
        let ssl = response.encode_ssl_request();
        assert_eq!(ssl.len(), SSL_REQUEST_LEN);
        assert!(HandshakeResponse::is_ssl_request(&ssl));

        let mut full = ssl.to_vec();
        full.extend_from_slice(b"root\0");
        assert!(!HandshakeResponse::is_ssl_request(&full));
        let parsed = HandshakeResponse::parse(&full).unwrap();
        assert_eq!(parsed.username.as_deref(), Some("root"));
        assert_eq!(parsed.max_packet_size, 1 << 24);

        let plain = HandshakeResponse::with_capabilities(&full, CLIENT_PROTOCOL_41);
        let reparsed = HandshakeResponse::parse(&plain).unwrap();
        assert_eq!(reparsed.capability_flags & CLIENT_SSL, 0);
        assert_eq!(reparsed.username.as_deref(), Some("root"));
    }

    #[test]
    fn test_encode_without_password() {
        let response = HandshakeResponse {
            capability_flags: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH,
            max_packet_size: 1 << 24,
            character_set: 0x21,
            username: Some("monitor".to_string()),
        };
        let payload = response.encode_without_password("mysql_native_password");
        assert!(!HandshakeResponse::is_ssl_request(&payload));
        let parsed = HandshakeResponse::parse(&payload).unwrap();
        assert_eq!(parsed.username.as_deref(), Some("monitor"));
        assert_eq!(parsed.capability_flags, response.capability_flags);
        assert!(payload.ends_with(b"monitor\0\0mysql_native_password\0"));
    }

    #[test]
    fn test_parse_err_packet() {
        let mut payload = vec![0xFF, 0x15, 0x04, b'#'];
        payload.extend_from_slice(b"28000Access denied");
        let err = ErrPacket::parse(&payload).unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_ok_and_eof_status() {
        let ok = [0x00, 0x01, 0xFC, 0x10, 0x27, 0x08, 0x00, 0x00, 0x00];
        assert_eq!(ok_status(&ok, CLIENT_PROTOCOL_41), Some(0x0008));

        let eof = [0xFE, 0x00, 0x00, 0x42, 0x00];
        assert!(is_eof_packet(&eof));
        assert_eq!(eof_status(&eof), Some(0x0042));
        assert!(is_result_set_end(&eof, CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_lenenc_int() {
        assert_eq!(read_lenenc_int(&[0x05]), Some((5, 1)));
        assert_eq!(read_lenenc_int(&[0xFC, 0x10, 0x27]), Some((10000, 3)));
        assert_eq!(read_lenenc_int(&[0xFD, 0x01, 0x00, 0x01]), Some((65537, 4)));
        assert_eq!(read_lenenc_int(&[0xFC, 0x10]), None);
        assert_eq!(read_lenenc_int(&[]), None);
    }

    #[test]
    fn test_stmt_prepare_ok() {
        let payload = [0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        let ok = StmtPrepareOk::parse(&payload).unwrap();
        assert_eq!(ok.statement_id, 7);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 1);
    }
}
