/// Errors raised by the framed transport
#[derive(Debug, thiserror::Error)]
pub enum PacketIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid sequence: expected {expected}, got {got}")]
    InvalidSequence { expected: u8, got: u8 },

    #[error("Packet too large: {size} bytes exceeds limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl PacketIoError {
    /// Whether the peer or a local close ended the stream
    pub fn is_disconnect(&self) -> bool {
        match self {
            PacketIoError::ConnectionClosed => true,
            PacketIoError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
