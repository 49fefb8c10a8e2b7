use crate::net::PacketIoError;

/// Errors raised by the backend leg of a session
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to connect to backend {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Timed out connecting to backend {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] PacketIoError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Backend not connected")]
    NotConnected,

    #[error("Connect cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        BackendError::Protocol(reason.into())
    }

    /// Keep TLS handshake failures distinguishable from plain I/O errors
    pub(crate) fn from_upgrade(err: PacketIoError) -> Self {
        match err {
            PacketIoError::Tls(reason) => BackendError::Tls(reason),
            other => BackendError::Io(other),
        }
    }
}
