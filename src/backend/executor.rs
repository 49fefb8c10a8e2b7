use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::{ClientConfig, ServerConfig};
use tokio_util::sync::CancellationToken;

use super::BackendError;
use crate::namespace::RoutableConn;
use crate::net::PacketIo;

/// The backend leg of one session
///
/// Owned by exactly one session. The session routes it (it is the routable
/// connection handed to the router), connects it once, runs commands through
/// it one at a time and closes it on teardown.
#[async_trait]
pub trait BackendExecutor: RoutableConn {
    /// Establish the backend connection for `addr`, running the connection
    /// phase through `client_io`. Aborts with `BackendError::Cancelled` once
    /// `cancel` fires.
    async fn connect(
        &mut self,
        cancel: &CancellationToken,
        addr: &str,
        client_io: &mut PacketIo,
        server_tls: Option<Arc<ServerConfig>>,
        backend_tls: Option<Arc<ClientConfig>>,
    ) -> Result<(), BackendError>;

    /// Run one client command and write the full response to `client_io`
    async fn execute_cmd(
        &mut self,
        request: Bytes,
        client_io: &mut PacketIo,
    ) -> Result<(), BackendError>;

    /// Release the backend connection. Later calls return `Ok(())`.
    async fn close(&mut self) -> Result<(), BackendError>;
}
