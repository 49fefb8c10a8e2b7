//! Pass-through backend connection
//!
//! `BackendConnManager` dials the routed backend, relays the connection phase
//! between the client and the backend (terminating or originating TLS on
//! either leg as configured) and then forwards commands verbatim. Responses
//! are walked packet by packet only as far as needed to know where each one
//! ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustls::{ClientConfig, ServerConfig};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BackendError, BackendExecutor};
use crate::config::Config;
use crate::namespace::{ConnEventReceiver, RoutableConn};
use crate::net::PacketIo;
use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_SSL};
use crate::protocol::command::{self, *};
use crate::protocol::handshake::{
    read_lenenc_int, AUTH_MORE_DATA_HEADER, ERR_HEADER, FAST_AUTH_OK, LOCAL_INFILE_HEADER,
    OK_HEADER,
};
use crate::protocol::status::{SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_CURSOR_EXISTS};
use crate::protocol::{
    is_err_packet, is_result_set_end, ok_status, result_set_end_status, ErrPacket,
    HandshakeResponse, InitialHandshake, PacketCodec, StmtPrepareOk,
};

/// Per-connection backend settings
#[derive(Debug, Clone)]
pub struct BackendConnOptions {
    pub dial_timeout: Duration,
    pub max_frame_size: usize,
    /// SNI / verification name for backend TLS; the host part of the
    /// address when unset
    pub server_name: Option<String>,
}

impl Default for BackendConnOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BackendConnOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dial_timeout: Duration::from_millis(config.backend.dial_timeout_ms),
            max_frame_size: config.server.max_frame_size,
            server_name: config.backend.tls.server_name.clone(),
        }
    }
}

/// Outcome of relaying an authentication exchange
enum AuthOutcome {
    Accepted,
    Denied(String),
}

pub struct BackendConnManager {
    conn_id: u64,
    options: BackendConnOptions,
    backend_io: Option<PacketIo>,
    addr: Option<String>,
    /// Capabilities shared by the client and the backend
    capability: u32,
    event_receiver: Mutex<Option<Arc<dyn ConnEventReceiver>>>,
    closed: bool,
}

impl BackendConnManager {
    pub fn new(conn_id: u64, options: BackendConnOptions) -> Self {
        Self {
            conn_id,
            options,
            backend_io: None,
            addr: None,
            capability: 0,
            event_receiver: Mutex::new(None),
            closed: false,
        }
    }

    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn capability(&self) -> u32 {
        self.capability
    }

    pub fn is_connected(&self) -> bool {
        self.backend_io.is_some()
    }

    /// Dial and run the connection phase, returning the authenticated
    /// backend transport and the negotiated capabilities
    async fn establish(
        options: &BackendConnOptions,
        addr: &str,
        client_io: &mut PacketIo,
        server_tls: Option<Arc<ServerConfig>>,
        backend_tls: Option<Arc<ClientConfig>>,
    ) -> Result<(PacketIo, u32), BackendError> {
        let stream = match tokio::time::timeout(options.dial_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BackendError::Dial {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(BackendError::Timeout(addr.to_string())),
        };
        let _ = stream.set_nodelay(true);
        let mut backend =
            PacketIo::with_codec(stream, addr, PacketCodec::new(options.max_frame_size));

        let greeting = backend.read_packet().await?;
        if is_err_packet(&greeting) {
            let reason = err_message(&greeting);
            client_io.write_and_flush(greeting).await?;
            return Err(BackendError::protocol(format!(
                "backend refused connection: {}",
                reason
            )));
        }
        let handshake = InitialHandshake::parse(&greeting)
            .ok_or_else(|| BackendError::protocol("invalid initial handshake from backend"))?;
        let backend_caps = handshake.capability_flags;

        // Offer TLS to the client only when we can terminate it
        let offered = if server_tls.is_some() {
            backend_caps | CLIENT_SSL
        } else {
            backend_caps & !CLIENT_SSL
        };
        client_io
            .write_and_flush(handshake.with_capabilities(&greeting, offered))
            .await?;

        let mut response = client_io.read_packet().await?;
        if HandshakeResponse::is_ssl_request(&response) {
            let config = server_tls.ok_or_else(|| {
                BackendError::protocol("client requested TLS but none is configured")
            })?;
            client_io
                .upgrade_to_tls_server(config)
                .await
                .map_err(BackendError::from_upgrade)?;
            response = client_io.read_packet().await?;
        }
        let client_response = HandshakeResponse::parse(&response)
            .ok_or_else(|| BackendError::protocol("invalid handshake response from client"))?;
        let client_caps = client_response.capability_flags;

        let backend_tls = match backend_tls {
            Some(config) if backend_caps & CLIENT_SSL != 0 => Some(config),
            Some(_) => {
                warn!(addr = %addr, "Backend does not support TLS, continuing in plain text");
                None
            }
            None => None,
        };
        let forward_caps = match backend_tls {
            Some(config) => {
                let ssl_request = HandshakeResponse {
                    capability_flags: client_caps & backend_caps,
                    ..client_response
                }
                .encode_ssl_request();
                backend.write_and_flush(ssl_request).await?;

                let server_name = options
                    .server_name
                    .clone()
                    .unwrap_or_else(|| host_of(addr).to_string());
                backend
                    .upgrade_to_tls_client(config, &server_name)
                    .await
                    .map_err(BackendError::from_upgrade)?;
                client_caps | CLIENT_SSL
            }
            None => client_caps & !CLIENT_SSL,
        };
        backend
            .write_and_flush(HandshakeResponse::with_capabilities(&response, forward_caps))
            .await?;

        match relay_auth(&mut backend, client_io).await? {
            AuthOutcome::Accepted => Ok((backend, client_caps & backend_caps)),
            AuthOutcome::Denied(reason) => Err(BackendError::AuthFailed(reason)),
        }
    }
}

impl RoutableConn for BackendConnManager {
    fn connection_id(&self) -> u64 {
        self.conn_id
    }

    fn set_event_receiver(&self, receiver: Arc<dyn ConnEventReceiver>) {
        *self.event_receiver.lock() = Some(receiver);
    }
}

#[async_trait]
impl BackendExecutor for BackendConnManager {
    async fn connect(
        &mut self,
        cancel: &CancellationToken,
        addr: &str,
        client_io: &mut PacketIo,
        server_tls: Option<Arc<ServerConfig>>,
        backend_tls: Option<Arc<ClientConfig>>,
    ) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::NotConnected);
        }
        if self.backend_io.is_some() {
            return Err(BackendError::protocol("backend already connected"));
        }
        self.addr = Some(addr.to_string());

        let (backend_io, capability) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            result = Self::establish(&self.options, addr, client_io, server_tls, backend_tls) => result?,
        };

        debug!(
            conn_id = self.conn_id,
            addr = %addr,
            client_tls = client_io.is_tls(),
            backend_tls = backend_io.is_tls(),
            "Backend connection established"
        );
        self.backend_io = Some(backend_io);
        self.capability = capability;
        Ok(())
    }

    async fn execute_cmd(
        &mut self,
        request: Bytes,
        client_io: &mut PacketIo,
    ) -> Result<(), BackendError> {
        let caps = self.capability;
        let backend = self.backend_io.as_mut().ok_or(BackendError::NotConnected)?;
        let cmd = *request
            .first()
            .ok_or_else(|| BackendError::protocol("empty command packet"))?;
        debug!(conn_id = self.conn_id, cmd = command::name(cmd), "Executing command");

        backend.reset_sequence();
        match backend.write_and_flush(request).await {
            // The backend may hang up first on quit
            Err(e) if cmd == COM_QUIT && e.is_disconnect() => return Ok(()),
            result => result?,
        }

        match cmd {
            COM_QUIT | COM_STMT_CLOSE | COM_STMT_SEND_LONG_DATA => Ok(()),
            // Plain-text statistics, or the EOF/OK/ERR acknowledging an option
            COM_STATISTICS | COM_SET_OPTION => relay_single(backend, client_io).await,
            COM_FIELD_LIST | COM_STMT_FETCH => relay_until_end(backend, client_io, caps).await,
            COM_STMT_PREPARE => relay_prepare(backend, client_io, caps).await,
            // A rejected COM_CHANGE_USER is reported to the client like any ERR
            COM_CHANGE_USER => relay_auth(backend, client_io).await.map(|_| ()),
            _ => relay_results(backend, client_io, caps).await,
        }
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match self.backend_io.take() {
            Some(mut io) => io.close().await.map_err(BackendError::from),
            None => Ok(()),
        };

        if let Some(receiver) = self.event_receiver.get_mut().take() {
            receiver.on_conn_closed(self.addr.as_deref().unwrap_or_default(), self.conn_id);
        }
        result
    }
}

/// Relay an authentication exchange until the backend accepts or rejects it
async fn relay_auth(
    backend: &mut PacketIo,
    client: &mut PacketIo,
) -> Result<AuthOutcome, BackendError> {
    loop {
        let packet = backend.read_packet().await?;
        let header = *packet
            .first()
            .ok_or_else(|| BackendError::protocol("empty authentication packet"))?;
        match header {
            OK_HEADER => {
                client.write_and_flush(packet).await?;
                return Ok(AuthOutcome::Accepted);
            }
            ERR_HEADER => {
                let reason = err_message(&packet);
                client.write_and_flush(packet).await?;
                return Ok(AuthOutcome::Denied(reason));
            }
            _ => {
                // Auth switch, more data or a full-auth request: the client answers.
                // After fast-auth success the backend sends OK on its own.
                let fast_auth_ok = header == AUTH_MORE_DATA_HEADER
                    && packet.len() == 2
                    && packet[1] == FAST_AUTH_OK;
                client.write_and_flush(packet).await?;
                if !fast_auth_ok {
                    let reply = client.read_packet().await?;
                    backend.write_and_flush(reply).await?;
                }
            }
        }
    }
}

/// Relay OK, ERR, LOCAL INFILE or result-set responses, following
/// `SERVER_MORE_RESULTS_EXISTS`
async fn relay_results(
    backend: &mut PacketIo,
    client: &mut PacketIo,
    caps: u32,
) -> Result<(), BackendError> {
    loop {
        let first = backend.read_packet().await?;
        let header = *first
            .first()
            .ok_or_else(|| BackendError::protocol("empty response packet"))?;
        let status = match header {
            OK_HEADER => {
                let status = ok_status(&first, caps).unwrap_or(0);
                client.write_and_flush(first).await?;
                status
            }
            ERR_HEADER => {
                client.write_and_flush(first).await?;
                return Ok(());
            }
            LOCAL_INFILE_HEADER => {
                client.write_and_flush(first).await?;
                relay_local_infile(backend, client).await?;
                // OK or ERR for the load follows
                continue;
            }
            _ => relay_result_set(backend, client, first, caps).await?,
        };
        if status & SERVER_MORE_RESULTS_EXISTS == 0 {
            return Ok(());
        }
    }
}

/// Stream the client's file to the backend up to the terminating empty packet
async fn relay_local_infile(
    backend: &mut PacketIo,
    client: &mut PacketIo,
) -> Result<(), BackendError> {
    loop {
        let chunk = client.read_packet().await?;
        let done = chunk.is_empty();
        backend.write_packet(chunk).await?;
        if done {
            break;
        }
    }
    backend.flush().await?;
    Ok(())
}

/// Relay one result set whose column-count packet is `first`, returning the
/// status flags of its terminator
async fn relay_result_set(
    backend: &mut PacketIo,
    client: &mut PacketIo,
    first: Bytes,
    caps: u32,
) -> Result<u16, BackendError> {
    let (columns, _) =
        read_lenenc_int(&first).ok_or_else(|| BackendError::protocol("invalid column count"))?;
    client.write_packet(first).await?;
    for _ in 0..columns {
        forward_one(backend, client).await?;
    }

    if caps & CLIENT_DEPRECATE_EOF == 0 {
        let eof = backend.read_packet().await?;
        let status = crate::protocol::handshake::eof_status(&eof).unwrap_or(0);
        client.write_packet(eof).await?;
        if status & SERVER_STATUS_CURSOR_EXISTS != 0 {
            // Rows come later through COM_STMT_FETCH
            client.flush().await?;
            return Ok(0);
        }
    }

    loop {
        let row = backend.read_packet().await?;
        if is_err_packet(&row) {
            client.write_and_flush(row).await?;
            return Ok(0);
        }
        if is_result_set_end(&row, caps) {
            let status = result_set_end_status(&row, caps);
            client.write_and_flush(row).await?;
            return Ok(status);
        }
        client.write_packet(row).await?;
    }
}

/// Prepare-OK header, then parameter and column definition blocks
async fn relay_prepare(
    backend: &mut PacketIo,
    client: &mut PacketIo,
    caps: u32,
) -> Result<(), BackendError> {
    let first = backend.read_packet().await?;
    if is_err_packet(&first) {
        client.write_and_flush(first).await?;
        return Ok(());
    }
    let prepare_ok = StmtPrepareOk::parse(&first)
        .ok_or_else(|| BackendError::protocol("invalid COM_STMT_PREPARE response"))?;
    client.write_packet(first).await?;

    for count in [prepare_ok.num_params, prepare_ok.num_columns] {
        if count == 0 {
            continue;
        }
        for _ in 0..count {
            forward_one(backend, client).await?;
        }
        if caps & CLIENT_DEPRECATE_EOF == 0 {
            forward_one(backend, client).await?;
        }
    }
    client.flush().await?;
    Ok(())
}

/// Relay packets until an ERR or the end of a row stream
async fn relay_until_end(
    backend: &mut PacketIo,
    client: &mut PacketIo,
    caps: u32,
) -> Result<(), BackendError> {
    loop {
        let packet = backend.read_packet().await?;
        let done = is_err_packet(&packet) || is_result_set_end(&packet, caps);
        client.write_packet(packet).await?;
        if done {
            break;
        }
    }
    client.flush().await?;
    Ok(())
}

/// Responses that are always exactly one packet
async fn relay_single(backend: &mut PacketIo, client: &mut PacketIo) -> Result<(), BackendError> {
    let packet = backend.read_packet().await?;
    client.write_and_flush(packet).await?;
    Ok(())
}

async fn forward_one(backend: &mut PacketIo, client: &mut PacketIo) -> Result<(), BackendError> {
    let packet = backend.read_packet().await?;
    client.write_packet(packet).await?;
    Ok(())
}

fn err_message(payload: &[u8]) -> String {
    ErrPacket::parse(payload)
        .map(|e| e.error_message)
        .unwrap_or_else(|| "malformed ERR packet".to_string())
}

/// Host part of `host:port` (brackets stripped from IPv6 literals)
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}
