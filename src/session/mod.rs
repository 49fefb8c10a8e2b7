mod state;

pub use state::{SessionState, StateTracker};

use std::cell::OnceCell;
use std::sync::Arc;

use prometheus::IntCounter;
use rustls::{ClientConfig, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendError, BackendExecutor};
use crate::errors::ErrorCollection;
use crate::metrics::metrics;
use crate::namespace::{Namespace, NamespaceManager, RouterError};
use crate::net::{CloseHandle, PacketIo, PacketIoError};
use crate::protocol::command::{self, COM_QUIT};

/// Read-only state shared by every session, built once at start-up
#[derive(Clone)]
pub struct SessionContext {
    pub namespace_mgr: Arc<NamespaceManager>,
    /// Offered to clients that send an SSL request
    pub server_tls: Option<Arc<ServerConfig>>,
    /// Used to upgrade backend connections
    pub backend_tls: Option<Arc<ClientConfig>>,
}

/// One proxied client connection
///
/// Owns the client transport and the backend executor for its whole life:
/// `run` routes, connects and relays commands until the client quits or a
/// failure ends the session; `close` then releases both sides.
pub struct ClientConnection<E: BackendExecutor> {
    conn_id: u64,
    remote_addr: String,
    server_tls: Option<Arc<ServerConfig>>,
    backend_tls: Option<Arc<ClientConfig>>,
    pkt: PacketIo,
    namespace_mgr: Arc<NamespaceManager>,
    /// Resolved once during routing
    namespace: OnceCell<Arc<Namespace>>,
    conn_mgr: E,
    handshake_errors: IntCounter,
    state: StateTracker,
}

impl<E: BackendExecutor> ClientConnection<E> {
    pub fn new(conn_id: u64, pkt: PacketIo, ctx: &SessionContext, conn_mgr: E) -> Self {
        Self {
            conn_id,
            remote_addr: pkt.remote_addr().to_string(),
            server_tls: ctx.server_tls.clone(),
            backend_tls: ctx.backend_tls.clone(),
            pkt,
            namespace_mgr: ctx.namespace_mgr.clone(),
            namespace: OnceCell::new(),
            conn_mgr,
            handshake_errors: metrics().handshake_errors.clone(),
            state: StateTracker::new(),
        }
    }

    /// Count setup failures on `counter` instead of the process-wide metric
    pub fn with_handshake_counter(mut self, counter: IntCounter) -> Self {
        self.handshake_errors = counter;
        self
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn state_history(&self) -> &[SessionState] {
        self.state.history()
    }

    pub fn namespace(&self) -> Option<&Arc<Namespace>> {
        self.namespace.get()
    }

    /// Handle that interrupts the relay loop by closing the client transport
    pub fn close_handle(&self) -> CloseHandle {
        self.pkt.close_handle()
    }

    /// Route, connect and relay until the session ends
    ///
    /// Returns `Ok(())` when the client quit cleanly. On return the session
    /// is `Closing`; call `close` to release its resources.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.state.transition(SessionState::Routing)?;
        let addr = match self.route(cancel) {
            Ok(addr) => addr,
            Err(e) => return self.fail_setup(e),
        };

        self.state.transition(SessionState::Connecting)?;
        if let Err(e) = self.connect_backend(cancel, &addr).await {
            return self.fail_setup(e);
        }

        self.state.transition(SessionState::Relaying)?;
        debug!(
            conn_id = self.conn_id,
            remote_addr = %self.remote_addr,
            backend = %addr,
            "Session established"
        );

        let result = self.process_msg().await;
        if let Err(e) = &result {
            metrics().record_relay_failure(e.kind());
            if e.is_disconnect() {
                debug!(conn_id = self.conn_id, remote_addr = %self.remote_addr, error = %e, "Client disconnected");
            } else {
                info!(conn_id = self.conn_id, remote_addr = %self.remote_addr, error = %e, "Process message fails");
            }
        }
        self.state.transition(SessionState::Closing)?;
        result
    }

    /// Resolve the default namespace and let its router pick a backend
    fn route(&self, cancel: &CancellationToken) -> Result<String, SetupError> {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled);
        }
        let resolved = self
            .namespace_mgr
            .get_namespace("")
            .ok_or(SetupError::NamespaceNotFound)?;
        let namespace = self.namespace.get_or_init(|| resolved);
        Ok(namespace.router().route(&self.conn_mgr)?)
    }

    async fn connect_backend(
        &mut self,
        cancel: &CancellationToken,
        addr: &str,
    ) -> Result<(), SetupError> {
        let server_tls = self.server_tls.clone();
        let backend_tls = self.backend_tls.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SetupError::Cancelled),
            result = self.conn_mgr.connect(cancel, addr, &mut self.pkt, server_tls, backend_tls) => {
                result.map_err(|e| match e {
                    BackendError::Cancelled => SetupError::Cancelled,
                    e => SetupError::Connect(e),
                })
            }
        }
    }

    fn fail_setup(&mut self, e: SetupError) -> Result<(), SessionError> {
        self.handshake_errors.inc();
        info!(
            conn_id = self.conn_id,
            remote_addr = %self.remote_addr,
            error = %e,
            "New connection fails"
        );
        self.state.transition(SessionState::Closing)?;
        Err(SessionError::Setup(e))
    }

    /// Relay client commands one at a time until `COM_QUIT` or a failure
    async fn process_msg(&mut self) -> Result<(), SessionError> {
        loop {
            self.pkt.reset_sequence();
            let request = self.pkt.read_packet().await.map_err(SessionError::Framing)?;
            let cmd = *request.first().ok_or_else(|| {
                SessionError::Framing(PacketIoError::Protocol("empty command packet".into()))
            })?;

            self.conn_mgr
                .execute_cmd(request, &mut self.pkt)
                .await
                .map_err(SessionError::CommandExecution)?;

            if cmd == COM_QUIT {
                debug!(conn_id = self.conn_id, cmd = command::name(cmd), "Client quit");
                return Ok(());
            }
        }
    }

    /// Release the client transport and the backend executor
    ///
    /// Both are always attempted and every failure is reported. Closing a
    /// closed session is a no-op.
    pub async fn close(&mut self) -> Result<(), CloseError> {
        let state = self.state.current();
        if state.is_terminal() {
            return Ok(());
        }
        // Every live state may move to Closing
        if state != SessionState::Closing {
            let _ = self.state.transition(SessionState::Closing);
        }

        let mut errors = CloseError::new("close client connection");
        errors.collect(self.pkt.close().await.map_err(CloseCause::Transport));
        errors.collect(self.conn_mgr.close().await.map_err(CloseCause::Backend));
        let _ = self.state.transition(SessionState::Closed);

        errors.into_result()
    }
}

/// Failure before the relay loop started
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Namespace not found")]
    NamespaceNotFound,

    #[error("Routing failed: {0}")]
    Route(#[from] RouterError),

    #[error("Backend connect failed: {0}")]
    Connect(BackendError),

    #[error("Setup cancelled")]
    Cancelled,
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session setup failed: {0}")]
    Setup(SetupError),

    #[error("Framing error: {0}")]
    Framing(PacketIoError),

    #[error("Command execution failed: {0}")]
    CommandExecution(BackendError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionError {
    /// Label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Setup(_) => "setup",
            SessionError::Framing(_) => "framing",
            SessionError::CommandExecution(_) => "command",
            SessionError::InvalidTransition { .. } => "state",
        }
    }

    /// Whether the session ended because a peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Framing(e) => e.is_disconnect(),
            SessionError::CommandExecution(BackendError::Io(e)) => e.is_disconnect(),
            _ => false,
        }
    }
}

/// One failed release during teardown
#[derive(Debug, thiserror::Error)]
pub enum CloseCause {
    #[error("client transport: {0}")]
    Transport(PacketIoError),

    #[error("backend: {0}")]
    Backend(BackendError),
}

pub type CloseError = ErrorCollection<CloseCause>;
