//! Periodic backend checks
//!
//! One long-running task per distinct backend. A check dials the backend,
//! logs in as the configured password-less user and quits. Any answer to the
//! login (OK, or an ERR such as access denied) means the server accepts
//! connections; an ERR greeting (e.g. too many connections) or any I/O
//! failure counts as a failed check. Finishing the connection phase keeps
//! checks from counting against the server's `max_connect_errors`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{CheckState, HealthStatus};
use crate::config::HealthCheckConfig;
use crate::metrics::metrics;
use crate::namespace::BackendInstance;
use crate::net::PacketIo;
use crate::protocol::capabilities::{
    CLIENT_LONG_PASSWORD, CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
};
use crate::protocol::command::COM_QUIT;
use crate::protocol::handshake::{AUTH_MORE_DATA_HEADER, EOF_HEADER, FAST_AUTH_OK};
use crate::protocol::{
    is_err_packet, is_ok_packet, ErrPacket, HandshakeResponse, InitialHandshake,
};

/// Capabilities requested by the health check login
const CHECK_CAPS: u32 =
    CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;

/// Upper bound on auth switch and more-data rounds before giving up
const MAX_AUTH_ROUNDS: usize = 4;

/// Error during health check
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Health check timed out")]
    Timeout,
    #[error("Backend refused connection: {0}")]
    Refused(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Drives checks for every backend and publishes the result on the
/// `BackendInstance` routers read from
pub struct HealthChecker {
    config: HealthCheckConfig,
    instances: Vec<Arc<BackendInstance>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, instances: Vec<Arc<BackendInstance>>) -> Self {
        Self { config, instances }
    }

    /// Spawn one check task per backend; tasks end when `shutdown` fires
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Health checks are disabled");
            return Vec::new();
        }

        info!(
            backends = self.instances.len(),
            interval_ms = self.config.check_interval_ms,
            "Starting health checker"
        );
        self.instances
            .iter()
            .map(|inst| self.spawn_check_task(inst.clone(), shutdown.clone()))
            .collect()
    }

    fn spawn_check_task(
        &self,
        instance: Arc<BackendInstance>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let check_interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        let check_timeout = Duration::from_millis(self.config.check_timeout_ms);
        let state = Mutex::new(CheckState::new(self.config.failure_threshold));
        let user = self.config.user.clone();

        tokio::spawn(async move {
            // Stagger the first check across the interval
            let initial_delay =
                rand::thread_rng().gen_range(0..check_interval.as_millis() as u64);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(initial_delay)) => {}
            }

            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(addr = %instance.addr(), "Health check task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = check_backend(instance.addr(), &user, check_timeout).await;
                        apply_result(&instance, &state, result);
                    }
                }
            }
        })
    }
}

/// Record one check outcome and publish status changes
fn apply_result(
    instance: &BackendInstance,
    state: &Mutex<CheckState>,
    result: Result<(), CheckError>,
) {
    let mut state = state.lock();
    match result {
        Ok(()) => {
            metrics().record_health_check(true);
            if state.record_success() {
                info!(addr = %instance.addr(), "Backend is healthy again");
            } else {
                debug!(addr = %instance.addr(), "Health check passed");
            }
        }
        Err(e) => {
            metrics().record_health_check(false);
            if state.record_failure() {
                warn!(
                    addr = %instance.addr(),
                    error = %e,
                    failures = state.consecutive_failures(),
                    "Backend marked unhealthy"
                );
            } else {
                debug!(addr = %instance.addr(), error = %e, "Health check failed");
            }
        }
    }
    instance.set_healthy(state.status() == HealthStatus::Healthy);
}

/// Dial `addr`, log in as `user` and quit, all within `timeout`
pub async fn check_backend(addr: &str, user: &str, timeout: Duration) -> Result<(), CheckError> {
    tokio::time::timeout(timeout, check_inner(addr, user))
        .await
        .map_err(|_| CheckError::Timeout)?
}

async fn check_inner(addr: &str, user: &str) -> Result<(), CheckError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| CheckError::Connection(e.to_string()))?;
    let mut io = PacketIo::new(stream, addr);
    let result = login_and_quit(&mut io, user).await;
    let _ = io.close().await;
    result
}

async fn login_and_quit(io: &mut PacketIo, user: &str) -> Result<(), CheckError> {
    let greeting = io.read_packet().await.map_err(connection_error)?;
    let handshake = match greeting.first() {
        Some(10) => InitialHandshake::parse(&greeting)
            .ok_or_else(|| CheckError::Protocol("malformed handshake".into()))?,
        Some(b) => {
            return Err(match ErrPacket::parse(&greeting) {
                Some(err) => CheckError::Refused(err.error_message),
                None => CheckError::Protocol(format!("protocol version {}", b)),
            })
        }
        None => return Err(CheckError::Protocol("empty greeting".into())),
    };
    if handshake.capability_flags & CLIENT_PROTOCOL_41 == 0 {
        return Err(CheckError::Protocol("server lacks CLIENT_PROTOCOL_41".into()));
    }

    let response = HandshakeResponse {
        capability_flags: CHECK_CAPS & handshake.capability_flags,
        max_packet_size: 1 << 24,
        character_set: handshake.character_set,
        username: Some(user.to_string()),
    };
    io.write_and_flush(response.encode_without_password("mysql_native_password"))
        .await
        .map_err(connection_error)?;

    for _ in 0..MAX_AUTH_ROUNDS {
        let reply = io.read_packet().await.map_err(connection_error)?;
        if is_ok_packet(&reply) {
            io.reset_sequence();
            io.write_and_flush(Bytes::from_static(&[COM_QUIT]))
                .await
                .map_err(connection_error)?;
            return Ok(());
        }
        if is_err_packet(&reply) {
            // The server is up; the check account is just not usable
            if let Some(err) = ErrPacket::parse(&reply) {
                debug!(user = user, error = %err.error_message, "Health check login rejected");
            }
            return Ok(());
        }
        match reply.first() {
            // Auth switch: answer the new method with an empty password too
            Some(&EOF_HEADER) => io
                .write_and_flush(Bytes::new())
                .await
                .map_err(connection_error)?,
            // Fast-auth success; OK follows
            Some(&AUTH_MORE_DATA_HEADER) if reply.len() == 2 && reply[1] == FAST_AUTH_OK => {}
            _ => {
                return Err(CheckError::Protocol(format!(
                    "unexpected login reply 0x{:02x}",
                    reply.first().copied().unwrap_or_default()
                )))
            }
        }
    }
    Err(CheckError::Protocol("login did not finish".into()))
}

fn connection_error(e: crate::net::PacketIoError) -> CheckError {
    CheckError::Connection(e.to_string())
}
