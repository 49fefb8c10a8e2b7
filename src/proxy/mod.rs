//! Client-facing listener
//!
//! `SqlProxy` accepts client connections and runs one `ClientConnection`
//! task per connection. It remembers the close handle of every live session
//! so that shutdown can interrupt relay loops blocked on client reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConnManager, BackendConnOptions};
use crate::config::Config;
use crate::metrics::metrics;
use crate::net::{AsyncStream, CloseHandle, PacketIo};
use crate::protocol::PacketCodec;
use crate::session::{ClientConnection, SessionContext};

pub struct SqlProxy {
    ctx: SessionContext,
    backend_options: BackendConnOptions,
    max_frame_size: usize,
    conn_counter: AtomicU64,
    /// Live sessions by connection id
    clients: Arc<DashMap<u64, CloseHandle>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SqlProxy {
    pub fn new(config: &Config, ctx: SessionContext) -> Self {
        Self {
            ctx,
            backend_options: BackendConnOptions::from_config(config),
            max_frame_size: config.server.max_frame_size,
            conn_counter: AtomicU64::new(1),
            clients: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.clients.len()
    }

    /// Accept connections until `close` is called
    pub async fn run(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Stopped accepting connections");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let _ = stream.set_nodelay(true);
                        self.on_conn(stream, peer_addr.to_string());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }

    /// Start a session for an accepted connection
    pub fn on_conn<S>(&self, stream: S, remote_addr: String)
    where
        S: AsyncStream + 'static,
    {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        let codec = PacketCodec::new(self.max_frame_size);
        let pkt = PacketIo::with_codec(stream, remote_addr, codec);
        let executor = BackendConnManager::new(conn_id, self.backend_options.clone());
        let mut conn = ClientConnection::new(conn_id, pkt, &self.ctx, executor);

        debug!(conn_id = conn_id, remote_addr = %conn.remote_addr(), "New connection");
        metrics().record_connection_accepted();
        self.clients.insert(conn_id, conn.close_handle());

        let clients = self.clients.clone();
        let cancel = self.shutdown.child_token();
        self.tasks.spawn(async move {
            let started = Instant::now();
            // Failures are logged and counted by the session itself
            let _ = conn.run(&cancel).await;
            if let Err(e) = conn.close().await {
                for cause in e.errors() {
                    warn!(
                        conn_id = conn_id,
                        context = e.context(),
                        error = %cause,
                        "Failed to close connection"
                    );
                }
            }
            clients.remove(&conn_id);
            metrics().record_connection_closed(started.elapsed().as_secs_f64());
        });
    }

    /// Stop accepting, interrupt every live session and wait up to `timeout`
    /// for their tasks to finish
    pub async fn close(&self, timeout: Duration) {
        self.shutdown.cancel();
        for client in self.clients.iter() {
            client.value().close();
        }
        info!(sessions = self.clients.len(), "Closing client connections");

        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Timed out waiting for sessions to finish"
            );
        }
    }
}
