//! Backend selection for new connections
//!
//! A router picks the backend a connection should use. The selected
//! connection is handed a `ConnEventReceiver` so that the router's load view
//! is updated when the connection goes away.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::metrics::metrics;

/// Receives lifecycle events from routed connections
pub trait ConnEventReceiver: Send + Sync {
    /// The connection `conn_id` previously routed to `addr` was closed
    fn on_conn_closed(&self, addr: &str, conn_id: u64);
}

/// A connection that can be routed (the backend executor of a session)
pub trait RoutableConn: Send {
    fn connection_id(&self) -> u64;

    /// Called by the router once a backend has been selected
    fn set_event_receiver(&self, receiver: Arc<dyn ConnEventReceiver>);
}

/// Selects a backend address for a connection. Must be safe to call
/// concurrently from many sessions.
pub trait Router: Send + Sync {
    fn route(&self, conn: &dyn RoutableConn) -> Result<String, RouterError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No available backend in namespace '{0}'")]
    NoBackend(String),
}

/// One physical backend as seen by routers and the health checker
#[derive(Debug)]
pub struct BackendInstance {
    addr: String,
    healthy: AtomicBool,
    connections: AtomicUsize,
}

impl BackendInstance {
    /// New instances are considered healthy until a health check says otherwise
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            healthy: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Live connections currently routed here
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Connection bookkeeping shared between a router and the connections it routed
struct RouteTable {
    namespace: String,
    instances: Vec<Arc<BackendInstance>>,
    /// conn_id -> index into `instances`
    routed: DashMap<u64, usize>,
}

impl ConnEventReceiver for RouteTable {
    fn on_conn_closed(&self, addr: &str, conn_id: u64) {
        // Removal makes repeated notifications harmless
        if let Some((_, idx)) = self.routed.remove(&conn_id) {
            self.instances[idx].release();
            debug!(
                namespace = %self.namespace,
                addr = %addr,
                conn_id = conn_id,
                "Connection released from backend"
            );
        }
    }
}

/// Least-connections router over the healthy backends of a namespace
///
/// Ties are broken round-robin so equally loaded backends share new
/// connections evenly.
pub struct BalancedRouter {
    table: Arc<RouteTable>,
    cursor: AtomicUsize,
}

impl BalancedRouter {
    pub fn new(namespace: impl Into<String>, instances: Vec<Arc<BackendInstance>>) -> Self {
        Self {
            table: Arc::new(RouteTable {
                namespace: namespace.into(),
                instances,
                routed: DashMap::new(),
            }),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn instances(&self) -> &[Arc<BackendInstance>] {
        &self.table.instances
    }

    fn select(&self) -> Option<usize> {
        let instances = &self.table.instances;
        if instances.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
        let mut best: Option<(usize, usize)> = None;
        for offset in 0..instances.len() {
            let idx = (start + offset) % instances.len();
            let inst = &instances[idx];
            if !inst.is_healthy() {
                continue;
            }
            let load = inst.connections();
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((idx, load));
            }
        }
        best.map(|(idx, _)| idx)
    }
}

impl Router for BalancedRouter {
    fn route(&self, conn: &dyn RoutableConn) -> Result<String, RouterError> {
        let idx = self.select().ok_or_else(|| {
            metrics().record_route("none");
            RouterError::NoBackend(self.table.namespace.clone())
        })?;

        let inst = &self.table.instances[idx];
        inst.acquire();
        self.table.routed.insert(conn.connection_id(), idx);
        conn.set_event_receiver(self.table.clone());

        metrics().record_route(inst.addr());
        debug!(
            namespace = %self.table.namespace,
            addr = %inst.addr(),
            conn_id = conn.connection_id(),
            load = inst.connections(),
            "Routed connection"
        );
        Ok(inst.addr().to_string())
    }
}
