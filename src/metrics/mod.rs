//! Prometheus metrics for the strait proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;
use tracing::warn;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Proxy metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,
    /// Lifetime of finished sessions
    pub session_duration_seconds: Histogram,

    // Session failures
    /// Sessions that failed during routing or backend connect
    pub handshake_errors: IntCounter,
    /// Relay loops that ended with an error, by kind
    pub relay_failures_total: IntCounterVec,

    // Routing metrics
    /// Connections routed, by backend address
    pub routes_total: IntCounterVec,

    // Health check metrics
    /// Health checks by result
    pub health_check_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "strait_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "strait_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "strait_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let session_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "strait_session_duration_seconds",
                "Client session lifetime in seconds",
            )
            .buckets(vec![
                0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0,
            ]),
        )
        .unwrap();

        let handshake_errors = IntCounter::new(
            "strait_handshake_errors_total",
            "Total number of sessions that failed to reach a backend",
        )
        .unwrap();

        let relay_failures_total = IntCounterVec::new(
            Opts::new(
                "strait_relay_failures_total",
                "Total number of relay loops ended by an error",
            ),
            &["kind"], // framing, command
        )
        .unwrap();

        let routes_total = IntCounterVec::new(
            Opts::new(
                "strait_routes_total",
                "Total number of connections routed by backend",
            ),
            &["backend"], // "none" when no backend was available
        )
        .unwrap();

        let health_check_total = IntCounterVec::new(
            Opts::new(
                "strait_health_check_total",
                "Total number of health checks by result",
            ),
            &["result"], // success, failure
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(session_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(handshake_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(relay_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(routes_total.clone())).unwrap();
        registry
            .register(Box::new(health_check_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            session_duration_seconds,
            handshake_errors,
            relay_failures_total,
            routes_total,
            health_check_total,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed after `duration_secs`
    pub fn record_connection_closed(&self, duration_secs: f64) {
        self.connections_active.dec();
        self.connections_closed.inc();
        self.session_duration_seconds.observe(duration_secs);
    }

    /// Record a relay loop that ended with an error
    pub fn record_relay_failure(&self, kind: &str) {
        self.relay_failures_total.with_label_values(&[kind]).inc();
    }

    /// Record route decision
    pub fn record_route(&self, backend: &str) {
        self.routes_total.with_label_values(&[backend]).inc();
    }

    /// Record a health check result
    pub fn record_health_check(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.health_check_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{header, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut resp = Response::new(Full::new(body.into()));
        *resp.status_mut() = status;
        resp
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let mut resp = response(StatusCode::OK, metrics().gather());
                resp.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                Ok(resp)
            }
            "/health" => Ok(response(StatusCode::OK, "OK")),
            _ => Ok(response(StatusCode::NOT_FOUND, "Not Found")),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
