mod backend;
mod config;
mod errors;
mod health;
mod metrics;
mod namespace;
mod net;
mod protocol;
mod proxy;
mod session;
mod tls;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use health::HealthChecker;
use namespace::NamespaceManager;
use proxy::SqlProxy;
use session::SessionContext;

/// How long shutdown waits for live sessions
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();

    let server_tls = tls::build_server_config(&config.server.tls)?;
    let backend_tls = tls::build_client_config(&config.backend.tls)?;
    info!(
        client_tls = server_tls.is_some(),
        backend_tls = backend_tls.is_some(),
        "TLS configured"
    );

    let namespace_mgr = Arc::new(NamespaceManager::from_config(&config));
    info!(
        namespaces = ?namespace_mgr.namespace_names(),
        default = namespace_mgr.default_namespace(),
        "Namespaces loaded"
    );

    let background = CancellationToken::new();
    let checker = HealthChecker::new(config.health.clone(), namespace_mgr.instances());
    let health_tasks = checker.start(background.child_token());

    if let Some(metrics_addr) = config.metrics.listen_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
                error!(error = %e, "Metrics server stopped");
            }
        });
    }

    let ctx = SessionContext {
        namespace_mgr,
        server_tls,
        backend_tls,
    };
    let proxy = Arc::new(SqlProxy::new(&config, ctx));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Strait MySQL proxy listening");

    let accept_loop = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.run(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    proxy.close(SHUTDOWN_TIMEOUT).await;
    background.cancel();
    if let Err(e) = accept_loop.await {
        warn!(error = %e, "Accept loop ended abnormally");
    }
    for task in health_tasks {
        let _ = task.await;
    }

    info!("Strait stopped");
    Ok(())
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/strait.toml", "strait.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
