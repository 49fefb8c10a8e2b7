use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Backend-facing connection settings shared by every namespace
    #[serde(default)]
    pub backend: BackendConfig,
    /// Namespace used when a connection does not name one
    #[serde(default = "default_namespace_name")]
    pub default_namespace: String,
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_namespace_name() -> String {
    "default".to_string()
}

// ============================================================================
// Server (client-facing) Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Largest single frame accepted from a client or backend (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub tls: ServerTlsConfig,
}

fn default_listen_port() -> u16 {
    6000
}

fn default_max_frame_size() -> usize {
    // One full physical packet plus header
    0xFF_FF_FF + 4
}

/// TLS offered to clients
///
/// When enabled the proxy advertises `CLIENT_SSL` in the handshake it relays.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// PEM private key (RSA, PKCS8 or EC)
    pub key_path: Option<PathBuf>,
}

// ============================================================================
// Backend Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Dial timeout for new backend connections (milliseconds)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default)]
    pub tls: BackendTlsConfig,
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            tls: BackendTlsConfig::default(),
        }
    }
}

/// TLS used when the proxy connects to backends
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// CA bundle in PEM format; webpki roots are used when absent
    pub ca_path: Option<PathBuf>,
    /// Accept any backend certificate. Testing only.
    #[serde(default)]
    pub skip_verify: bool,
    /// Name checked against the backend certificate; defaults to the dialed host
    pub server_name: Option<String>,
}

// ============================================================================
// Namespace Configuration
// ============================================================================

/// A routing domain: a named set of interchangeable backends
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    /// Backend addresses (host:port)
    #[serde(default)]
    pub backends: Vec<String>,
}

// ============================================================================
// Health Check Configuration
// ============================================================================

/// Health check configuration for backend instances
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether health checks are enabled
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Interval between checks (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Number of consecutive failures before marking unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Timeout for each health check (milliseconds)
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Password-less account the check logs in as before quitting
    #[serde(default = "default_health_user")]
    pub user: String,
}

fn default_health_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    3000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_check_timeout_ms() -> u64 {
    2000
}

fn default_health_user() -> String {
    "strait_health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            check_interval_ms: default_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            check_timeout_ms: default_check_timeout_ms(),
            user: default_health_user(),
        }
    }
}

// ============================================================================
// Metrics Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Address for the Prometheus endpoint, e.g. "0.0.0.0:9090". Disabled when unset.
    pub listen_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
                max_frame_size: default_max_frame_size(),
                tls: ServerTlsConfig::default(),
            },
            backend: BackendConfig::default(),
            default_namespace: default_namespace_name(),
            namespaces: vec![NamespaceConfig {
                name: default_namespace_name(),
                backends: vec!["127.0.0.1:3306".to_string()],
            }],
            health: HealthCheckConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Address the proxy listens on (host:port)
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0"

[[namespaces]]
name = "default"
backends = ["10.0.0.1:4000"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 6000); // default
        assert_eq!(config.default_namespace, "default");
        assert_eq!(config.namespaces.len(), 1);
        assert_eq!(config.namespaces[0].backends, vec!["10.0.0.1:4000"]);
        assert!(!config.server.tls.enabled);
        assert!(!config.backend.tls.enabled);
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_parse_config_with_tls() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1"
listen_port = 6001

[server.tls]
enabled = true
cert_path = "/etc/strait/server.crt"
key_path = "/etc/strait/server.key"

[backend]
dial_timeout_ms = 1500

[backend.tls]
enabled = true
ca_path = "/etc/strait/ca.crt"
server_name = "db.internal"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_port, 6001);
        assert!(config.server.tls.enabled);
        assert_eq!(
            config.server.tls.cert_path.as_deref(),
            Some(std::path::Path::new("/etc/strait/server.crt"))
        );
        assert_eq!(config.backend.dial_timeout_ms, 1500);
        assert!(config.backend.tls.enabled);
        assert!(!config.backend.tls.skip_verify);
        assert_eq!(config.backend.tls.server_name.as_deref(), Some("db.internal"));
        assert!(config.namespaces.is_empty());
    }

    #[test]
    fn test_parse_config_with_namespaces() {
        let toml = r#"
default_namespace = "tenant_a"

[server]
listen_addr = "127.0.0.1"

[[namespaces]]
name = "tenant_a"
backends = ["db-1:4000", "db-2:4000"]

[[namespaces]]
name = "tenant_b"
backends = ["db-3:4000"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.default_namespace, "tenant_a");
        assert_eq!(config.namespaces.len(), 2);
        assert_eq!(config.namespaces[0].backends.len(), 2);
        assert_eq!(config.namespaces[1].name, "tenant_b");
    }

    #[test]
    fn test_parse_config_with_health_and_metrics() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1"

[health]
enabled = false
check_interval_ms = 10000
failure_threshold = 5
check_timeout_ms = 500
user = "monitor"

[metrics]
listen_addr = "0.0.0.0:9090"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.health.enabled);
        assert_eq!(config.health.check_interval_ms, 10000);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.check_timeout_ms, 500);
        assert_eq!(config.health.user, "monitor");
        assert_eq!(config.metrics.listen_addr.as_deref(), Some("0.0.0.0:9090"));
    }

    #[test]
    fn test_health_check_config_defaults() {
        let health = HealthCheckConfig::default();
        assert!(health.enabled);
        assert_eq!(health.check_interval_ms, 3000);
        assert_eq!(health.failure_threshold, 3);
        assert_eq!(health.check_timeout_ms, 2000);
        assert_eq!(health.user, "strait_health");
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.server.max_frame_size, 0xFF_FF_FF + 4);
        assert_eq!(config.backend.dial_timeout_ms, 5000);
        assert_eq!(config.namespaces.len(), 1);
        assert_eq!(config.namespaces[0].name, config.default_namespace);
    }
}
