mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Read, parse and validate a TOML config file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations that would only fail later, per connection
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let tls = &config.server.tls;
    if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
        return Err(ConfigError::Invalid(
            "server.tls requires both cert_path and key_path".into(),
        ));
    }

    let mut seen = HashSet::new();
    for ns in &config.namespaces {
        if ns.name.is_empty() {
            return Err(ConfigError::Invalid("namespace name must not be empty".into()));
        }
        if !seen.insert(ns.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate namespace '{}'",
                ns.name
            )));
        }
    }

    if config.server.max_frame_size < 4 {
        return Err(ConfigError::Invalid("server.max_frame_size is too small".into()));
    }
    Ok(())
}
