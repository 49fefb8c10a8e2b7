//! Integration test entry point
//!
//! These tests talk to a running strait instance in front of a real MySQL
//! server. Run with: STRAIT_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - STRAIT_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - STRAIT_TEST_PROXY_HOST: Proxy host (default: 127.0.0.1)
//! - STRAIT_TEST_PROXY_PORT: Proxy port (default: 6000)
//! - STRAIT_TEST_PROXY_USER: MySQL user passed through the proxy (default: root)
//! - STRAIT_TEST_PROXY_PASS: MySQL password (default: empty)
//! - STRAIT_TEST_PROXY_DB: Database to select on connect (default: test)

mod passthrough;
mod session;

use mysql::{Conn, Error as MySqlError, Opts, OptsBuilder, Pool, PooledConn};
use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("STRAIT_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set STRAIT_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("STRAIT_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("STRAIT_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6000),
        user: env::var("STRAIT_TEST_PROXY_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("STRAIT_TEST_PROXY_PASS").unwrap_or_default(),
        database: env::var("STRAIT_TEST_PROXY_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn opts(&self) -> Opts {
        OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .db_name(Some(&self.database))
            .into()
    }

    /// Create a connection pool to the proxy
    pub fn pool(&self) -> Pool {
        Pool::new(self.opts()).expect("Failed to create connection pool")
    }

    /// Get a pooled connection to the proxy
    pub fn conn(&self) -> PooledConn {
        self.pool().get_conn().expect("Failed to get connection")
    }

    /// Open a dedicated, unpooled connection to the proxy
    pub fn raw_conn(&self) -> Conn {
        Conn::new(self.opts()).expect("Failed to connect")
    }
}

/// Assert that a query result is a MySQL error with given code
pub fn assert_query_error<T: std::fmt::Debug>(result: Result<T, MySqlError>, expected_code: u16) {
    match result {
        Ok(v) => panic!("Expected MySQL error {}, but got: {:?}", expected_code, v),
        Err(MySqlError::MySqlError(ref e)) => {
            assert_eq!(
                e.code, expected_code,
                "Expected error code {}, got {}. Message: {}",
                expected_code, e.code, e.message
            );
        }
        Err(e) => panic!(
            "Expected MySQL error {}, got different error: {:?}",
            expected_code, e
        ),
    }
}
