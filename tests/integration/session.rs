//! Session lifecycle through the proxy

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;
use std::thread;

#[test]
fn test_ping_and_reset() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    conn.ping().expect("PING should succeed");
    conn.query_drop("SET @strait_var = 42").expect("SET should succeed");
    conn.reset().expect("RESET_CONNECTION should succeed");

    let value: Option<Option<i64>> = conn
        .query_first("SELECT @strait_var")
        .expect("SELECT should succeed");
    assert_eq!(value, Some(None));
}

#[test]
fn test_init_db() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    conn.select_db("information_schema")
        .expect("INIT_DB should succeed");
    let db: Option<String> = conn.query_first("SELECT DATABASE()").expect("SELECT should succeed");
    assert_eq!(db.as_deref(), Some("information_schema"));
}

#[test]
fn test_each_client_gets_own_backend_session() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut a = config.raw_conn();
    let mut b = config.raw_conn();

    let id_a: Option<u64> = a.query_first("SELECT CONNECTION_ID()").unwrap();
    let id_b: Option<u64> = b.query_first("SELECT CONNECTION_ID()").unwrap();
    assert_ne!(id_a, id_b);

    a.query_drop("SET @owner = 'a'").unwrap();
    let owner: Option<Option<String>> = b.query_first("SELECT @owner").unwrap();
    assert_eq!(owner, Some(None));
}

#[test]
fn test_concurrent_clients() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let config = config.clone();
            thread::spawn(move || {
                let mut conn = config.raw_conn();
                for _ in 0..20 {
                    let value: Option<i64> = conn
                        .query_first(format!("SELECT {}", i))
                        .expect("SELECT should succeed");
                    assert_eq!(value, Some(i));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread panicked");
    }
}

#[test]
fn test_reconnect_after_quit() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    for _ in 0..5 {
        let mut conn = config.raw_conn();
        conn.ping().expect("PING should succeed");
        drop(conn); // sends COM_QUIT
    }
    let mut conn = config.raw_conn();
    let value: Option<i64> = conn.query_first("SELECT 1").unwrap();
    assert_eq!(value, Some(1));
}
