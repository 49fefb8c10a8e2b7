//! Command relay through the proxy

use crate::{assert_query_error, get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TABLE: &str = "it_strait_items";

fn reset_table(conn: &mut impl Queryable) {
    conn.query_drop(format!("DROP TABLE IF EXISTS {}", TABLE))
        .expect("DROP should succeed");
    conn.query_drop(format!(
        "CREATE TABLE {} (id INT PRIMARY KEY, name VARCHAR(64))",
        TABLE
    ))
    .expect("CREATE should succeed");
}

#[test]
fn test_simple_query() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let value: Option<i64> = conn.query_first("SELECT 1").expect("SELECT should succeed");
    assert_eq!(value, Some(1));
}

#[test]
fn test_multi_row_result_set() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let rows: Vec<(i64, String)> = conn
        .query("SELECT 1, 'a' UNION ALL SELECT 2, 'b' UNION ALL SELECT 3, 'c'")
        .expect("SELECT should succeed");
    assert_eq!(
        rows,
        vec![(1, "a".into()), (2, "b".into()), (3, "c".into())]
    );
}

#[test]
fn test_large_result_set() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let payload: Option<String> = conn
        .query_first("SELECT REPEAT('x', 1048576)")
        .expect("SELECT should succeed");
    assert_eq!(payload.map(|s| s.len()), Some(1 << 20));
}

#[test]
fn test_insert_and_select() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    reset_table(&mut conn);

    conn.query_drop(format!(
        "INSERT INTO {} (id, name) VALUES (1, 'one'), (2, 'two')",
        TABLE
    ))
    .expect("INSERT should succeed");
    assert_eq!(conn.affected_rows(), 2);

    let names: Vec<String> = conn
        .query(format!("SELECT name FROM {} ORDER BY id", TABLE))
        .expect("SELECT should succeed");
    assert_eq!(names, vec!["one", "two"]);
}

#[test]
fn test_prepared_statement() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    reset_table(&mut conn);

    let insert = conn
        .prep(format!("INSERT INTO {} (id, name) VALUES (?, ?)", TABLE))
        .expect("PREPARE should succeed");
    for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
        conn.exec_drop(&insert, (id, name))
            .expect("EXECUTE should succeed");
    }
    conn.close(insert).expect("STMT_CLOSE should succeed");

    let name: Option<String> = conn
        .exec_first(format!("SELECT name FROM {} WHERE id = ?", TABLE), (2,))
        .expect("EXECUTE should succeed");
    assert_eq!(name.as_deref(), Some("two"));
}

#[test]
fn test_multi_statement() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    let mut result = conn
        .query_iter("SELECT 1; SELECT 2, 3")
        .expect("multi statement should succeed");

    let mut sets = Vec::new();
    while let Some(set) = result.iter() {
        let rows: Vec<mysql::Row> = set.map(|r| r.expect("row")).collect();
        sets.push(rows.len());
    }
    assert_eq!(sets, vec![1, 1]);
}

#[test]
fn test_query_error_keeps_session() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    // ER_NO_SUCH_TABLE
    assert_query_error(
        conn.query_drop("SELECT * FROM it_strait_missing_table"),
        1146,
    );
    let value: Option<i64> = conn.query_first("SELECT 2").expect("session should survive");
    assert_eq!(value, Some(2));
}

#[test]
fn test_transaction_rollback() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().raw_conn();
    reset_table(&mut conn);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    conn.query_drop(format!("INSERT INTO {} (id, name) VALUES (9, 'tmp')", TABLE))
        .expect("INSERT should succeed");
    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    let count: Option<i64> = conn
        .query_first(format!("SELECT COUNT(*) FROM {}", TABLE))
        .expect("SELECT should succeed");
    assert_eq!(count, Some(0));
}
