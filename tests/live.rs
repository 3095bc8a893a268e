//! Live tests against a real PostgreSQL server.
//!
//! Configure with the usual `PGHOST`/`PGPORT`/`PGUSER`/`PGDATABASE`/`PGSSLMODE`
//! variables (trust authentication).
//! Run: `cargo test --test live -- --nocapture --ignored`

use qail_pgwire::{params, ConnectOptions, Connection, PgResult, Value};

async fn connect() -> PgResult<Connection> {
    Connection::connect(ConnectOptions::from_env()?).await
}

#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_connect() -> PgResult<()> {
    let conn = connect().await?;
    println!(
        "Connected to PostgreSQL {}",
        conn.server_param("server_version").unwrap_or_default()
    );
    conn.close().await
}

#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_pipelined_round_trips() -> PgResult<()> {
    let conn = connect().await?;

    let queries = (0..32i64).map(|i| {
        let conn = conn.clone();
        tokio::spawn(async move { conn.query("SELECT $1::int8 * 2", params![i]).await })
    });
    let mut results = Vec::new();
    for handle in queries {
        results.push(handle.await.map_err(|e| {
            qail_pgwire::PgError::Connection(format!("query task failed: {}", e))
        })??);
    }

    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.rows[0].get_i64(0), Some(i as i64 * 2));
    }
    println!("Stats: {:?}", conn.cache_stats());
    conn.close().await
}

#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_unknown_types_use_describe() -> PgResult<()> {
    let conn = connect().await?;
    conn.execute(
        "CREATE TEMP TABLE pgwire_live (id int4, tags text[], seen timestamptz)",
        params![],
    )
    .await?;

    let sql = "INSERT INTO pgwire_live VALUES ($1, $2, now())";
    let tags = Value::Array(vec![Value::from("a"), Value::from("b")]);
    assert_eq!(conn.execute(sql, params![7, tags.clone()]).await?, 1);
    assert_eq!(conn.execute(sql, params![8, tags]).await?, 1);

    let result = conn
        .query("SELECT id, tags FROM pgwire_live ORDER BY id", params![])
        .await?;
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get_i32(0), Some(7));
    assert_eq!(
        result.rows[1].get_text_array(1),
        Some(vec!["a".to_string(), "b".to_string()])
    );
    conn.close().await
}

#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_error_keeps_connection() -> PgResult<()> {
    let conn = connect().await?;
    let err = conn
        .query("SELECT * FROM pgwire_missing_table", params![])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("42P01"));

    let result = conn.query("SELECT 1::int4", params![]).await?;
    assert_eq!(result.rows[0].get_i32(0), Some(1));
    conn.close().await
}
