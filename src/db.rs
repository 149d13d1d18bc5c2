//! Database pool setup and schema bootstrap.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

const MAX_CONNECTIONS: u32 = 5;

/// Statements are idempotent so startup can run them unconditionally, the
/// same way the original service ensured its indexes on every boot.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS objects (
        id TEXT PRIMARY KEY,
        identity TEXT NOT NULL,
        space_id TEXT NOT NULL,
        object_id TEXT NOT NULL,
        uri TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER,
        active_publish_id TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_objects_owner
        ON objects (identity, space_id, object_id)",
    "CREATE TABLE IF NOT EXISTS publishes (
        id TEXT PRIMARY KEY,
        object_id TEXT NOT NULL,
        status INTEGER NOT NULL,
        version TEXT NOT NULL,
        upload_key TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_publishes_status ON publishes (status)",
];

/// Opens the pool and brings the schema up to date.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .context("connecting to database")?;
    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        debug!("schema: {}", stmt.split_whitespace().take(6).collect::<Vec<_>>().join(" "));
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

/// An isolated in-memory database, one schema-initialized pool per call.
///
/// A single connection, because every `:memory:` connection is its own
/// database.
#[cfg(test)]
pub async fn connect_for_tests() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").expect("valid url");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("in-memory database");
    init_schema(&pool).await.expect("schema");
    pool
}
