// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite plumbing shared by the journal, node status, and verification
//! stores.
//!
//! One database holds all three tables so the pruner's low-water-mark read
//! and its range delete see a single consistent store.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes go through [`execute_with_retry`]:
//! - Automatic retry with exponential backoff
//! - Configurable max retries (default 5)
//!
//! # Why SQLite?
//!
//! - The journal is append/range-delete only and low-write per row
//! - WAL mode gives durability with good performance
//! - In-memory databases make tests fast and hermetic

use crate::config::StorageConfig;
use crate::error::{GeoError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error.
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_storage_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Open (and if needed create) the replication database.
///
/// Creates the schema if it does not exist and returns a connection pool
/// shared by all stores.
pub async fn connect(config: &StorageConfig) -> Result<SqlitePool> {
    let in_memory = config.sqlite_path == ":memory:";
    info!(path = %config.sqlite_path, "Opening replication database");

    let options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| GeoError::Config(format!("Invalid SQLite options: {}", e)))?
    } else {
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| GeoError::Config(format!("Invalid SQLite path: {}", e)))?
                .create_if_missing(true)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        if config.wal_mode {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }
        opts
    };

    let pool = SqlitePoolOptions::new()
        // In-memory databases are per-connection; a single connection keeps
        // every store looking at the same data.
        .max_connections(if in_memory { 1 } else { 4 })
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            replicable_type TEXT NOT NULL,
            event_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            role TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS node_status (
            node_id TEXT PRIMARY KEY,
            cursor_last_event_id INTEGER NOT NULL,
            last_successful_check_at INTEGER NOT NULL,
            healthy INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verification_state (
            replicable_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            state TEXT NOT NULL,
            checksum TEXT,
            failure TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            sync_started_at INTEGER,
            verified_at INTEGER,
            PRIMARY KEY (replicable_type, resource_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_verification_state_state
         ON verification_state (replicable_type, state)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Current time as unix millis, the timestamp representation used across
/// all tables.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
