// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-resource verification state.
//!
//! Each (replicable_type, resource_id) pair owned by a secondary has one
//! row here. The row moves through a three-state machine:
//!
//! ```text
//!            ┌──────────> verified ──────┐
//!   pending ─┤                           │ (reverification due,
//!            └──────────> failed         │  checksum drift)
//!                 ^                      │
//!                 └──────────────────────┘
//! ```
//!
//! Failed rows keep the failure message and a retry count so operators can
//! see what went wrong and how often. A successful verification clears
//! both. An in-flight sync is not a fourth state: it is `sync_started_at`
//! being set on a pending or failed row, cleared on completion and swept
//! to `failed` after a per-type timeout.

use crate::db::{execute_with_retry, now_millis};
use crate::error::Result;
use sqlx::SqlitePool;
use tracing::debug;

/// Verification state of one replicated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// Known but not yet verified (or re-queued for verification).
    Pending,
    /// Local copy matched the authoritative checksum.
    Verified,
    /// Sync or checksum comparison failed; awaiting retry.
    Failed,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verification row.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub replicable_type: String,
    pub resource_id: String,
    pub state: VerificationState,
    pub checksum: Option<String>,
    pub failure: Option<String>,
    pub retry_count: i64,
    /// Set while a sync for this resource is in flight, unix millis.
    pub sync_started_at: Option<i64>,
    /// Last successful verification, unix millis.
    pub verified_at: Option<i64>,
}

/// Per-type verification counts, used for backlog gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationCounts {
    pub pending: u64,
    pub verified: u64,
    pub failed: u64,
}

/// Store of per-resource verification rows.
#[derive(Clone)]
pub struct VerificationStore {
    pool: SqlitePool,
}

type Row = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    Option<i64>,
    Option<i64>,
);

const SELECT_COLUMNS: &str = "replicable_type, resource_id, state, checksum, failure, \
                              retry_count, sync_started_at, verified_at";

impl VerificationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensure a pending row exists for the resource. Idempotent: an
    /// existing row, in any state, is left untouched.
    pub async fn upsert_pending(&self, replicable_type: &str, resource_id: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("verification_upsert_pending", || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO verification_state (replicable_type, resource_id, state)
                VALUES (?, ?, 'pending')
                "#,
            )
            .bind(replicable_type)
            .bind(resource_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Ensure pending rows exist for many resources with multi-row
    /// inserts. `resource_ids` is chunked to stay under SQLite's bind
    /// limit. Existing rows are left untouched.
    pub async fn upsert_pending_many(
        &self,
        replicable_type: &str,
        resource_ids: &[String],
    ) -> Result<u64> {
        let mut created = 0;
        for chunk in resource_ids.chunks(500) {
            let placeholders = vec!["(?, ?, 'pending')"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO verification_state (replicable_type, resource_id, state) VALUES {}",
                placeholders
            );
            let pool = &self.pool;
            let result = execute_with_retry("verification_upsert_many", || async {
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(replicable_type).bind(id);
                }
                query.execute(pool).await
            })
            .await?;
            created += result.rows_affected();
        }
        Ok(created)
    }

    /// Reset a row to pending, clearing its checksum. Used when a
    /// housekeeping event demands a full resync of the type.
    pub async fn reset_to_pending(&self, replicable_type: &str, resource_id: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("verification_reset_pending", || async {
            sqlx::query(
                r#"
                UPDATE verification_state
                SET state = 'pending', checksum = NULL, sync_started_at = NULL
                WHERE replicable_type = ? AND resource_id = ?
                "#,
            )
            .bind(replicable_type)
            .bind(resource_id)
            .execute(pool)
            .await
        })
        .await?;
        self.upsert_pending(replicable_type, resource_id).await
    }

    pub async fn get(
        &self,
        replicable_type: &str,
        resource_id: &str,
    ) -> Result<Option<VerificationRecord>> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "SELECT {} FROM verification_state WHERE replicable_type = ? AND resource_id = ?",
            SELECT_COLUMNS
        ))
        .bind(replicable_type)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_record))
    }

    /// Stamp `sync_started_at` on a row, marking it in flight.
    pub async fn mark_sync_started(&self, replicable_type: &str, resource_id: &str) -> Result<()> {
        let now = now_millis();
        let pool = &self.pool;
        execute_with_retry("verification_mark_sync_started", || async {
            sqlx::query(
                r#"
                UPDATE verification_state SET sync_started_at = ?
                WHERE replicable_type = ? AND resource_id = ?
                "#,
            )
            .bind(now)
            .bind(replicable_type)
            .bind(resource_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Record a successful verification: store the checksum, clear any
    /// failure and retry count, stamp `verified_at`.
    pub async fn mark_verified(
        &self,
        replicable_type: &str,
        resource_id: &str,
        checksum: &str,
    ) -> Result<()> {
        let now = now_millis();
        let pool = &self.pool;
        execute_with_retry("verification_mark_verified", || async {
            sqlx::query(
                r#"
                UPDATE verification_state
                SET state = 'verified', checksum = ?, failure = NULL,
                    retry_count = 0, sync_started_at = NULL, verified_at = ?
                WHERE replicable_type = ? AND resource_id = ?
                "#,
            )
            .bind(checksum)
            .bind(now)
            .bind(replicable_type)
            .bind(resource_id)
            .execute(pool)
            .await
        })
        .await?;
        debug!(replicable_type, resource_id, "Marked verified");
        Ok(())
    }

    /// Record a failed verification: keep the message, bump the retry
    /// count, clear the in-flight stamp.
    pub async fn mark_failed(
        &self,
        replicable_type: &str,
        resource_id: &str,
        failure: &str,
    ) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("verification_mark_failed", || async {
            sqlx::query(
                r#"
                UPDATE verification_state
                SET state = 'failed', failure = ?, retry_count = retry_count + 1,
                    sync_started_at = NULL
                WHERE replicable_type = ? AND resource_id = ?
                "#,
            )
            .bind(failure)
            .bind(replicable_type)
            .bind(resource_id)
            .execute(pool)
            .await
        })
        .await?;
        debug!(replicable_type, resource_id, failure, "Marked failed");
        Ok(())
    }

    /// Select up to `limit` rows awaiting sync (pending or failed, not in
    /// flight), marking each selected row in flight in the same statement
    /// so concurrent selectors do not double-claim.
    ///
    /// Ordering: never-verified rows first, then rows whose verification
    /// is oldest.
    pub async fn claim_pending_batch(
        &self,
        replicable_type: &str,
        limit: u32,
    ) -> Result<Vec<VerificationRecord>> {
        let now = now_millis();
        let pool = &self.pool;
        let rows: Vec<Row> = execute_with_retry("verification_claim_batch", || async {
            sqlx::query_as(&format!(
                r#"
                UPDATE verification_state SET sync_started_at = ?
                WHERE (replicable_type, resource_id) IN (
                    SELECT replicable_type, resource_id FROM verification_state
                    WHERE replicable_type = ? AND state IN ('pending', 'failed')
                      AND sync_started_at IS NULL
                    ORDER BY verified_at IS NOT NULL, verified_at ASC
                    LIMIT ?
                )
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(now)
            .bind(replicable_type)
            .bind(limit)
            .fetch_all(pool)
            .await
        })
        .await?;
        let mut records: Vec<VerificationRecord> = rows.into_iter().map(row_to_record).collect();
        // RETURNING does not preserve the subquery's ordering
        records.sort_by_key(|r| (r.verified_at.is_some(), r.verified_at));
        Ok(records)
    }

    /// Verified rows due for reverification: `verified_at` older than the
    /// cutoff, oldest first.
    pub async fn verified_batch_due(
        &self,
        replicable_type: &str,
        verified_before: i64,
        limit: u32,
    ) -> Result<Vec<VerificationRecord>> {
        let rows: Vec<Row> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM verification_state
            WHERE replicable_type = ? AND state = 'verified' AND verified_at < ?
            ORDER BY verified_at ASC LIMIT ?
            "#,
            SELECT_COLUMNS
        ))
        .bind(replicable_type)
        .bind(verified_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    /// Count of verified rows due for reverification.
    pub async fn count_verified_due(
        &self,
        replicable_type: &str,
        verified_before: i64,
    ) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM verification_state
            WHERE replicable_type = ? AND state = 'verified' AND verified_at < ?
            "#,
        )
        .bind(replicable_type)
        .bind(verified_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    /// Flip stale in-flight rows to failed. A row is stale when its
    /// `sync_started_at` is older than `started_before`. Returns the
    /// number of rows swept.
    pub async fn fail_timed_out(&self, replicable_type: &str, started_before: i64) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry("verification_fail_timed_out", || async {
            sqlx::query(
                r#"
                UPDATE verification_state
                SET state = 'failed', failure = 'sync timed out',
                    retry_count = retry_count + 1, sync_started_at = NULL
                WHERE replicable_type = ? AND sync_started_at IS NOT NULL
                  AND sync_started_at < ?
                "#,
            )
            .bind(replicable_type)
            .bind(started_before)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// All resource ids known for a type, in id order.
    pub async fn resource_ids(&self, replicable_type: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT resource_id FROM verification_state WHERE replicable_type = ? ORDER BY resource_id",
        )
        .bind(replicable_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Remove the row for a deleted resource.
    pub async fn delete(&self, replicable_type: &str, resource_id: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("verification_delete", || async {
            sqlx::query(
                "DELETE FROM verification_state WHERE replicable_type = ? AND resource_id = ?",
            )
            .bind(replicable_type)
            .bind(resource_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Remove rows for resources no longer in the authoritative scope.
    /// `resource_ids` is chunked to stay under SQLite's bind limit.
    pub async fn delete_many(&self, replicable_type: &str, resource_ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for chunk in resource_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM verification_state WHERE replicable_type = ? AND resource_id IN ({})",
                placeholders
            );
            let pool = &self.pool;
            let result = execute_with_retry("verification_delete_many", || async {
                let mut query = sqlx::query(&sql).bind(replicable_type);
                for id in chunk {
                    query = query.bind(id);
                }
                query.execute(pool).await
            })
            .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Per-state counts for one type.
    pub async fn counts(&self, replicable_type: &str) -> Result<VerificationCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT state, COUNT(*) FROM verification_state
            WHERE replicable_type = ? GROUP BY state
            "#,
        )
        .bind(replicable_type)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = VerificationCounts::default();
        for (state, n) in rows {
            match state.as_str() {
                "pending" => counts.pending = n as u64,
                "verified" => counts.verified = n as u64,
                "failed" => counts.failed = n as u64,
                _ => {}
            }
        }
        Ok(counts)
    }
}

fn row_to_record(row: Row) -> VerificationRecord {
    let (replicable_type, resource_id, state, checksum, failure, retry_count, sync_started_at, verified_at) =
        row;
    VerificationRecord {
        replicable_type,
        resource_id,
        // Unknown states cannot appear: every writer goes through this module
        state: VerificationState::parse(&state).unwrap_or(VerificationState::Failed),
        checksum,
        failure,
        retry_count,
        sync_started_at,
        verified_at,
    }
}
