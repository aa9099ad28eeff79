// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only event journal.
//!
//! The single source of truth for "what changed". Events are appended by
//! publishers on the primary and range-deleted by the pruner; nothing else
//! mutates them. Ids come from SQLite AUTOINCREMENT, which guarantees
//! strictly increasing, never-reused ids even across deletes.
//!
//! # Journal Semantics
//!
//! ```text
//! append(event) → id N          (atomic: fully written or storage error)
//! events_after(cursor, batch)   (consumers pull from cursor, exclusive)
//! prune_up_to(low_water_mark)   (single bounded range delete, pruner only)
//! ```

use crate::db::{execute_with_retry, now_millis};
use crate::error::{GeoError, Result};
use crate::event::{Event, EventKind};
use sqlx::SqlitePool;
use tracing::debug;

/// Durable append-only store of replication events.
#[derive(Clone)]
pub struct EventJournal {
    pool: SqlitePool,
}

impl EventJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event. Atomic: either the full row is written and the
    /// assigned [`Event`] is returned, or a storage error is raised.
    pub async fn append(
        &self,
        replicable_type: &str,
        event_name: EventKind,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> Result<Event> {
        let created_at = now_millis();
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| GeoError::Internal(format!("Unserializable payload: {}", e)))?;

        let pool = &self.pool;
        let result = execute_with_retry("journal_append", || async {
            sqlx::query(
                r#"
                INSERT INTO events (replicable_type, event_name, payload, correlation_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(replicable_type)
            .bind(event_name.as_str())
            .bind(&payload_json)
            .bind(correlation_id)
            .bind(created_at)
            .execute(pool)
            .await
        })
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            event_id = id,
            replicable_type,
            event_name = %event_name,
            correlation_id,
            "Appended event"
        );
        crate::metrics::record_event_published(replicable_type, event_name.as_str());

        Ok(Event {
            id,
            replicable_type: replicable_type.to_string(),
            event_name,
            payload,
            correlation_id: correlation_id.to_string(),
            created_at,
        })
    }

    /// Highest event id currently in the journal, or `None` when empty.
    pub async fn max_id(&self) -> Result<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Number of events currently retained.
    pub async fn len(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Fetch up to `limit` events with `id > cursor`, in id order.
    ///
    /// The journal preserves total id order; consumers may still process
    /// the returned batch out of order (see crate docs on idempotency).
    pub async fn events_after(&self, cursor: i64, limit: u32) -> Result<Vec<Event>> {
        let rows: Vec<(i64, String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, replicable_type, event_name, payload, correlation_id, created_at
            FROM events WHERE id > ? ORDER BY id ASC LIMIT ?
            "#,
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    /// Fetch a single event by id.
    pub async fn get(&self, id: i64) -> Result<Option<Event>> {
        let row: Option<(i64, String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, replicable_type, event_name, payload, correlation_id, created_at
            FROM events WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_event).transpose()
    }

    /// Delete all events with `id <= low_water_mark` as one bounded range
    /// delete. Returns the number of deleted rows. Pruner use only.
    pub async fn prune_up_to(&self, low_water_mark: i64) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry("journal_prune", || async {
            sqlx::query("DELETE FROM events WHERE id <= ?")
                .bind(low_water_mark)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete every retained event. Used when no secondaries exist: there
    /// is no one left to deliver to.
    pub async fn prune_all(&self) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry("journal_prune_all", || async {
            sqlx::query("DELETE FROM events").execute(pool).await
        })
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_event(row: (i64, String, String, String, String, i64)) -> Result<Event> {
    let (id, replicable_type, event_name, payload, correlation_id, created_at) = row;
    let event_name = EventKind::parse(&event_name)
        .ok_or_else(|| GeoError::Internal(format!("Unknown event name in journal: {}", event_name)))?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| GeoError::Internal(format!("Corrupt payload for event {}: {}", id, e)))?;
    Ok(Event {
        id,
        replicable_type,
        event_name,
        payload,
        correlation_id,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::event::resource_payload;

    async fn journal() -> EventJournal {
        let pool = crate::db::connect(&StorageConfig::in_memory()).await.unwrap();
        EventJournal::new(pool)
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let journal = journal().await;

        let e1 = journal
            .append("snippets", EventKind::Created, resource_payload("a"), "c-1")
            .await
            .unwrap();
        let e2 = journal
            .append("snippets", EventKind::Updated, resource_payload("a"), "c-2")
            .await
            .unwrap();
        let e3 = journal
            .append("uploads", EventKind::Deleted, resource_payload("b"), "c-3")
            .await
            .unwrap();

        assert!(e1.id < e2.id);
        assert!(e2.id < e3.id);
        assert_eq!(journal.max_id().await.unwrap(), Some(e3.id));
        assert_eq!(journal.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_prune() {
        let journal = journal().await;

        for i in 0..3 {
            journal
                .append(
                    "snippets",
                    EventKind::Created,
                    resource_payload(&format!("r{}", i)),
                    "c",
                )
                .await
                .unwrap();
        }
        let max_before = journal.max_id().await.unwrap().unwrap();

        journal.prune_all().await.unwrap();
        assert!(journal.is_empty().await.unwrap());

        let next = journal
            .append("snippets", EventKind::Created, resource_payload("r9"), "c")
            .await
            .unwrap();
        // AUTOINCREMENT: never reuse ids, even after deleting everything
        assert!(next.id > max_before);
    }

    #[tokio::test]
    async fn test_events_after_cursor() {
        let journal = journal().await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let e = journal
                .append(
                    "snippets",
                    EventKind::Updated,
                    resource_payload(&format!("r{}", i)),
                    "c",
                )
                .await
                .unwrap();
            ids.push(e.id);
        }

        let batch = journal.events_after(ids[1], 10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].id, ids[2]);
        assert_eq!(batch[2].id, ids[4]);

        // Limit is respected
        let batch = journal.events_after(0, 2).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_up_to_is_bounded_range() {
        let journal = journal().await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let e = journal
                .append(
                    "snippets",
                    EventKind::Created,
                    resource_payload(&format!("r{}", i)),
                    "c",
                )
                .await
                .unwrap();
            ids.push(e.id);
        }

        let deleted = journal.prune_up_to(ids[2]).await.unwrap();
        assert_eq!(deleted, 3);

        let remaining = journal.events_after(0, 10).await.unwrap();
        let remaining_ids: Vec<i64> = remaining.iter().map(|e| e.id).collect();
        assert_eq!(remaining_ids, vec![ids[3], ids[4]]);
    }

    #[tokio::test]
    async fn test_prune_up_to_idempotent() {
        let journal = journal().await;

        let e = journal
            .append("snippets", EventKind::Created, resource_payload("a"), "c")
            .await
            .unwrap();

        assert_eq!(journal.prune_up_to(e.id).await.unwrap(), 1);
        // Re-running the same decision deletes nothing further
        assert_eq!(journal.prune_up_to(e.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_event_roundtrip() {
        let journal = journal().await;

        let appended = journal
            .append(
                "uploads",
                EventKind::Housekeeping,
                serde_json::json!({"resource_id": "x", "reason": "resync"}),
                "corr-9",
            )
            .await
            .unwrap();

        let fetched = journal.get(appended.id).await.unwrap().unwrap();
        assert_eq!(fetched.replicable_type, "uploads");
        assert_eq!(fetched.event_name, EventKind::Housekeeping);
        assert_eq!(fetched.correlation_id, "corr-9");
        assert_eq!(fetched.payload["reason"], "resync");

        assert!(journal.get(appended.id + 1000).await.unwrap().is_none());
    }
}
