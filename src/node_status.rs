// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node registry and status reports.
//!
//! Secondaries periodically report their consumption cursor and health.
//! The pruner reads this table to compute the quorum-safe low-water mark,
//! so the distinction between "no status row" and "stale status row"
//! matters: a registered secondary with no report at all must veto
//! pruning, exactly like a stale one.

use crate::config::NodeRole;
use crate::db::execute_with_retry;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

/// One status report from a secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    /// Highest journal event id the node has fully consumed.
    pub cursor_last_event_id: i64,
    /// When the node last completed a successful check, unix millis.
    pub last_successful_check_at: i64,
    pub healthy: bool,
}

/// A registered secondary together with its most recent report, if any.
#[derive(Debug, Clone)]
pub struct SecondaryRecord {
    pub node_id: String,
    pub status: Option<NodeStatus>,
}

/// Store of registered nodes and their status reports.
#[derive(Clone)]
pub struct NodeStatusStore {
    pool: SqlitePool,
}

impl NodeStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a node in the topology. Idempotent; re-registering
    /// updates the role.
    pub async fn register_node(&self, node_id: &str, role: NodeRole) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("register_node", || async {
            sqlx::query(
                r#"
                INSERT INTO nodes (node_id, role) VALUES (?, ?)
                ON CONFLICT (node_id) DO UPDATE SET role = excluded.role
                "#,
            )
            .bind(node_id)
            .bind(role.as_str())
            .execute(pool)
            .await
        })
        .await?;
        debug!(node_id, role = %role, "Registered node");
        Ok(())
    }

    /// Remove a node and any status report it filed.
    pub async fn deregister_node(&self, node_id: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("deregister_node", || async {
            sqlx::query("DELETE FROM nodes WHERE node_id = ?")
                .bind(node_id)
                .execute(pool)
                .await
        })
        .await?;
        execute_with_retry("deregister_node_status", || async {
            sqlx::query("DELETE FROM node_status WHERE node_id = ?")
                .bind(node_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Record a status report, replacing any previous one for the node.
    pub async fn upsert_status(&self, status: &NodeStatus) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("upsert_status", || async {
            sqlx::query(
                r#"
                INSERT INTO node_status (node_id, cursor_last_event_id, last_successful_check_at, healthy)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (node_id) DO UPDATE SET
                    cursor_last_event_id = excluded.cursor_last_event_id,
                    last_successful_check_at = excluded.last_successful_check_at,
                    healthy = excluded.healthy
                "#,
            )
            .bind(&status.node_id)
            .bind(status.cursor_last_event_id)
            .bind(status.last_successful_check_at)
            .bind(status.healthy as i64)
            .execute(pool)
            .await
        })
        .await?;
        debug!(
            node_id = %status.node_id,
            cursor = status.cursor_last_event_id,
            healthy = status.healthy,
            "Recorded node status"
        );
        Ok(())
    }

    /// Fetch the latest status report for one node.
    pub async fn get_status(&self, node_id: &str) -> Result<Option<NodeStatus>> {
        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT node_id, cursor_last_event_id, last_successful_check_at, healthy
            FROM node_status WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_status))
    }

    /// Number of registered nodes of any role.
    pub async fn count_nodes(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Every registered secondary, joined with its latest status report.
    ///
    /// A secondary that has never reported appears with `status: None`.
    /// The pruner depends on this shape; do not filter unreported nodes
    /// out here.
    pub async fn secondaries(&self) -> Result<Vec<SecondaryRecord>> {
        let rows: Vec<(String, Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT n.node_id, s.cursor_last_event_id, s.last_successful_check_at, s.healthy
            FROM nodes n
            LEFT JOIN node_status s ON s.node_id = n.node_id
            WHERE n.role = 'secondary'
            ORDER BY n.node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(node_id, cursor, checked_at, healthy)| {
                let status = match (cursor, checked_at, healthy) {
                    (Some(c), Some(t), Some(h)) => Some(NodeStatus {
                        node_id: node_id.clone(),
                        cursor_last_event_id: c,
                        last_successful_check_at: t,
                        healthy: h != 0,
                    }),
                    _ => None,
                };
                SecondaryRecord { node_id, status }
            })
            .collect())
    }
}

fn row_to_status(row: (String, i64, i64, i64)) -> NodeStatus {
    NodeStatus {
        node_id: row.0,
        cursor_last_event_id: row.1,
        last_successful_check_at: row.2,
        healthy: row.3 != 0,
    }
}
