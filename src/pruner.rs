// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Journal pruner.
//!
//! The journal grows forever unless pruned, but pruning an event a
//! secondary has not consumed silently breaks replication. Deleting too
//! little is always recoverable; deleting too much never is, so every
//! ambiguity resolves toward keeping events.
//!
//! One cycle is a small state machine:
//!
//! ```text
//! Evaluating ── lag gate trips ────────────────> Skipped (no-op)
//!     │
//!     ├─ any secondary missing/stale/unhealthy ─> Aborted (no-op)
//!     │
//!     └─ all healthy & fresh ──────────────────> Pruned
//!        low-water mark = min(cursor) over secondaries
//!        (no secondaries: everything is prunable)
//! ```
//!
//! Skipped and Aborted delete nothing. Pruned issues one bounded range
//! delete at or below the low-water mark. Every outcome is idempotent;
//! storage errors abort the cycle before any decision is acted on.

use crate::config::PrunerConfig;
use crate::db::now_millis;
use crate::error::Result;
use crate::journal::EventJournal;
use crate::node_status::NodeStatusStore;
use crate::registry::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};

/// Backpressure signal consulted before any prune work.
///
/// When the signal reports lag the cycle becomes a no-op: under lag the
/// status data feeding the low-water mark is least trustworthy, and the
/// delete load would compete with catch-up traffic.
pub trait LagSignal: Send + Sync {
    fn is_lagging(&self) -> BoxFuture<'_, Result<bool>>;
}

/// Lag signal that never trips. Deployments without a lag source use
/// this.
pub struct NoLagSignal;

impl LagSignal for NoLagSignal {
    fn is_lagging(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(false) })
    }
}

/// Outcome of one pruner cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Lag gate tripped before evaluation; nothing was examined.
    Skipped { reason: String },
    /// A secondary vetoed the cycle; nothing was deleted.
    Aborted { reason: String },
    /// Events at or below the low-water mark were deleted.
    /// `low_water_mark` is `None` when no secondaries exist and the
    /// whole journal was prunable.
    Pruned {
        low_water_mark: Option<i64>,
        deleted: u64,
    },
}

impl PruneOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Aborted { .. } => "aborted",
            Self::Pruned { .. } => "pruned",
        }
    }
}

/// Deletes fully-consumed journal events, quorum-safely.
pub struct JournalPruner {
    journal: EventJournal,
    node_status: NodeStatusStore,
    lag: Arc<dyn LagSignal>,
    status_freshness_millis: i64,
}

impl JournalPruner {
    pub fn new(
        journal: EventJournal,
        node_status: NodeStatusStore,
        lag: Arc<dyn LagSignal>,
        config: &PrunerConfig,
    ) -> Self {
        Self {
            journal,
            node_status,
            lag,
            status_freshness_millis: config.status_freshness_duration().as_millis() as i64,
        }
    }

    /// Run one prune cycle.
    pub async fn prune(&self) -> Result<PruneOutcome> {
        let outcome = self.evaluate().await?;
        crate::metrics::record_prune_outcome(outcome.as_str());
        Ok(outcome)
    }

    async fn evaluate(&self) -> Result<PruneOutcome> {
        // Gate first: under lag nothing is even examined
        if self.lag.is_lagging().await? {
            let reason = "replication lag above threshold".to_string();
            info!(%reason, "Prune cycle skipped");
            return Ok(PruneOutcome::Skipped { reason });
        }

        let secondaries = self.node_status.secondaries().await?;
        if secondaries.is_empty() {
            if self.node_status.count_nodes().await? == 0 {
                // An empty topology usually means registration has not
                // happened yet, not that there is nothing to deliver to
                warn!("Pruning with no registered nodes at all; draining the journal");
            }
            let deleted = self.journal.prune_all().await?;
            if deleted > 0 {
                info!(deleted, "Pruned journal with no secondaries");
                crate::metrics::record_events_pruned(deleted);
            }
            return Ok(PruneOutcome::Pruned {
                low_water_mark: None,
                deleted,
            });
        }

        let freshness_cutoff = now_millis() - self.status_freshness_millis;
        let mut low_water_mark = i64::MAX;
        for secondary in &secondaries {
            let status = match &secondary.status {
                Some(status) => status,
                None => {
                    return Ok(self.abort(format!(
                        "secondary {} has never reported status",
                        secondary.node_id
                    )));
                }
            };
            if status.last_successful_check_at < freshness_cutoff {
                return Ok(self.abort(format!(
                    "secondary {} status is stale",
                    secondary.node_id
                )));
            }
            if !status.healthy {
                return Ok(self.abort(format!(
                    "secondary {} is unhealthy",
                    secondary.node_id
                )));
            }
            low_water_mark = low_water_mark.min(status.cursor_last_event_id);
        }

        let deleted = self.journal.prune_up_to(low_water_mark).await?;
        if deleted > 0 {
            info!(low_water_mark, deleted, "Pruned journal");
            crate::metrics::record_events_pruned(deleted);
        }
        Ok(PruneOutcome::Pruned {
            low_water_mark: Some(low_water_mark),
            deleted,
        })
    }

    fn abort(&self, reason: String) -> PruneOutcome {
        warn!(%reason, "Prune cycle aborted");
        PruneOutcome::Aborted { reason }
    }
}
