// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only status snapshot and gauge publication.
//!
//! The reporter aggregates what the stores already know: journal size,
//! per-secondary cursor lag, per-type verification backlog. It writes
//! nothing and decides nothing; gauges are published only when the engine
//! was configured with `metrics_enabled`.

use crate::error::Result;
use crate::journal::EventJournal;
use crate::node_status::NodeStatusStore;
use crate::registry::ReplicatorRegistry;
use crate::verification::{VerificationCounts, VerificationStore};
use tracing::debug;

/// One secondary's position relative to the journal head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryLag {
    pub node_id: String,
    /// Highest event id the secondary reported consuming, if it has
    /// reported at all.
    pub cursor_last_event_id: Option<i64>,
    /// Events between the cursor and the journal head. A secondary that
    /// never reported lags by the whole journal head.
    pub lag_events: u64,
    pub healthy: bool,
}

/// Point-in-time view of replication health.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    /// Journal head, `None` when the journal is empty.
    pub max_event_id: Option<i64>,
    /// Events currently retained.
    pub journal_len: u64,
    pub secondaries: Vec<SecondaryLag>,
    /// Per-type verification backlog, in registry name order.
    pub verification: Vec<(String, VerificationCounts)>,
}

/// Aggregates store state into [`StatusSnapshot`]s and gauges.
#[derive(Clone)]
pub struct MetricsReporter {
    journal: EventJournal,
    node_status: NodeStatusStore,
    verification: VerificationStore,
    registry: ReplicatorRegistry,
    metrics_enabled: bool,
}

impl MetricsReporter {
    pub fn new(
        journal: EventJournal,
        node_status: NodeStatusStore,
        verification: VerificationStore,
        registry: ReplicatorRegistry,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            journal,
            node_status,
            verification,
            registry,
            metrics_enabled,
        }
    }

    /// Build a snapshot. Read-only.
    pub async fn snapshot(&self) -> Result<StatusSnapshot> {
        let max_event_id = self.journal.max_id().await?;
        let journal_len = self.journal.len().await?;
        let head = max_event_id.unwrap_or(0);

        let secondaries = self
            .node_status
            .secondaries()
            .await?
            .into_iter()
            .map(|record| match record.status {
                Some(status) => SecondaryLag {
                    node_id: record.node_id,
                    cursor_last_event_id: Some(status.cursor_last_event_id),
                    lag_events: (head - status.cursor_last_event_id).max(0) as u64,
                    healthy: status.healthy,
                },
                None => SecondaryLag {
                    node_id: record.node_id,
                    cursor_last_event_id: None,
                    lag_events: head.max(0) as u64,
                    healthy: false,
                },
            })
            .collect();

        let mut verification = Vec::new();
        for name in self.registry.names() {
            let counts = self.verification.counts(&name).await?;
            verification.push((name, counts));
        }

        Ok(StatusSnapshot {
            max_event_id,
            journal_len,
            secondaries,
            verification,
        })
    }

    /// Build a snapshot and, when metrics are enabled, publish it as
    /// gauges.
    pub async fn report(&self) -> Result<StatusSnapshot> {
        let snapshot = self.snapshot().await?;
        if self.metrics_enabled {
            crate::metrics::set_journal_events(snapshot.journal_len);
            for secondary in &snapshot.secondaries {
                crate::metrics::set_cursor_lag(&secondary.node_id, secondary.lag_events);
            }
            for (name, counts) in &snapshot.verification {
                crate::metrics::set_verification_backlog(
                    name,
                    counts.pending,
                    counts.verified,
                    counts.failed,
                );
            }
        }
        debug!(
            journal_len = snapshot.journal_len,
            secondaries = snapshot.secondaries.len(),
            "Status snapshot taken"
        );
        Ok(snapshot)
    }
}
