// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Verification backfill.
//!
//! Events can be lost (publisher crash, pruned journal on a rebuilt
//! secondary), so verification rows are periodically reconciled against
//! the authoritative model scope. One cycle computes the symmetric
//! difference between the descriptor's scope and the rows we hold:
//!
//! - in scope, no row: create a pending row (sync will follow)
//! - row, not in scope: delete the orphan
//!
//! Both sides use set-based batch statements; per-cycle work is bounded
//! by `batch_size` per side, so a huge drift is worked off across cycles.
//! The whole operation is idempotent.

use crate::config::BackfillConfig;
use crate::error::Result;
use crate::registry::ReplicatorRegistry;
use crate::verification::VerificationStore;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

/// What one backfill cycle changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillStats {
    /// Pending rows created for in-scope resources we did not know.
    pub created: u64,
    /// Orphaned rows deleted for resources no longer in scope.
    pub deleted: u64,
}

/// Reconciles verification rows against authoritative scope.
#[derive(Clone)]
pub struct Backfiller {
    registry: ReplicatorRegistry,
    verification: VerificationStore,
    batch_size: usize,
}

impl Backfiller {
    pub fn new(
        registry: ReplicatorRegistry,
        verification: VerificationStore,
        config: &BackfillConfig,
    ) -> Self {
        Self {
            registry,
            verification,
            batch_size: config.batch_size,
        }
    }

    /// Run one bounded reconciliation cycle for a type.
    pub async fn backfill(&self, replicable_type: &str) -> Result<BackfillStats> {
        let descriptor = self.registry.get(replicable_type)?;
        let start = Instant::now();

        let scope: HashSet<String> = descriptor.model_scope().await?.into_iter().collect();
        let existing: HashSet<String> = self
            .verification
            .resource_ids(replicable_type)
            .await?
            .into_iter()
            .collect();

        let mut missing: Vec<String> = scope.difference(&existing).cloned().collect();
        let mut orphaned: Vec<String> = existing.difference(&scope).cloned().collect();
        // Deterministic order, and a stable prefix when truncating to the
        // per-cycle bound
        missing.sort();
        orphaned.sort();
        missing.truncate(self.batch_size);
        orphaned.truncate(self.batch_size);

        let created = if missing.is_empty() {
            0
        } else {
            self.verification
                .upsert_pending_many(replicable_type, &missing)
                .await?
        };
        let deleted = if orphaned.is_empty() {
            0
        } else {
            self.verification
                .delete_many(replicable_type, &orphaned)
                .await?
        };

        let stats = BackfillStats { created, deleted };
        if created > 0 || deleted > 0 {
            info!(replicable_type, created, deleted, "Backfill reconciled");
        } else {
            debug!(replicable_type, "Backfill found nothing to reconcile");
        }
        crate::metrics::record_backfill(replicable_type, created, deleted, start.elapsed());
        Ok(stats)
    }
}
