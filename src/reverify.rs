// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reverification scheduler.
//!
//! Verified is not forever: local copies rot (disk corruption, manual
//! tampering, partial restores). Rows whose `verified_at` is older than
//! the configured horizon are periodically re-checksummed against the
//! stored checksum. A match refreshes `verified_at`; drift moves the row
//! to failed, which re-queues it for sync.
//!
//! The scheduler is self-throttled: each cycle asks the descriptor how
//! many batches it has capacity for and stops at that bound (or earlier,
//! when no more rows are due). A descriptor reporting zero capacity
//! silences reverification for that type entirely.

use crate::config::ReverificationConfig;
use crate::error::Result;
use crate::registry::ReplicatorRegistry;
use crate::verification::VerificationStore;
use tracing::{debug, info, warn};

/// What one reverification cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReverifyStats {
    /// Rows re-checksummed.
    pub checked: u64,
    /// Rows whose local copy no longer matched the stored checksum.
    pub drifted: u64,
}

/// Re-checksums long-verified rows in bounded batches.
#[derive(Clone)]
pub struct Reverifier {
    registry: ReplicatorRegistry,
    verification: VerificationStore,
    batch_size: usize,
    reverify_after_millis: i64,
}

impl Reverifier {
    pub fn new(
        registry: ReplicatorRegistry,
        verification: VerificationStore,
        config: &ReverificationConfig,
    ) -> Self {
        Self {
            registry,
            verification,
            batch_size: config.batch_size,
            reverify_after_millis: config.reverify_after_duration().as_millis() as i64,
        }
    }

    /// Run one self-throttled reverification cycle for a type.
    pub async fn reverify_batch(&self, replicable_type: &str) -> Result<ReverifyStats> {
        let descriptor = self.registry.get(replicable_type)?;
        if !descriptor.verifiable() {
            return Ok(ReverifyStats::default());
        }

        let mut stats = ReverifyStats::default();
        let mut remaining = descriptor.remaining_reverification_batch_count();
        let cutoff = crate::db::now_millis() - self.reverify_after_millis;

        while remaining > 0 {
            let batch = self
                .verification
                .verified_batch_due(replicable_type, cutoff, self.batch_size as u32)
                .await?;
            if batch.is_empty() {
                break;
            }

            for record in &batch {
                let stored = match record.checksum.as_deref() {
                    Some(sum) => sum,
                    None => {
                        // Verified without a checksum should not exist for
                        // a verifiable type; re-queue it for a full sync
                        self.verification
                            .mark_failed(replicable_type, &record.resource_id, "no stored checksum")
                            .await?;
                        stats.drifted += 1;
                        continue;
                    }
                };

                stats.checked += 1;
                match descriptor.checksum(&record.resource_id).await {
                    Ok(recomputed) if recomputed == stored => {
                        self.verification
                            .mark_verified(replicable_type, &record.resource_id, stored)
                            .await?;
                    }
                    Ok(recomputed) => {
                        let failure = format!(
                            "checksum drift: stored {}, recomputed {}",
                            stored, recomputed
                        );
                        warn!(
                            replicable_type,
                            resource_id = %record.resource_id,
                            %failure,
                            "Reverification found drift"
                        );
                        self.verification
                            .mark_failed(replicable_type, &record.resource_id, &failure)
                            .await?;
                        stats.drifted += 1;
                    }
                    Err(e) => {
                        // Local checksum capability failed; fail the row
                        // so sync rebuilds the copy
                        self.verification
                            .mark_failed(replicable_type, &record.resource_id, &e.to_string())
                            .await?;
                        stats.drifted += 1;
                    }
                }
            }

            remaining -= 1;
        }

        if stats.drifted > 0 {
            info!(
                replicable_type,
                checked = stats.checked,
                drifted = stats.drifted,
                "Reverification cycle found drift"
            );
        } else {
            debug!(replicable_type, checked = stats.checked, "Reverification cycle complete");
        }
        crate::metrics::record_reverification(replicable_type, stats.checked, stats.drifted);
        Ok(stats)
    }
}
