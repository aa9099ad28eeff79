// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resource sync: transfer, checksum, verification state transition.
//!
//! One sync is one resource brought up to date on a secondary: transfer
//! the bytes through the type's descriptor, compute a SHA-256 over them,
//! compare against the authoritative checksum when one was shipped, and
//! record the outcome in verification state.
//!
//! # Leases
//!
//! A per-(type, resource) advisory lease serializes duplicate syncs inside
//! this process; the queue can legitimately hold the same resource twice
//! (double delivery, event burst). The lease carries a TTL so a crashed
//! holder cannot wedge a resource. Cross-process exclusion is not needed:
//! sync is idempotent, so two processes syncing the same resource waste
//! work but stay correct.
//!
//! # Failures
//!
//! A transfer error marks the row failed (message recorded, retry count
//! bumped) and propagates as a retryable error so the worker re-enqueues
//! the sync. A checksum mismatch is NOT an error: the row moves to failed
//! with the mismatch recorded and the outcome is returned normally.

use crate::config::SyncConfig;
use crate::error::{GeoError, Result};
use crate::registry::ReplicatorRegistry;
use crate::resilience::Bulkhead;
use crate::verification::VerificationStore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Transferred and checksum-verified (or transferred, for types that
    /// are not verifiable).
    Verified,
    /// Transferred but the checksum did not match; row marked failed.
    ChecksumMismatch,
    /// Another sync for this resource holds the lease; nothing done.
    LeaseHeld,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::LeaseHeld => "lease_held",
        }
    }
}

/// Hex-encoded SHA-256 of a resource's bytes.
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Executes syncs with lease serialization and bounded concurrency.
pub struct SyncEngine {
    registry: ReplicatorRegistry,
    verification: VerificationStore,
    bulkhead: Bulkhead,
    lease_ttl: Duration,
    sync_timeout: Duration,
    leases: Mutex<HashMap<(String, String), Instant>>,
}

impl SyncEngine {
    pub fn new(
        registry: ReplicatorRegistry,
        verification: VerificationStore,
        config: &SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            verification,
            bulkhead: Bulkhead::new(config.max_concurrent_transfers),
            lease_ttl: config.lease_ttl_duration(),
            sync_timeout: config.sync_timeout_duration(),
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Sync one resource. Idempotent; safe to deliver twice.
    pub async fn sync(&self, replicable_type: &str, resource_id: &str) -> Result<SyncOutcome> {
        let descriptor = self.registry.get(replicable_type)?;

        if !self.try_acquire_lease(replicable_type, resource_id).await {
            debug!(replicable_type, resource_id, "Sync lease held, skipping");
            crate::metrics::record_sync_result(replicable_type, SyncOutcome::LeaseHeld.as_str());
            return Ok(SyncOutcome::LeaseHeld);
        }

        let result = async {
            let _permit = self
                .bulkhead
                .acquire()
                .await
                .map_err(|e| GeoError::Internal(e.to_string()))?;

            self.verification
                .upsert_pending(replicable_type, resource_id)
                .await?;
            self.verification
                .mark_sync_started(replicable_type, resource_id)
                .await?;

            let start = Instant::now();
            let copy = match descriptor.transfer(resource_id).await {
                Ok(copy) => copy,
                Err(e) => {
                    // Record the failure, then let the worker retry
                    self.verification
                        .mark_failed(replicable_type, resource_id, &e.to_string())
                        .await?;
                    crate::metrics::record_sync_result(replicable_type, "transfer_error");
                    return Err(e);
                }
            };

            let local_checksum = compute_checksum(&copy.bytes);
            let outcome = if descriptor.verifiable() {
                match copy.expected_checksum {
                    Some(ref expected) if expected != &local_checksum => {
                        let failure = format!(
                            "checksum mismatch: expected {}, computed {}",
                            expected, local_checksum
                        );
                        warn!(replicable_type, resource_id, %failure, "Sync failed verification");
                        self.verification
                            .mark_failed(replicable_type, resource_id, &failure)
                            .await?;
                        SyncOutcome::ChecksumMismatch
                    }
                    _ => {
                        self.verification
                            .mark_verified(replicable_type, resource_id, &local_checksum)
                            .await?;
                        SyncOutcome::Verified
                    }
                }
            } else {
                // Not verifiable: record the transfer, keep the digest for
                // observability, never compare
                self.verification
                    .mark_verified(replicable_type, resource_id, &local_checksum)
                    .await?;
                SyncOutcome::Verified
            };

            crate::metrics::record_sync_result(replicable_type, outcome.as_str());
            crate::metrics::record_sync_duration(replicable_type, start.elapsed());
            debug!(
                replicable_type,
                resource_id,
                outcome = outcome.as_str(),
                "Sync complete"
            );
            Ok(outcome)
        }
        .await;

        self.release_lease(replicable_type, resource_id).await;
        result
    }

    /// Sweep in-flight rows whose sync outlived the timeout, marking
    /// them failed so they become claimable again. The timeout is the
    /// descriptor's override when it has one, else the configured
    /// `sync.sync_timeout`.
    pub async fn fail_sync_timeouts(&self, replicable_type: &str) -> Result<u64> {
        let descriptor = self.registry.get(replicable_type)?;
        let timeout = descriptor.sync_timeout().unwrap_or(self.sync_timeout);
        let cutoff = crate::db::now_millis() - timeout.as_millis() as i64;

        let swept = self
            .verification
            .fail_timed_out(replicable_type, cutoff)
            .await?;
        if swept > 0 {
            info!(
                replicable_type,
                swept,
                timeout_secs = timeout.as_secs(),
                "Failed timed-out syncs"
            );
            crate::metrics::record_sync_timeouts_failed(replicable_type, swept);
        }
        Ok(swept)
    }

    async fn try_acquire_lease(&self, replicable_type: &str, resource_id: &str) -> bool {
        let key = (replicable_type.to_string(), resource_id.to_string());
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get(&key) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                leases.insert(key, now + self.lease_ttl);
                true
            }
        }
    }

    async fn release_lease(&self, replicable_type: &str, resource_id: &str) {
        let key = (replicable_type.to_string(), resource_id.to_string());
        self.leases.lock().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::registry::{BoxFuture, ReplicatorDescriptor, TransferredCopy};
    use crate::verification::VerificationState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedReplicator {
        name: String,
        bytes: Vec<u8>,
        expected_checksum: Option<String>,
        verifiable: bool,
        fail_transfer: bool,
        transfers: AtomicUsize,
    }

    impl FixedReplicator {
        fn new(bytes: &[u8]) -> Self {
            Self {
                name: "snippets".to_string(),
                bytes: bytes.to_vec(),
                expected_checksum: Some(compute_checksum(bytes)),
                verifiable: true,
                fail_transfer: false,
                transfers: AtomicUsize::new(0),
            }
        }
    }

    impl ReplicatorDescriptor for FixedReplicator {
        fn name(&self) -> &str {
            &self.name
        }

        fn verifiable(&self) -> bool {
            self.verifiable
        }

        fn model_scope(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn transfer<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<TransferredCopy>> {
            Box::pin(async move {
                self.transfers.fetch_add(1, Ordering::SeqCst);
                if self.fail_transfer {
                    return Err(GeoError::transfer(&self.name, resource_id, "connection reset"));
                }
                Ok(TransferredCopy {
                    bytes: self.bytes.clone(),
                    expected_checksum: self.expected_checksum.clone(),
                })
            })
        }

        fn checksum<'a>(&'a self, _resource_id: &'a str) -> BoxFuture<'a, Result<String>> {
            let sum = compute_checksum(&self.bytes);
            Box::pin(async move { Ok(sum) })
        }
    }

    async fn engine_with(replicator: FixedReplicator) -> (Arc<SyncEngine>, VerificationStore) {
        let pool = crate::db::connect(&StorageConfig::in_memory()).await.unwrap();
        let verification = VerificationStore::new(pool);
        let mut registry = ReplicatorRegistry::new();
        registry.register(Arc::new(replicator));
        let engine = SyncEngine::new(registry, verification.clone(), &SyncConfig::default());
        (engine, verification)
    }

    #[tokio::test]
    async fn test_matching_checksum_verifies() {
        let (engine, verification) = engine_with(FixedReplicator::new(b"payload")).await;

        let outcome = engine.sync("snippets", "a").await.unwrap();
        assert_eq!(outcome, SyncOutcome::Verified);

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Verified);
        assert_eq!(rec.checksum.as_deref(), Some(compute_checksum(b"payload").as_str()));
        assert!(rec.sync_started_at.is_none());
    }

    #[tokio::test]
    async fn test_mismatch_marks_failed_without_error() {
        let mut replicator = FixedReplicator::new(b"payload");
        replicator.expected_checksum = Some("not-the-real-sum".to_string());
        let (engine, verification) = engine_with(replicator).await;

        let outcome = engine.sync("snippets", "a").await.unwrap();
        assert_eq!(outcome, SyncOutcome::ChecksumMismatch);

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Failed);
        assert!(rec.failure.as_deref().unwrap().contains("checksum mismatch"));
        assert_eq!(rec.retry_count, 1);
    }

    #[tokio::test]
    async fn test_transfer_error_marks_failed_and_propagates() {
        let mut replicator = FixedReplicator::new(b"payload");
        replicator.fail_transfer = true;
        let (engine, verification) = engine_with(replicator).await;

        let err = engine.sync("snippets", "a").await.unwrap_err();
        assert!(err.is_retryable());

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Failed);
        assert!(rec.failure.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_missing_expected_checksum_verifies_on_local_digest() {
        let mut replicator = FixedReplicator::new(b"payload");
        replicator.expected_checksum = None;
        let (engine, verification) = engine_with(replicator).await;

        assert_eq!(engine.sync("snippets", "a").await.unwrap(), SyncOutcome::Verified);
        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_non_verifiable_type_skips_comparison() {
        let mut replicator = FixedReplicator::new(b"payload");
        replicator.verifiable = false;
        replicator.expected_checksum = Some("would-mismatch".to_string());
        let (engine, verification) = engine_with(replicator).await;

        assert_eq!(engine.sync("snippets", "a").await.unwrap(), SyncOutcome::Verified);
        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let (engine, verification) = engine_with(FixedReplicator::new(b"payload")).await;

        assert_eq!(engine.sync("snippets", "a").await.unwrap(), SyncOutcome::Verified);
        assert_eq!(engine.sync("snippets", "a").await.unwrap(), SyncOutcome::Verified);

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Verified);
        assert_eq!(rec.retry_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (engine, _verification) = engine_with(FixedReplicator::new(b"x")).await;
        let err = engine.sync("widgets", "a").await.unwrap_err();
        assert!(matches!(err, GeoError::UnknownReplicableType(_)));
    }

    #[tokio::test]
    async fn test_lease_serializes_duplicates() {
        let (engine, _verification) = engine_with(FixedReplicator::new(b"x")).await;

        assert!(engine.try_acquire_lease("snippets", "a").await);
        // Second acquisition while held is refused
        assert!(!engine.try_acquire_lease("snippets", "a").await);
        // Different resource is unaffected
        assert!(engine.try_acquire_lease("snippets", "b").await);

        engine.release_lease("snippets", "a").await;
        assert!(engine.try_acquire_lease("snippets", "a").await);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let pool = crate::db::connect(&StorageConfig::in_memory()).await.unwrap();
        let verification = VerificationStore::new(pool);
        let mut registry = ReplicatorRegistry::new();
        registry.register(Arc::new(FixedReplicator::new(b"x")));
        let config = SyncConfig {
            lease_ttl: "10ms".to_string(),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(registry, verification, &config);

        assert!(engine.try_acquire_lease("snippets", "a").await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // TTL elapsed without release: the lease must not wedge the resource
        assert!(engine.try_acquire_lease("snippets", "a").await);
    }

    #[tokio::test]
    async fn test_fail_sync_timeouts_sweeps_stale_rows() {
        struct SlowTimeoutReplicator(FixedReplicator);
        impl ReplicatorDescriptor for SlowTimeoutReplicator {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn model_scope(&self) -> BoxFuture<'_, Result<Vec<String>>> {
                self.0.model_scope()
            }
            fn transfer<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<TransferredCopy>> {
                self.0.transfer(id)
            }
            fn checksum<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<String>> {
                self.0.checksum(id)
            }
            fn sync_timeout(&self) -> Option<Duration> {
                Some(Duration::ZERO)
            }
        }

        let pool = crate::db::connect(&StorageConfig::in_memory()).await.unwrap();
        let verification = VerificationStore::new(pool);
        let mut registry = ReplicatorRegistry::new();
        registry.register(Arc::new(SlowTimeoutReplicator(FixedReplicator::new(b"x"))));
        let engine = SyncEngine::new(registry, verification.clone(), &SyncConfig::default());

        verification.upsert_pending("snippets", "stuck").await.unwrap();
        verification.mark_sync_started("snippets", "stuck").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let swept = engine.fail_sync_timeouts("snippets").await.unwrap();
        assert_eq!(swept, 1);
        let rec = verification.get("snippets", "stuck").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Failed);
    }

    #[tokio::test]
    async fn test_configured_timeout_applies_without_descriptor_override() {
        let pool = crate::db::connect(&StorageConfig::in_memory()).await.unwrap();
        let verification = VerificationStore::new(pool);
        let mut registry = ReplicatorRegistry::new();
        // FixedReplicator does not override sync_timeout
        registry.register(Arc::new(FixedReplicator::new(b"x")));
        let config = SyncConfig {
            sync_timeout: "0s".to_string(),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(registry, verification.clone(), &config);

        verification.upsert_pending("snippets", "stuck").await.unwrap();
        verification.mark_sync_started("snippets", "stuck").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let swept = engine.fail_sync_timeouts("snippets").await.unwrap();
        assert_eq!(swept, 1);
        let rec = verification.get("snippets", "stuck").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Failed);
    }

    #[tokio::test]
    async fn test_default_configured_timeout_leaves_fresh_rows() {
        let (engine, verification) = engine_with(FixedReplicator::new(b"x")).await;
        verification.upsert_pending("snippets", "fresh").await.unwrap();
        verification.mark_sync_started("snippets", "fresh").await.unwrap();

        // Default timeout is an hour; a just-started sync is not swept
        let swept = engine.fail_sync_timeouts("snippets").await.unwrap();
        assert_eq!(swept, 0);
    }

    #[test]
    fn test_compute_checksum_is_stable_sha256() {
        assert_eq!(
            compute_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(compute_checksum(b"abc").len(), 64);
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
    }
}
