// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event consumption on secondaries.
//!
//! Consumption never moves data inline: a handler's only side effects are
//! verification-state bookkeeping and enqueueing sync work. That keeps
//! handlers fast, commutative per resource, and safe under the pool's
//! at-least-once delivery.
//!
//! Events may arrive out of order. A `deleted` racing ahead of its
//! `updated` is resolved by resource-level sync: whatever the final
//! authoritative state is, the next sync converges on it, and backfill
//! removes rows for resources that no longer exist.

use crate::error::{GeoError, Result};
use crate::event::EventKind;
use crate::registry::ReplicatorRegistry;
use crate::verification::VerificationStore;
use crate::worker::{WorkItem, WorkQueue};
use tracing::{debug, warn};

/// Applies replication events to local verification state.
#[derive(Clone)]
pub struct EventConsumer {
    registry: ReplicatorRegistry,
    verification: VerificationStore,
    queue: WorkQueue,
}

impl EventConsumer {
    pub fn new(
        registry: ReplicatorRegistry,
        verification: VerificationStore,
        queue: WorkQueue,
    ) -> Self {
        Self {
            registry,
            verification,
            queue,
        }
    }

    /// Consume one event. Idempotent: re-delivery of the same event
    /// reaches the same state.
    ///
    /// Unknown replicable types fail fast with a non-retryable error.
    /// This indicates deploy-version skew between primary and secondary
    /// and needs operator attention, not a retry.
    pub async fn consume(
        &self,
        replicable_type: &str,
        event_name: EventKind,
        payload: &serde_json::Value,
        correlation_id: &str,
    ) -> Result<()> {
        if let Err(e) = self.registry.get(replicable_type) {
            warn!(
                replicable_type,
                event_name = %event_name,
                correlation_id,
                "Dropping event for unknown replicable type"
            );
            crate::metrics::record_unknown_replicable_type(replicable_type);
            return Err(e);
        }

        debug!(
            replicable_type,
            event_name = %event_name,
            correlation_id,
            "Consuming event"
        );

        match event_name {
            EventKind::Created | EventKind::Updated => {
                let resource_id = require_resource_id(payload, replicable_type, event_name)?;
                self.verification
                    .upsert_pending(replicable_type, resource_id)
                    .await?;
                self.enqueue_sync(replicable_type, resource_id).await?;
            }
            EventKind::Deleted => {
                // The resource is gone upstream; drop its row so backfill
                // and reverification stop caring about it.
                let resource_id = require_resource_id(payload, replicable_type, event_name)?;
                self.verification
                    .delete(replicable_type, resource_id)
                    .await?;
            }
            EventKind::Housekeeping => {
                // Resync trigger. Resource-scoped housekeeping re-queues
                // one resource; type-scoped housekeeping runs a backfill.
                match payload.get("resource_id").and_then(|v| v.as_str()) {
                    Some(resource_id) => {
                        self.verification
                            .reset_to_pending(replicable_type, resource_id)
                            .await?;
                        self.enqueue_sync(replicable_type, resource_id).await?;
                    }
                    None => {
                        self.queue
                            .enqueue(WorkItem::BackfillVerification {
                                replicable_type: replicable_type.to_string(),
                            })
                            .await?;
                    }
                }
            }
        }

        crate::metrics::record_event_consumed(replicable_type, event_name.as_str());
        Ok(())
    }

    async fn enqueue_sync(&self, replicable_type: &str, resource_id: &str) -> Result<()> {
        self.queue
            .enqueue(WorkItem::Sync {
                replicable_type: replicable_type.to_string(),
                resource_id: resource_id.to_string(),
            })
            .await
    }
}

fn require_resource_id<'a>(
    payload: &'a serde_json::Value,
    replicable_type: &str,
    event_name: EventKind,
) -> Result<&'a str> {
    payload
        .get("resource_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            GeoError::Internal(format!(
                "Event {}/{} has no resource_id",
                replicable_type, event_name
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::event::resource_payload;
    use crate::registry::NoOpReplicator;
    use crate::verification::VerificationState;
    use std::sync::Arc;

    async fn consumer() -> (EventConsumer, VerificationStore, crate::worker::SharedReceiver) {
        let pool = crate::db::connect(&StorageConfig::in_memory()).await.unwrap();
        let verification = VerificationStore::new(pool);
        let mut registry = ReplicatorRegistry::new();
        registry.register(Arc::new(NoOpReplicator::new("snippets")));
        let (queue, rx) = WorkQueue::new();
        (
            EventConsumer::new(registry, verification.clone(), queue),
            verification,
            rx,
        )
    }

    async fn next_item(rx: &crate::worker::SharedReceiver) -> Option<WorkItem> {
        let mut rx = rx.lock().await;
        rx.try_recv().ok().map(|q| q.into_item())
    }

    #[tokio::test]
    async fn test_created_upserts_pending_and_enqueues_sync() {
        let (consumer, verification, rx) = consumer().await;

        consumer
            .consume("snippets", EventKind::Created, &resource_payload("a"), "c-1")
            .await
            .unwrap();

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Pending);

        match next_item(&rx).await {
            Some(WorkItem::Sync {
                replicable_type,
                resource_id,
            }) => {
                assert_eq!(replicable_type, "snippets");
                assert_eq!(resource_id, "a");
            }
            other => panic!("expected sync item, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_delivery_is_idempotent() {
        let (consumer, verification, _rx) = consumer().await;

        for _ in 0..2 {
            consumer
                .consume("snippets", EventKind::Created, &resource_payload("a"), "c-1")
                .await
                .unwrap();
        }

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Pending);
        assert_eq!(verification.resource_ids("snippets").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_verification_keeps_verified() {
        let (consumer, verification, _rx) = consumer().await;

        consumer
            .consume("snippets", EventKind::Created, &resource_payload("a"), "c-1")
            .await
            .unwrap();
        verification.mark_verified("snippets", "a", "sum").await.unwrap();

        // The same created event delivered again must not regress state
        consumer
            .consume("snippets", EventKind::Created, &resource_payload("a"), "c-1")
            .await
            .unwrap();
        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_deleted_removes_row() {
        let (consumer, verification, _rx) = consumer().await;
        verification.upsert_pending("snippets", "a").await.unwrap();

        consumer
            .consume("snippets", EventKind::Deleted, &resource_payload("a"), "c-2")
            .await
            .unwrap();
        assert!(verification.get("snippets", "a").await.unwrap().is_none());

        // Deleting a never-seen resource is a no-op, not an error
        consumer
            .consume("snippets", EventKind::Deleted, &resource_payload("ghost"), "c-3")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_fails_fast() {
        let (consumer, _verification, _rx) = consumer().await;

        let err = consumer
            .consume("widgets", EventKind::Created, &resource_payload("a"), "c-1")
            .await
            .unwrap_err();
        assert!(matches!(err, GeoError::UnknownReplicableType(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_resource_id_is_rejected() {
        let (consumer, _verification, _rx) = consumer().await;

        let err = consumer
            .consume("snippets", EventKind::Created, &serde_json::json!({}), "c-1")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_housekeeping_resets_resource() {
        let (consumer, verification, rx) = consumer().await;
        verification.upsert_pending("snippets", "a").await.unwrap();
        verification.mark_verified("snippets", "a", "sum").await.unwrap();

        consumer
            .consume("snippets", EventKind::Housekeeping, &resource_payload("a"), "c-4")
            .await
            .unwrap();

        let rec = verification.get("snippets", "a").await.unwrap().unwrap();
        assert_eq!(rec.state, VerificationState::Pending);
        assert!(matches!(next_item(&rx).await, Some(WorkItem::Sync { .. })));
    }

    #[tokio::test]
    async fn test_housekeeping_without_resource_triggers_backfill() {
        let (consumer, _verification, rx) = consumer().await;

        consumer
            .consume("snippets", EventKind::Housekeeping, &serde_json::json!({}), "c-5")
            .await
            .unwrap();

        assert!(matches!(
            next_item(&rx).await,
            Some(WorkItem::BackfillVerification { .. })
        ));
    }
}
