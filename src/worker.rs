// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unordered worker pool.
//!
//! All background work flows through one mpsc queue as [`WorkItem`]s.
//! Workers pull items in no particular order; every handler is idempotent
//! so at-least-once delivery (including re-enqueue after a retryable
//! failure) is safe.
//!
//! Retry policy: a retryable failure re-enqueues the item after a bounded
//! exponential backoff, up to `RetryConfig::max_attempts`. Non-retryable
//! failures drop the item immediately with an error log.

use crate::error::Result;
use crate::event::EventKind;
use crate::registry::BoxFuture;
use crate::resilience::RetryConfig;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORK_QUEUE_DEPTH: usize = 4096;

/// One idempotent unit of background work.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Apply one replication event on a secondary.
    ConsumeEvent {
        replicable_type: String,
        event_name: EventKind,
        payload: serde_json::Value,
        correlation_id: String,
    },
    /// Transfer and verify one resource.
    Sync {
        replicable_type: String,
        resource_id: String,
    },
    /// Reconcile verification rows against the authoritative scope.
    BackfillVerification { replicable_type: String },
    /// Re-checksum a batch of long-verified resources.
    ReverifyBatch { replicable_type: String },
    /// Run one pruner cycle.
    PruneJournal,
    /// Publish the periodic metrics snapshot.
    UpdateMetrics,
}

impl WorkItem {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConsumeEvent { .. } => "consume_event",
            Self::Sync { .. } => "sync",
            Self::BackfillVerification { .. } => "backfill_verification",
            Self::ReverifyBatch { .. } => "reverify_batch",
            Self::PruneJournal => "prune_journal",
            Self::UpdateMetrics => "update_metrics",
        }
    }
}

/// A work item together with its delivery attempt count. Opaque outside
/// the queue.
#[derive(Debug)]
pub struct QueuedItem {
    item: WorkItem,
    attempt: usize,
}

impl QueuedItem {
    pub fn into_item(self) -> WorkItem {
        self.item
    }
}

/// Sending half of the work queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<QueuedItem>,
}

impl WorkQueue {
    /// Create the queue, returning the sender and the shared receiver the
    /// worker pool pulls from.
    pub fn new() -> (Self, SharedReceiver) {
        let (tx, rx) = mpsc::channel(WORK_QUEUE_DEPTH);
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    /// Enqueue a fresh unit of work.
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.tx
            .send(QueuedItem { item, attempt: 0 })
            .await
            .map_err(|_| crate::error::GeoError::Shutdown)
    }

    async fn requeue(&self, item: WorkItem, attempt: usize) -> Result<()> {
        self.tx
            .send(QueuedItem { item, attempt })
            .await
            .map_err(|_| crate::error::GeoError::Shutdown)
    }
}

/// Receiver shared by all workers in the pool.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<QueuedItem>>>;

/// Dispatch target for work items. Implemented by the engine.
pub trait WorkHandler: Send + Sync + 'static {
    fn handle(&self, item: WorkItem) -> BoxFuture<'_, Result<()>>;
}

/// Spawn `count` workers pulling from the shared receiver.
///
/// Workers exit when the shutdown signal flips to `true` or the queue
/// closes.
pub fn spawn_workers(
    count: usize,
    queue: WorkQueue,
    rx: SharedReceiver,
    handler: Arc<dyn WorkHandler>,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let queue = queue.clone();
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let retry = retry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(worker_loop(
                worker_id, queue, rx, handler, retry, shutdown,
            ))
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    queue: WorkQueue,
    rx: SharedReceiver,
    handler: Arc<dyn WorkHandler>,
    retry: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        let queued = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                queued = rx.recv() => match queued {
                    Some(q) => q,
                    None => break,
                },
            }
        };

        let kind = queued.item.kind();
        match handler.handle(queued.item.clone()).await {
            Ok(()) => {
                if queued.attempt > 0 {
                    debug!(worker_id, kind, attempt = queued.attempt, "Work succeeded after retry");
                }
            }
            Err(e) if e.is_retryable() && queued.attempt + 1 < retry.max_attempts => {
                let attempt = queued.attempt + 1;
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    worker_id,
                    kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Work failed, re-enqueueing"
                );
                crate::metrics::record_work_retry(kind);
                tokio::time::sleep(delay).await;
                if queue.requeue(queued.item, attempt).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(
                    worker_id,
                    kind,
                    attempts = queued.attempt + 1,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Work dropped"
                );
                crate::metrics::record_work_dropped(kind);
            }
        }
    }
    info!(worker_id, "Worker stopped");
}
