// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication engine: construction, lifecycle, and work dispatch.
//!
//! `GeoEngine` owns the stores, the worker pool, and the periodic
//! schedulers. Everything is wired at construction from an explicit
//! [`GeoConfig`] and [`ReplicatorRegistry`]; nothing is discovered through
//! global state.
//!
//! # Lifecycle
//!
//! ```text
//! Created ── start() ──> Running ── shutdown() ──> Stopped
//! ```
//!
//! `start()` spawns the worker pool plus one ticker per periodic concern
//! (backfill and reverification per type, sync timeout sweep, prune,
//! metrics snapshot). `shutdown()` flips the shared watch channel and
//! awaits every task.

use crate::backfill::Backfiller;
use crate::config::GeoConfig;
use crate::consume::EventConsumer;
use crate::error::{GeoError, Result};
use crate::event::{Event, EventKind};
use crate::journal::EventJournal;
use crate::node_status::{NodeStatus, NodeStatusStore};
use crate::pruner::{JournalPruner, LagSignal, NoLagSignal};
use crate::publish::EventPublisher;
use crate::registry::{BoxFuture, ReplicatorRegistry};
use crate::resilience::RetryConfig;
use crate::reverify::Reverifier;
use crate::status::{MetricsReporter, StatusSnapshot};
use crate::sync::SyncEngine;
use crate::verification::VerificationStore;
use crate::worker::{spawn_workers, SharedReceiver, WorkHandler, WorkItem, WorkQueue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Created,
    Running,
    Stopped,
}

impl EngineState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        }
    }
}

/// The assembled replication engine.
pub struct GeoEngine {
    config: GeoConfig,
    registry: ReplicatorRegistry,
    journal: EventJournal,
    node_status: NodeStatusStore,
    verification: VerificationStore,
    publisher: EventPublisher,
    publisher_task: Mutex<Option<JoinHandle<()>>>,
    consumer: EventConsumer,
    sync: Arc<SyncEngine>,
    backfiller: Backfiller,
    reverifier: Reverifier,
    pruner: JournalPruner,
    reporter: MetricsReporter,
    queue: WorkQueue,
    queue_rx: Mutex<Option<SharedReceiver>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<EngineState>,
}

impl GeoEngine {
    /// Build an engine with no external lag signal.
    pub async fn new(config: GeoConfig, registry: ReplicatorRegistry) -> Result<Arc<Self>> {
        Self::with_lag_signal(config, registry, Arc::new(NoLagSignal)).await
    }

    /// Build an engine with a deployment-provided lag signal gating the
    /// pruner.
    pub async fn with_lag_signal(
        config: GeoConfig,
        registry: ReplicatorRegistry,
        lag: Arc<dyn LagSignal>,
    ) -> Result<Arc<Self>> {
        let pool = crate::db::connect(&config.storage).await?;
        let journal = EventJournal::new(pool.clone());
        let node_status = NodeStatusStore::new(pool.clone());
        let verification = VerificationStore::new(pool);

        let (publisher, publisher_task) =
            EventPublisher::spawn(journal.clone(), RetryConfig::default());
        let (queue, queue_rx) = WorkQueue::new();

        let consumer = EventConsumer::new(registry.clone(), verification.clone(), queue.clone());
        let sync = SyncEngine::new(registry.clone(), verification.clone(), &config.sync);
        let backfiller = Backfiller::new(registry.clone(), verification.clone(), &config.backfill);
        let reverifier =
            Reverifier::new(registry.clone(), verification.clone(), &config.reverification);
        let pruner = JournalPruner::new(
            journal.clone(),
            node_status.clone(),
            lag,
            &config.pruner,
        );
        let reporter = MetricsReporter::new(
            journal.clone(),
            node_status.clone(),
            verification.clone(),
            registry.clone(),
            config.metrics_enabled,
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            node_id = %config.node.node_id,
            role = %config.node.role,
            types = registry.len(),
            "Engine built"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            journal,
            node_status,
            verification,
            publisher,
            publisher_task: Mutex::new(Some(publisher_task)),
            consumer,
            sync,
            backfiller,
            reverifier,
            pruner,
            reporter,
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            state: Mutex::new(EngineState::Created),
        }))
    }

    /// Spawn the worker pool and periodic schedulers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != EngineState::Created {
                return Err(GeoError::InvalidState {
                    expected: EngineState::Created.as_str().to_string(),
                    actual: state.as_str().to_string(),
                });
            }
            *state = EngineState::Running;
        }

        self.node_status
            .register_node(&self.config.node.node_id, self.config.node.role)
            .await?;

        let rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| GeoError::Internal("work queue receiver already taken".to_string()))?;

        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks = spawn_workers(
            self.config.workers,
            self.queue.clone(),
            rx,
            Arc::clone(self) as Arc<dyn WorkHandler>,
            RetryConfig::default(),
            shutdown,
        );

        for name in self.registry.names() {
            tasks.push(self.spawn_enqueue_ticker(
                self.config.backfill.interval_duration(),
                WorkItem::BackfillVerification {
                    replicable_type: name.clone(),
                },
            ));
            tasks.push(self.spawn_enqueue_ticker(
                self.config.reverification.interval_duration(),
                WorkItem::ReverifyBatch {
                    replicable_type: name.clone(),
                },
            ));

            // The timeout sweep runs inline; it is one bounded UPDATE
            let engine = Arc::clone(self);
            let sweep_type = name.clone();
            tasks.push(spawn_interval_task(
                self.config.sync.sweep_interval_duration(),
                self.shutdown_tx.subscribe(),
                move || {
                    let engine = Arc::clone(&engine);
                    let sweep_type = sweep_type.clone();
                    async move {
                        if let Err(e) = engine.sync.fail_sync_timeouts(&sweep_type).await {
                            warn!(replicable_type = %sweep_type, error = %e, "Sync timeout sweep failed");
                        }
                    }
                },
            ));
        }

        tasks.push(self.spawn_enqueue_ticker(
            self.config.pruner.interval_duration(),
            WorkItem::PruneJournal,
        ));
        if self.config.metrics_enabled {
            tasks.push(self.spawn_enqueue_ticker(
                self.config.metrics_interval_duration(),
                WorkItem::UpdateMetrics,
            ));
        }

        self.tasks.lock().await.extend(tasks);
        info!(workers = self.config.workers, "Engine started");
        Ok(())
    }

    /// Stop workers and schedulers, flushing queued publications first.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == EngineState::Stopped {
                return Ok(());
            }
            *state = EngineState::Stopped;
        }
        info!("Engine shutting down");

        // Let queued emits reach the journal before stopping anything
        let _ = self.publisher.flush().await;
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        if let Some(task) = self.publisher_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("Engine stopped");
        Ok(())
    }

    /// Publish an event. Returns the correlation id it will carry.
    pub async fn emit(
        &self,
        replicable_type: &str,
        event_name: EventKind,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Result<String> {
        self.publisher
            .emit(replicable_type, event_name, payload, correlation_id)
            .await
    }

    /// Wait until every previously queued publication is durable.
    pub async fn flush_publications(&self) -> Result<()> {
        self.publisher.flush().await
    }

    /// Enqueue a received event for consumption by the worker pool.
    pub async fn deliver_event(&self, event: &Event) -> Result<()> {
        self.queue
            .enqueue(WorkItem::ConsumeEvent {
                replicable_type: event.replicable_type.clone(),
                event_name: event.event_name,
                payload: event.payload.clone(),
                correlation_id: event.correlation_id.clone(),
            })
            .await
    }

    /// Enqueue an arbitrary unit of work.
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.queue.enqueue(item).await
    }

    /// Register a node in the topology feed.
    pub async fn register_node(
        &self,
        node_id: &str,
        role: crate::config::NodeRole,
    ) -> Result<()> {
        self.node_status.register_node(node_id, role).await
    }

    /// Ingest one secondary status report.
    pub async fn upsert_status(&self, status: &NodeStatus) -> Result<()> {
        self.node_status.upsert_status(status).await
    }

    /// Point-in-time replication health.
    pub async fn snapshot(&self) -> Result<StatusSnapshot> {
        self.reporter.snapshot().await
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn verification(&self) -> &VerificationStore {
        &self.verification
    }

    pub fn node_status(&self) -> &NodeStatusStore {
        &self.node_status
    }

    pub fn config(&self) -> &GeoConfig {
        &self.config
    }
}

impl WorkHandler for GeoEngine {
    fn handle(&self, item: WorkItem) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match item {
                WorkItem::ConsumeEvent {
                    replicable_type,
                    event_name,
                    payload,
                    correlation_id,
                } => {
                    self.consumer
                        .consume(&replicable_type, event_name, &payload, &correlation_id)
                        .await
                }
                WorkItem::Sync {
                    replicable_type,
                    resource_id,
                } => {
                    self.sync.sync(&replicable_type, &resource_id).await?;
                    Ok(())
                }
                WorkItem::BackfillVerification { replicable_type } => {
                    self.backfiller.backfill(&replicable_type).await?;
                    Ok(())
                }
                WorkItem::ReverifyBatch { replicable_type } => {
                    self.reverifier.reverify_batch(&replicable_type).await?;
                    Ok(())
                }
                WorkItem::PruneJournal => {
                    self.pruner.prune().await?;
                    Ok(())
                }
                WorkItem::UpdateMetrics => {
                    self.reporter.report().await?;
                    Ok(())
                }
            }
        })
    }
}

impl GeoEngine {
    fn spawn_enqueue_ticker(self: &Arc<Self>, period: Duration, item: WorkItem) -> JoinHandle<()> {
        let queue = self.queue.clone();
        spawn_interval_task(period, self.shutdown_tx.subscribe(), move || {
            let queue = queue.clone();
            let item = item.clone();
            async move {
                let _ = queue.enqueue(item).await;
            }
        })
    }
}

fn spawn_interval_task<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup is quiet
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => task().await,
            }
        }
    })
}
