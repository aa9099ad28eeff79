//! # Geo Replication
//!
//! A replication and verification core for keeping read-mostly secondary
//! nodes eventually consistent with a primary across a wide-area link.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                            geo-replication                             │
//! │                                                                        │
//! │  ┌────────────┐    ┌───────────────┐    ┌───────────────────────────┐  │
//! │  │ Publisher  │───►│ Event Journal │───►│ Consumer + Sync Engine    │  │
//! │  │ (primary)  │    │ (SQLite)      │    │ (checksum verification)   │  │
//! │  └────────────┘    └───────────────┘    └───────────────────────────┘  │
//! │         │                  ▲                          │                │
//! │         ▼                  │                          ▼                │
//! │  ┌────────────┐    ┌───────────────┐    ┌───────────────────────────┐  │
//! │  │ NodeStatus │───►│ JournalPruner │    │ Backfill + Reverification │  │
//! │  │ feed rows  │    │ (low-water)   │    │ (periodic reconciliation) │  │
//! │  └────────────┘    └───────────────┘    └───────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Consistency
//!
//! 1. **Event path**: primary-side mutations become journal entries; worker
//!    pools on secondaries consume them and enqueue per-resource syncs.
//! 2. **Reconciliation path**: periodic backfill and reverification close
//!    drift the event path missed (lost events, silent corruption).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use geo_replication::{GeoConfig, GeoEngine, ReplicatorRegistry, NoOpReplicator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = ReplicatorRegistry::new();
//!     registry.register(Arc::new(NoOpReplicator::new("snippets")));
//!
//!     let config = GeoConfig::default();
//!     let engine = GeoEngine::new(config, registry).await.expect("init");
//!     engine.start().await.expect("start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await.expect("shutdown");
//! }
//! ```

pub mod backfill;
pub mod config;
pub mod consume;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod journal;
pub mod metrics;
pub mod node_status;
pub mod pruner;
pub mod publish;
pub mod registry;
pub mod resilience;
pub mod reverify;
pub mod status;
pub mod sync;
pub mod verification;
pub mod worker;

// Re-exports for convenience
pub use config::{GeoConfig, NodeContext, NodeRole, PrunerConfig, SyncConfig};
pub use engine::GeoEngine;
pub use error::{GeoError, Result};
pub use event::{Event, EventKind};
pub use journal::EventJournal;
pub use node_status::{NodeStatus, NodeStatusStore};
pub use pruner::{JournalPruner, LagSignal, PruneOutcome};
pub use registry::{NoOpReplicator, ReplicatorDescriptor, ReplicatorRegistry, TransferredCopy};
pub use status::{MetricsReporter, StatusSnapshot};
pub use sync::{SyncEngine, SyncOutcome};
pub use verification::{VerificationState, VerificationStore};
pub use worker::{WorkItem, WorkQueue};
