//! Configuration for the replication core.
//!
//! All configuration is passed to [`GeoEngine::new()`](crate::GeoEngine::new)
//! at construction; there is no global toggle store. Configuration can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use geo_replication::config::{GeoConfig, NodeContext, NodeRole};
//!
//! let config = GeoConfig {
//!     node: NodeContext::new("eu.node.frankfurt-1", NodeRole::Secondary),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! GeoConfig
//! ├── node: NodeContext            # This node's identity and role
//! ├── storage: StorageConfig       # SQLite database location
//! ├── sync: SyncConfig             # Lease TTL, transfer concurrency, timeouts
//! ├── backfill: BackfillConfig     # Batch sizes, interval
//! ├── reverification: ReverificationConfig
//! ├── pruner: PrunerConfig         # Freshness threshold, interval
//! ├── workers: usize               # Worker pool size
//! ├── metrics_interval: String     # Status snapshot cadence
//! └── metrics_enabled: bool        # Status snapshot gauge publication
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node:
//!   node_id: "eu.node.frankfurt-1"
//!   role: "secondary"
//!
//! sync:
//!   max_concurrent_transfers: 10
//!   sync_timeout: "1h"
//!
//! pruner:
//!   status_freshness: "10m"
//!   interval: "5m"
//!
//! metrics_interval: "1m"
//! metrics_enabled: true
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// NodeContext: explicit node identity, passed at construction
// ═══════════════════════════════════════════════════════════════════════════════

/// The role a node plays in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Originates domain mutations and publishes events.
    Primary,
    /// Consumes events and maintains a replicated copy.
    Secondary,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit identity of the node running this engine.
///
/// Passed into every component at construction; nothing in the core reads
/// ambient/global state to learn which node it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContext {
    /// Unique identifier for this node.
    pub node_id: String,
    /// Whether this node publishes events (primary) or consumes them.
    pub role: NodeRole,
}

impl NodeContext {
    pub fn new(node_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            role,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new("local.dev.node.default", NodeRole::Primary)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to GeoEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `GeoEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Identity and role of the local node.
    #[serde(default)]
    pub node: NodeContext,

    /// SQLite persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Sync engine settings (leases, transfer concurrency, timeouts).
    #[serde(default)]
    pub sync: SyncConfig,

    /// Verification backfill settings.
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Reverification scheduler settings.
    #[serde(default)]
    pub reverification: ReverificationConfig,

    /// Journal pruner settings.
    #[serde(default)]
    pub pruner: PrunerConfig,

    /// Number of worker tasks pulling from the work queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How often the metrics reporter publishes a status snapshot.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: String,

    /// Whether the metrics reporter publishes status snapshot gauges.
    ///
    /// Disabling this never affects replication correctness; recording of
    /// low-level counters is unconditional and cheap.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            node: NodeContext::default(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            backfill: BackfillConfig::default(),
            reverification: ReverificationConfig::default(),
            pruner: PrunerConfig::default(),
            workers: default_workers(),
            metrics_interval: default_metrics_interval(),
            metrics_enabled: default_true(),
        }
    }
}

impl GeoConfig {
    /// Create a minimal config for testing: in-memory SQLite, tight
    /// intervals, metrics snapshot disabled.
    pub fn for_testing(node_id: &str, role: NodeRole) -> Self {
        Self {
            node: NodeContext::new(node_id, role),
            storage: StorageConfig::in_memory(),
            workers: 2,
            metrics_enabled: false,
            ..Default::default()
        }
    }

    pub fn metrics_interval_duration(&self) -> Duration {
        parse_duration_or(&self.metrics_interval, Duration::from_secs(60))
    }
}

fn default_workers() -> usize {
    4
}

fn default_metrics_interval() -> String {
    "1m".to_string()
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite persistence settings.
///
/// The journal, node status rows, and verification state all live in one
/// database so the range delete in the pruner and its low-water-mark read
/// see a single consistent store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database, or `":memory:"` for tests.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended for on-disk databases).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "geo_replication.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum concurrent resource transfers (bulkhead size).
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// How long an advisory lease on a resource is held before it expires
    /// and the resource becomes eligible for retry by another worker.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    /// In-flight syncs stuck longer than this are swept to `failed` by the
    /// periodic timeout sweep, unless the descriptor overrides the timeout.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: String,

    /// How often the timeout sweep runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

fn default_max_concurrent_transfers() -> usize {
    10
}

fn default_lease_ttl() -> String {
    "5m".to_string()
}

fn default_sync_timeout() -> String {
    "1h".to_string()
}

fn default_sweep_interval() -> String {
    "10m".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 10,
            lease_ttl: "5m".to_string(),
            sync_timeout: "1h".to_string(),
            sweep_interval: "10m".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn lease_ttl_duration(&self) -> Duration {
        parse_duration_or(&self.lease_ttl, Duration::from_secs(300))
    }

    pub fn sync_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.sync_timeout, Duration::from_secs(3600))
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        parse_duration_or(&self.sweep_interval, Duration::from_secs(600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackfillConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Verification backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Rows created/deleted per write statement. Bounds transaction size
    /// so backfill keeps steady memory and IO regardless of scope size.
    #[serde(default = "default_backfill_batch_size")]
    pub batch_size: usize,

    /// How often the backfill reconciliation runs per replicable type.
    #[serde(default = "default_backfill_interval")]
    pub interval: String,
}

fn default_backfill_batch_size() -> usize {
    1000
}

fn default_backfill_interval() -> String {
    "1m".to_string()
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            interval: "1m".to_string(),
        }
    }
}

impl BackfillConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReverificationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Reverification scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverificationConfig {
    /// Verified rows re-checksummed per batch.
    #[serde(default = "default_reverify_batch_size")]
    pub batch_size: usize,

    /// A verified row becomes due for reverification this long after its
    /// last successful check.
    #[serde(default = "default_reverify_after")]
    pub reverify_after: String,

    /// How often the scheduler wakes up per replicable type.
    #[serde(default = "default_reverify_interval")]
    pub interval: String,
}

fn default_reverify_batch_size() -> usize {
    100
}

fn default_reverify_after() -> String {
    "7d".to_string()
}

fn default_reverify_interval() -> String {
    "1m".to_string()
}

impl Default for ReverificationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            reverify_after: "7d".to_string(),
            interval: "1m".to_string(),
        }
    }
}

impl ReverificationConfig {
    pub fn reverify_after_duration(&self) -> Duration {
        parse_duration_or(&self.reverify_after, Duration::from_secs(7 * 24 * 3600))
    }

    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PrunerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Journal pruner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunerConfig {
    /// A secondary's status row older than this cannot be trusted as a
    /// lower bound; the cycle aborts without deleting anything.
    #[serde(default = "default_status_freshness")]
    pub status_freshness: String,

    /// How often a prune cycle runs.
    #[serde(default = "default_prune_interval")]
    pub interval: String,
}

fn default_status_freshness() -> String {
    "10m".to_string()
}

fn default_prune_interval() -> String {
    "5m".to_string()
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            status_freshness: "10m".to_string(),
            interval: "5m".to_string(),
        }
    }
}

impl PrunerConfig {
    pub fn status_freshness_duration(&self) -> Duration {
        parse_duration_or(&self.status_freshness, Duration::from_secs(600))
    }

    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(300))
    }
}

/// Parse a humantime duration string, falling back to a default.
fn parse_duration_or(s: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(s).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
