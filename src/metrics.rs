//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Event publication and consumption
//! - Sync outcomes and durations
//! - Verification backlog and backfill activity
//! - Journal size and per-secondary cursor lag
//! - Pruner decisions
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `geo_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Recording is always cheap: with no recorder installed the macros are
//! no-ops. The engine only schedules the periodic gauge snapshot when
//! `metrics_enabled` is set; counters on hot paths are recorded
//! unconditionally.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an event appended to the journal.
pub fn record_event_published(replicable_type: &str, event_name: &str) {
    counter!("geo_events_published_total", "replicable_type" => replicable_type.to_string(), "event_name" => event_name.to_string()).increment(1);
}

/// Record an event consumed on a secondary.
pub fn record_event_consumed(replicable_type: &str, event_name: &str) {
    counter!("geo_events_consumed_total", "replicable_type" => replicable_type.to_string(), "event_name" => event_name.to_string()).increment(1);
}

/// Record a consumption rejected because no descriptor knows the type.
pub fn record_unknown_replicable_type(replicable_type: &str) {
    counter!("geo_unknown_replicable_type_total", "replicable_type" => replicable_type.to_string()).increment(1);
}

/// Record a sync attempt outcome.
pub fn record_sync_result(replicable_type: &str, outcome: &str) {
    counter!("geo_syncs_total", "replicable_type" => replicable_type.to_string(), "outcome" => outcome.to_string()).increment(1);
}

/// Record how long a sync took end to end.
pub fn record_sync_duration(replicable_type: &str, duration: Duration) {
    histogram!("geo_sync_duration_seconds", "replicable_type" => replicable_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record in-flight syncs swept to failed by the timeout sweep.
pub fn record_sync_timeouts_failed(replicable_type: &str, count: u64) {
    if count > 0 {
        counter!("geo_sync_timeouts_failed_total", "replicable_type" => replicable_type.to_string()).increment(count);
    }
}

/// Record a backfill cycle's reconciliation work.
pub fn record_backfill(replicable_type: &str, created: u64, deleted: u64, duration: Duration) {
    let t = replicable_type.to_string();
    counter!("geo_backfill_cycles_total", "replicable_type" => t.clone()).increment(1);
    counter!("geo_backfill_rows_created_total", "replicable_type" => t.clone()).increment(created);
    counter!("geo_backfill_rows_deleted_total", "replicable_type" => t.clone()).increment(deleted);
    histogram!("geo_backfill_duration_seconds", "replicable_type" => t)
        .record(duration.as_secs_f64());
}

/// Record a reverification batch outcome.
pub fn record_reverification(replicable_type: &str, checked: u64, drifted: u64) {
    let t = replicable_type.to_string();
    counter!("geo_reverification_checked_total", "replicable_type" => t.clone()).increment(checked);
    if drifted > 0 {
        counter!("geo_reverification_drift_total", "replicable_type" => t).increment(drifted);
    }
}

/// Record a pruner cycle decision.
pub fn record_prune_outcome(outcome: &str) {
    counter!("geo_prune_cycles_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record events removed by a prune.
pub fn record_events_pruned(count: u64) {
    counter!("geo_events_pruned_total").increment(count);
}

/// Record a SQLite write retried on SQLITE_BUSY/SQLITE_LOCKED.
pub fn record_storage_retry(operation: &str) {
    counter!("geo_storage_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a unit of work re-enqueued after a retryable failure.
pub fn record_work_retry(kind: &str) {
    counter!("geo_work_retries_total", "kind" => kind.to_string()).increment(1);
}

/// Record a unit of work dropped after exhausting retries.
pub fn record_work_dropped(kind: &str) {
    counter!("geo_work_dropped_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for the number of events currently retained in the journal.
pub fn set_journal_events(count: u64) {
    gauge!("geo_journal_events").set(count as f64);
}

/// Gauge for one secondary's cursor lag in events behind the journal head.
pub fn set_cursor_lag(node_id: &str, lag_events: u64) {
    gauge!("geo_cursor_lag_events", "node_id" => node_id.to_string()).set(lag_events as f64);
}

/// Gauges for one type's verification backlog by state.
pub fn set_verification_backlog(replicable_type: &str, pending: u64, verified: u64, failed: u64) {
    let t = replicable_type.to_string();
    gauge!("geo_verification_pending", "replicable_type" => t.clone()).set(pending as f64);
    gauge!("geo_verification_verified", "replicable_type" => t.clone()).set(verified as f64);
    gauge!("geo_verification_failed", "replicable_type" => t).set(failed as f64);
}
