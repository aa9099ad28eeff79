// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication events.
//!
//! An [`Event`] is one durable journal entry describing a mutation that
//! secondaries must eventually apply. Events are immutable once written:
//! the journal only appends them and later bulk-deletes them below the
//! quorum-safe low-water mark.
//!
//! # Correlation IDs
//!
//! Every event carries a correlation id so a mutation can be traced end to
//! end across nodes. When the caller has no ambient id (background work
//! with no inbound request), a fresh UUID is generated at publication.

use serde::{Deserialize, Serialize};

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// Periodic maintenance signal; consumed as a resync trigger.
    Housekeeping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Housekeeping => "housekeeping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "housekeeping" => Some(Self::Housekeeping),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable replication event.
///
/// `id` is assigned by the journal on append: strictly increasing,
/// contiguous in insertion order, never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic journal id.
    pub id: i64,
    /// Replicable type name this event applies to.
    pub replicable_type: String,
    /// Kind of mutation.
    pub event_name: EventKind,
    /// Opaque payload map. Must contain a `resource_id` entry for
    /// resource-scoped events.
    pub payload: serde_json::Value,
    /// End-to-end trace id.
    pub correlation_id: String,
    /// Append time, unix millis.
    pub created_at: i64,
}

impl Event {
    /// Extract the resource id from the payload, if present.
    pub fn resource_id(&self) -> Option<&str> {
        self.payload.get("resource_id").and_then(|v| v.as_str())
    }
}

/// Build a minimal resource-scoped payload.
pub fn resource_payload(resource_id: &str) -> serde_json::Value {
    serde_json::json!({ "resource_id": resource_id })
}

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
