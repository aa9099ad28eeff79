// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator descriptors and the type registry.
//!
//! A [`ReplicatorDescriptor`] is the per-type capability bundle the engine
//! calls into for everything domain-specific: enumerating the
//! authoritative scope, transferring a resource's bytes, recomputing a
//! checksum. The engine itself stays generic over types.
//!
//! The registry is an explicit map passed at construction. Nothing is
//! discovered through global state; a type the registry does not know is a
//! hard, non-retryable error surfaced as deploy-version skew.

use crate::error::{GeoError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Boxed future type for descriptor capabilities.
pub use futures::future::BoxFuture;

/// A resource's bytes as fetched from the authoritative node.
#[derive(Debug, Clone)]
pub struct TransferredCopy {
    pub bytes: Vec<u8>,
    /// Checksum the authoritative side computed for these bytes, when it
    /// ships one. Compared against the locally computed checksum.
    pub expected_checksum: Option<String>,
}

/// Per-type capabilities a replicable type plugs into the engine.
pub trait ReplicatorDescriptor: Send + Sync {
    /// Registry key, e.g. `"snippets"`.
    fn name(&self) -> &str;

    /// Whether resources of this type carry verifiable checksums. Types
    /// that return `false` are synced but never checksum-verified.
    fn verifiable(&self) -> bool {
        true
    }

    /// The authoritative set of resource ids for this type.
    fn model_scope(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Fetch one resource's bytes from the authoritative node.
    fn transfer<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<TransferredCopy>>;

    /// Recompute the checksum of the local copy of a resource.
    fn checksum<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<String>>;

    /// How many reverification batches this type still has capacity for
    /// in the current cycle. The scheduler stops when this reaches zero.
    fn remaining_reverification_batch_count(&self) -> u64 {
        1
    }

    /// Per-type override for how long a sync may stay in flight before
    /// the sweep fails it. `None` uses the configured `sync.sync_timeout`.
    fn sync_timeout(&self) -> Option<Duration> {
        None
    }
}

impl std::fmt::Debug for dyn ReplicatorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorDescriptor")
            .field("name", &self.name())
            .finish()
    }
}

/// Explicit map of replicable type name to descriptor.
#[derive(Clone, Default)]
pub struct ReplicatorRegistry {
    descriptors: HashMap<String, Arc<dyn ReplicatorDescriptor>>,
}

impl ReplicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its own name. Replaces any previous
    /// descriptor for the same name.
    pub fn register(&mut self, descriptor: Arc<dyn ReplicatorDescriptor>) {
        self.descriptors
            .insert(descriptor.name().to_string(), descriptor);
    }

    /// Look up a descriptor, failing fast on unknown types.
    pub fn get(&self, replicable_type: &str) -> Result<Arc<dyn ReplicatorDescriptor>> {
        self.descriptors
            .get(replicable_type)
            .cloned()
            .ok_or_else(|| GeoError::UnknownReplicableType(replicable_type.to_string()))
    }

    /// All registered type names, sorted for stable iteration.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.descriptors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Descriptor that logs instead of moving data.
///
/// Useful in tests and as a placeholder while wiring a new type through
/// configuration before its real transfer strategy exists.
pub struct NoOpReplicator {
    name: String,
}

impl NoOpReplicator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ReplicatorDescriptor for NoOpReplicator {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_scope(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            info!(replicable_type = %self.name, "NoOp replicator: empty model scope");
            Ok(Vec::new())
        })
    }

    fn transfer<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<TransferredCopy>> {
        Box::pin(async move {
            info!(
                replicable_type = %self.name,
                resource_id,
                "NoOp replicator: would transfer"
            );
            Ok(TransferredCopy {
                bytes: Vec::new(),
                expected_checksum: None,
            })
        })
    }

    fn checksum<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            info!(
                replicable_type = %self.name,
                resource_id,
                "NoOp replicator: would checksum"
            );
            Ok(String::new())
        })
    }

    fn remaining_reverification_batch_count(&self) -> u64 {
        0
    }
}
