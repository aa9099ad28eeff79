//! In-memory replicator descriptor for tests.
//!
//! Models both sides of a transfer: `resources` is what the authoritative
//! node holds, `local` is the copy a successful transfer leaves behind.
//! Tests can corrupt either side, fail transfers per resource, and
//! inspect which resources were transferred.

use geo_replication::registry::{BoxFuture, ReplicatorDescriptor, TransferredCopy};
use geo_replication::sync::compute_checksum;
use geo_replication::{GeoError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    /// Authoritative bytes per resource id.
    resources: HashMap<String, Vec<u8>>,
    /// Local copy left behind by the last successful transfer.
    local: HashMap<String, Vec<u8>>,
    /// Resources whose transfer fails with a retryable error.
    fail_transfers: HashSet<String>,
    /// Resources whose shipped checksum deliberately disagrees with the
    /// shipped bytes.
    corrupt_shipped_checksum: HashSet<String>,
    transfer_log: Vec<String>,
}

pub struct MemoryReplicator {
    name: String,
    verifiable: bool,
    reverification_batches: AtomicU64,
    sync_timeout: Option<Duration>,
    inner: Mutex<Inner>,
}

impl MemoryReplicator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            verifiable: true,
            reverification_batches: AtomicU64::new(10),
            sync_timeout: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn non_verifiable(mut self) -> Self {
        self.verifiable = false;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    pub fn set_reverification_batches(&self, batches: u64) {
        self.reverification_batches.store(batches, Ordering::SeqCst);
    }

    /// Add (or replace) an authoritative resource.
    pub fn insert_resource(&self, resource_id: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.resources.insert(resource_id.to_string(), bytes.to_vec());
    }

    /// Remove a resource from the authoritative scope.
    pub fn remove_resource(&self, resource_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.resources.remove(resource_id);
    }

    /// Overwrite the local copy, simulating rot after a verified sync.
    pub fn corrupt_local(&self, resource_id: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.local.insert(resource_id.to_string(), bytes.to_vec());
    }

    /// Make the authoritative side ship a checksum that does not match
    /// the bytes it ships.
    pub fn corrupt_shipped_checksum(&self, resource_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.corrupt_shipped_checksum.insert(resource_id.to_string());
    }

    pub fn fail_transfer(&self, resource_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_transfers.insert(resource_id.to_string());
    }

    pub fn heal_transfer(&self, resource_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_transfers.remove(resource_id);
    }

    pub fn transfer_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().transfer_log.clone()
    }

    pub fn transfer_count(&self, resource_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .transfer_log
            .iter()
            .filter(|id| id.as_str() == resource_id)
            .count()
    }

    pub fn local_bytes(&self, resource_id: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().local.get(resource_id).cloned()
    }
}

impl ReplicatorDescriptor for MemoryReplicator {
    fn name(&self) -> &str {
        &self.name
    }

    fn verifiable(&self) -> bool {
        self.verifiable
    }

    fn model_scope(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .resources
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Box::pin(async move { Ok(ids) })
    }

    fn transfer<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<TransferredCopy>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.transfer_log.push(resource_id.to_string());

            if inner.fail_transfers.contains(resource_id) {
                return Err(GeoError::transfer(&self.name, resource_id, "connection reset"));
            }
            let bytes = inner
                .resources
                .get(resource_id)
                .cloned()
                .ok_or_else(|| GeoError::transfer(&self.name, resource_id, "not found upstream"))?;

            let expected_checksum = if inner.corrupt_shipped_checksum.contains(resource_id) {
                Some("deadbeef".to_string())
            } else {
                Some(compute_checksum(&bytes))
            };

            inner.local.insert(resource_id.to_string(), bytes.clone());
            Ok(TransferredCopy {
                bytes,
                expected_checksum,
            })
        })
    }

    fn checksum<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner
                .local
                .get(resource_id)
                .map(|bytes| compute_checksum(bytes))
                .ok_or_else(|| GeoError::Replicator(format!("no local copy of {}", resource_id)))
        })
    }

    fn remaining_reverification_batch_count(&self) -> u64 {
        self.reverification_batches.load(Ordering::SeqCst)
    }

    fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout
    }
}
