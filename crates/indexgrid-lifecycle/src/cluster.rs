//! Cluster-info cache and bucket verification.
//!
//! The cluster manager is behind the [`ClusterInfo`] trait: it answers
//! bucket-UUID lookups and hands out a snapshot of this node's service
//! addresses. `Fetch` is the one shared resource that needs mutual
//! exclusion, so the cache serializes refreshes behind a mutex.

use std::sync::{Arc, Mutex};

use crate::error::{LifecycleError, LifecycleResult};

/// A snapshot of this node's cluster-level info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub scan_addr: String,
    pub http_addr: String,
    pub admin_addr: String,
    pub node_addr: String,
    pub server_group: String,
    pub cluster_version: u64,
}

/// Access to the cluster manager. Calls may block.
pub trait ClusterInfo: Send + Sync {
    /// Refresh and return this node's cluster info.
    fn fetch(&self) -> LifecycleResult<ClusterSnapshot>;

    /// Current UUID of a bucket.
    ///
    /// Returns [`indexgrid_meta::BUCKET_UUID_NIL`] when the bucket
    /// does not exist but the cluster is reachable; `Err` when the
    /// cluster cannot be reached at all.
    fn bucket_uuid(&self, bucket: &str) -> LifecycleResult<String>;
}

/// Serializes cluster-info refreshes.
#[derive(Clone)]
pub struct ClusterInfoCache {
    provider: Arc<dyn ClusterInfo>,
    fetch_lock: Arc<Mutex<()>>,
}

impl ClusterInfoCache {
    pub fn new(provider: Arc<dyn ClusterInfo>) -> Self {
        ClusterInfoCache {
            provider,
            fetch_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Refresh under the fetch lock and return the snapshot.
    pub fn fetch(&self) -> LifecycleResult<ClusterSnapshot> {
        let _guard = self
            .fetch_lock
            .lock()
            .map_err(|_| LifecycleError::ClusterInfo("fetch lock poisoned".to_string()))?;
        self.provider.fetch()
    }

    /// Current UUID of a bucket, without retries.
    pub fn bucket_uuid(&self, bucket: &str) -> LifecycleResult<String> {
        self.provider.bucket_uuid(bucket)
    }
}
