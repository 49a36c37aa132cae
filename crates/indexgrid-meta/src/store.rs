//! MetadataRepo — redb-backed persistence for index metadata.
//!
//! Stores index definitions, per-bucket topology blobs, and the small
//! node-local / broadcast records. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The repo supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Topology blobs are cached in memory; a failed topology write purges
//! the cached copy so the next read goes back to disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use redb::{Database, ReadableTable};
use tracing::debug;

use crate::error::{MetaError, MetaResult};
use crate::tables::*;
use crate::topology::BucketTopology;
use crate::types::*;

/// Convert any `Display` error into a `MetaError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| MetaError::$variant(e.to_string())
    };
}

/// Thread-safe metadata repository backed by redb.
#[derive(Clone)]
pub struct MetadataRepo {
    db: Arc<Database>,
    topology_cache: Arc<Mutex<HashMap<String, BucketTopology>>>,
}

impl MetadataRepo {
    /// Open (or create) a persistent repository at the given path.
    pub fn open(path: &Path) -> MetaResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let repo = Self {
            db: Arc::new(db),
            topology_cache: Arc::new(Mutex::new(HashMap::new())),
        };
        repo.ensure_tables()?;
        debug!(?path, "metadata repository opened");
        Ok(repo)
    }

    /// Create an ephemeral in-memory repository (for testing).
    pub fn open_in_memory() -> MetaResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let repo = Self {
            db: Arc::new(db),
            topology_cache: Arc::new(Mutex::new(HashMap::new())),
        };
        repo.ensure_tables()?;
        debug!("in-memory metadata repository opened");
        Ok(repo)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> MetaResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        txn.open_table(TOPOLOGIES).map_err(map_err!(Table))?;
        txn.open_table(LOCAL).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Persist a new index definition. Fails if a definition with the
    /// same id already exists.
    pub fn create_defn(&self, defn: &IndexDefinition) -> MetaResult<()> {
        if self.defn(defn.defn_id)?.is_some() {
            return Err(MetaError::DuplicateDefinition(defn.defn_id));
        }
        self.write_defn(defn)?;
        debug!(defn_id = defn.defn_id, bucket = %defn.bucket, name = %defn.name, "definition stored");
        Ok(())
    }

    /// Overwrite an existing definition record (storage-mode reset).
    pub fn update_defn(&self, defn: &IndexDefinition) -> MetaResult<()> {
        self.write_defn(defn)
    }

    fn write_defn(&self, defn: &IndexDefinition) -> MetaResult<()> {
        let value = serde_json::to_vec(defn).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
            table
                .insert(defn.defn_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a definition by id.
    pub fn defn(&self, defn_id: DefnId) -> MetaResult<Option<IndexDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        match table.get(defn_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let defn: IndexDefinition =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(defn))
            }
            None => Ok(None),
        }
    }

    /// Find a definition by (bucket, name).
    pub fn defn_by_name(&self, bucket: &str, name: &str) -> MetaResult<Option<IndexDefinition>> {
        for defn in self.iter_defns()? {
            if defn.bucket == bucket && defn.name == name {
                return Ok(Some(defn));
            }
        }
        Ok(None)
    }

    /// Delete a definition record. Returns true if it existed.
    pub fn drop_defn(&self, defn_id: DefnId) -> MetaResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
            existed = table.remove(defn_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All definitions, in id order.
    pub fn iter_defns(&self) -> MetaResult<Vec<IndexDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let defn: IndexDefinition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(defn);
        }
        Ok(results)
    }

    // ── Topologies ─────────────────────────────────────────────────

    /// Read the topology blob for a bucket, through the cache.
    pub fn topology(&self, bucket: &str) -> MetaResult<Option<BucketTopology>> {
        {
            let cache = self.topology_cache.lock().expect("topology cache poisoned");
            if let Some(t) = cache.get(bucket) {
                return Ok(Some(t.clone()));
            }
        }

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TOPOLOGIES).map_err(map_err!(Table))?;
        match table.get(bucket).map_err(map_err!(Read))? {
            Some(guard) => {
                let topology: BucketTopology =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                let mut cache = self.topology_cache.lock().expect("topology cache poisoned");
                cache.insert(bucket.to_string(), topology.clone());
                Ok(Some(topology))
            }
            None => Ok(None),
        }
    }

    /// Write the topology blob for a bucket. The write is atomic per
    /// bucket; on failure the cached copy is purged.
    pub fn set_topology(&self, bucket: &str, topology: &BucketTopology) -> MetaResult<()> {
        let result = self.write_topology(bucket, topology);
        let mut cache = self.topology_cache.lock().expect("topology cache poisoned");
        match &result {
            Ok(()) => {
                cache.insert(bucket.to_string(), topology.clone());
            }
            Err(_) => {
                cache.remove(bucket);
            }
        }
        result
    }

    fn write_topology(&self, bucket: &str, topology: &BucketTopology) -> MetaResult<()> {
        let value = serde_json::to_vec(topology).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TOPOLOGIES).map_err(map_err!(Table))?;
            table
                .insert(bucket, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Append a new instance to a bucket's topology, creating the blob
    /// on first use.
    #[allow(clippy::too_many_arguments)]
    pub fn add_instance_to_topology(
        &self,
        defn: &IndexDefinition,
        inst_id: InstId,
        real_inst_id: InstId,
        replica_id: i32,
        partitions: &[PartitionId],
        versions: &[u64],
        num_partitions: u32,
        scheduled: bool,
    ) -> MetaResult<()> {
        let indexer_id = self.local_indexer_id().unwrap_or_default();
        let mut topology = self
            .topology(&defn.bucket)?
            .unwrap_or_else(|| BucketTopology::new(&defn.bucket));
        topology.add_instance(
            defn.defn_id,
            inst_id,
            real_inst_id,
            replica_id,
            partitions,
            versions,
            num_partitions,
            defn.using.as_str(),
            scheduled,
            &indexer_id,
        );
        self.set_topology(&defn.bucket, &topology)
    }

    /// Remove a definition reference from a bucket's topology.
    pub fn remove_defn_from_topology(&self, bucket: &str, defn_id: DefnId) -> MetaResult<()> {
        if let Some(mut topology) = self.topology(bucket)? {
            if topology.remove_defn(defn_id) {
                return self.set_topology(bucket, &topology);
            }
        }
        Ok(())
    }

    /// Remove one instance from a bucket's topology.
    pub fn remove_instance_from_topology(
        &self,
        bucket: &str,
        defn_id: DefnId,
        inst_id: InstId,
    ) -> MetaResult<()> {
        if let Some(mut topology) = self.topology(bucket)? {
            if topology.remove_instance(defn_id, inst_id) {
                return self.set_topology(bucket, &topology);
            }
        }
        Ok(())
    }

    /// Atomically split partitions out of an instance into a new proxy.
    pub fn split_partitions(
        &self,
        bucket: &str,
        defn_id: DefnId,
        inst_id: InstId,
        proxy_inst_id: InstId,
        partitions: &[PartitionId],
    ) -> MetaResult<()> {
        if let Some(mut topology) = self.topology(bucket)? {
            if topology.split_partitions(defn_id, inst_id, proxy_inst_id, partitions) {
                return self.set_topology(bucket, &topology);
            }
        }
        Ok(())
    }

    /// Atomically move partitions between instances of one definition.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_partitions(
        &self,
        indexer_id: &str,
        bucket: &str,
        defn_id: DefnId,
        src_inst_id: InstId,
        src_rstate: RebalanceState,
        tgt_inst_id: InstId,
        tgt_inst_version: u64,
        partitions: &[PartitionId],
        versions: &[u64],
    ) -> MetaResult<()> {
        if let Some(mut topology) = self.topology(bucket)? {
            topology.merge_partitions(
                indexer_id,
                defn_id,
                src_inst_id,
                src_rstate,
                tgt_inst_id,
                tgt_inst_version,
                partitions,
                versions,
            );
            return self.set_topology(bucket, &topology);
        }
        Ok(())
    }

    // ── Local records & broadcast ──────────────────────────────────

    /// This node's indexer id. Missing until bootstrap has run.
    pub fn local_indexer_id(&self) -> MetaResult<String> {
        self.read_local(INDEXER_ID_KEY)?
            .ok_or(MetaError::MissingLocal(INDEXER_ID_KEY))
    }

    pub fn set_local_indexer_id(&self, id: &str) -> MetaResult<()> {
        self.write_local(INDEXER_ID_KEY, id.as_bytes())
    }

    /// This node's UUID. Missing until bootstrap has run.
    pub fn local_node_uuid(&self) -> MetaResult<String> {
        self.read_local(NODE_UUID_KEY)?
            .ok_or(MetaError::MissingLocal(NODE_UUID_KEY))
    }

    pub fn set_local_node_uuid(&self, uuid: &str) -> MetaResult<()> {
        self.write_local(NODE_UUID_KEY, uuid.as_bytes())
    }

    /// Publish the node's service map to the repository broadcast.
    pub fn broadcast_service_map(&self, map: &ServiceMap) -> MetaResult<()> {
        let value = serde_json::to_vec(map).map_err(map_err!(Serialize))?;
        self.write_local(SERVICE_MAP_KEY, &value)
    }

    /// The most recently broadcast service map, if any.
    pub fn last_service_map(&self) -> MetaResult<Option<ServiceMap>> {
        match self.read_local(SERVICE_MAP_KEY)? {
            Some(s) => {
                let map = serde_json::from_str(&s).map_err(map_err!(Deserialize))?;
                Ok(Some(map))
            }
            None => Ok(None),
        }
    }

    /// Publish filtered index stats to the repository broadcast.
    pub fn broadcast_stats(&self, stats: &IndexStats) -> MetaResult<()> {
        let value = serde_json::to_vec(stats).map_err(map_err!(Serialize))?;
        self.write_local(INDEX_STATS_KEY, &value)
    }

    /// The most recently broadcast stats, if any.
    pub fn last_stats(&self) -> MetaResult<Option<IndexStats>> {
        match self.read_local(INDEX_STATS_KEY)? {
            Some(s) => {
                let stats = serde_json::from_str(&s).map_err(map_err!(Deserialize))?;
                Ok(Some(stats))
            }
            None => Ok(None),
        }
    }

    fn write_local(&self, key: &str, value: &[u8]) -> MetaResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCAL).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read_local(&self, key: &str) -> MetaResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCAL).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(String::from_utf8_lossy(guard.value()).into_owned())),
            None => Ok(None),
        }
    }
}
