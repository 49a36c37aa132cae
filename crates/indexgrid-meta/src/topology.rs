//! Per-bucket topology blob.
//!
//! A `BucketTopology` enumerates every index definition on a bucket
//! together with its instance distributions and their partitions. The
//! whole blob is the atomic unit of persistence: the repository reads
//! it, the lifecycle manager mutates it in place, and the repository
//! writes it back in one shot.
//!
//! Mutators return `true` when they changed anything, so callers can
//! skip the topology write when a request was a no-op.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{
    DefnId, IndexState, InstId, PartitionId, RebalanceState, StreamId,
};

/// One partition held by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRef {
    pub part_id: PartitionId,
    /// Monotone per rebalance generation.
    pub version: u64,
}

/// One index instance as recorded in the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInstRef {
    pub inst_id: InstId,
    /// Non-zero means this instance is a proxy over the real one.
    #[serde(default)]
    pub real_inst_id: InstId,
    #[serde(default)]
    pub replica_id: i32,
    pub state: IndexState,
    #[serde(default)]
    pub rstate: RebalanceState,
    #[serde(default)]
    pub stream: StreamId,
    #[serde(default)]
    pub error: String,
    /// Pending intent to build; cleared once the state advances past
    /// `Ready`.
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub storage_mode: String,
    #[serde(default)]
    pub old_storage_mode: String,
    /// Instance version, monotone per rebalance generation.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub num_partitions: u32,
    pub partitions: Vec<PartitionRef>,
    /// Host indexer that placed the most recent partitions.
    #[serde(default)]
    pub indexer_id: String,
}

/// A definition reference inside the topology blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefnRef {
    pub defn_id: DefnId,
    pub instances: Vec<IndexInstRef>,
}

/// The per-bucket topology blob.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BucketTopology {
    pub bucket: String,
    pub definitions: Vec<IndexDefnRef>,
}

impl BucketTopology {
    pub fn new(bucket: &str) -> Self {
        BucketTopology {
            bucket: bucket.to_string(),
            definitions: Vec::new(),
        }
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// All instances of a definition, cloned out of the blob.
    pub fn instances_by_defn(&self, defn_id: DefnId) -> Vec<IndexInstRef> {
        self.definitions
            .iter()
            .filter(|d| d.defn_id == defn_id)
            .flat_map(|d| d.instances.iter().cloned())
            .collect()
    }

    /// A single instance of a definition.
    pub fn instance(&self, defn_id: DefnId, inst_id: InstId) -> Option<&IndexInstRef> {
        self.definitions
            .iter()
            .find(|d| d.defn_id == defn_id)?
            .instances
            .iter()
            .find(|i| i.inst_id == inst_id)
    }

    /// Lifecycle state of one instance, `Nil` if not present.
    pub fn state_of(&self, defn_id: DefnId, inst_id: InstId) -> IndexState {
        self.instance(defn_id, inst_id)
            .map(|i| i.state)
            .unwrap_or(IndexState::Nil)
    }

    fn instance_mut(&mut self, defn_id: DefnId, inst_id: InstId) -> Option<&mut IndexInstRef> {
        self.definitions
            .iter_mut()
            .find(|d| d.defn_id == defn_id)?
            .instances
            .iter_mut()
            .find(|i| i.inst_id == inst_id)
    }

    // ── Instance membership ────────────────────────────────────────

    /// Append a fresh instance under a definition, creating the
    /// definition reference on first use. The instance starts in
    /// `Created`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_instance(
        &mut self,
        defn_id: DefnId,
        inst_id: InstId,
        real_inst_id: InstId,
        replica_id: i32,
        partitions: &[PartitionId],
        versions: &[u64],
        num_partitions: u32,
        storage_mode: &str,
        scheduled: bool,
        indexer_id: &str,
    ) {
        let parts = partitions
            .iter()
            .zip(versions.iter().chain(std::iter::repeat(&0)))
            .map(|(&part_id, &version)| PartitionRef { part_id, version })
            .collect();

        let inst = IndexInstRef {
            inst_id,
            real_inst_id,
            replica_id,
            state: IndexState::Created,
            rstate: RebalanceState::Nil,
            stream: StreamId::Nil,
            error: String::new(),
            scheduled,
            storage_mode: storage_mode.to_string(),
            old_storage_mode: String::new(),
            version: 0,
            num_partitions,
            partitions: parts,
            indexer_id: indexer_id.to_string(),
        };

        match self.definitions.iter_mut().find(|d| d.defn_id == defn_id) {
            Some(defn) => defn.instances.push(inst),
            None => self.definitions.push(IndexDefnRef {
                defn_id,
                instances: vec![inst],
            }),
        }
    }

    /// Remove a whole definition reference. Returns `true` if present.
    pub fn remove_defn(&mut self, defn_id: DefnId) -> bool {
        let before = self.definitions.len();
        self.definitions.retain(|d| d.defn_id != defn_id);
        self.definitions.len() != before
    }

    /// Remove one instance; drops the definition reference when it
    /// becomes empty. Returns `true` if present.
    pub fn remove_instance(&mut self, defn_id: DefnId, inst_id: InstId) -> bool {
        let mut removed = false;
        if let Some(defn) = self.definitions.iter_mut().find(|d| d.defn_id == defn_id) {
            let before = defn.instances.len();
            defn.instances.retain(|i| i.inst_id != inst_id);
            removed = defn.instances.len() != before;
        }
        self.definitions.retain(|d| !d.instances.is_empty());
        removed
    }

    // ── Field mutators ─────────────────────────────────────────────

    /// Set the lifecycle state of an instance, enforcing the forward
    /// state graph. Illegal transitions are dropped with a warning.
    pub fn update_state(&mut self, defn_id: DefnId, inst_id: InstId, state: IndexState) -> bool {
        let bucket = self.bucket.clone();
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.state == state {
                return false;
            }
            if !inst.state.can_transition_to(state) {
                warn!(
                    %bucket,
                    defn_id,
                    inst_id,
                    from = ?inst.state,
                    to = ?state,
                    "illegal index state transition dropped"
                );
                return false;
            }
            inst.state = state;
            return true;
        }
        false
    }

    /// Force an instance back to `Ready` (storage-mode reset path).
    pub fn reset_to_ready(&mut self, defn_id: DefnId, inst_id: InstId) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.state != IndexState::Ready {
                inst.state = IndexState::Ready;
                return true;
            }
        }
        false
    }

    pub fn update_rstate(
        &mut self,
        defn_id: DefnId,
        inst_id: InstId,
        rstate: RebalanceState,
    ) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.rstate != rstate {
                inst.rstate = rstate;
                return true;
            }
        }
        false
    }

    pub fn update_stream(&mut self, defn_id: DefnId, inst_id: InstId, stream: StreamId) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.stream != stream {
                inst.stream = stream;
                return true;
            }
        }
        false
    }

    pub fn set_error(&mut self, defn_id: DefnId, inst_id: InstId, error: &str) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.error != error {
                inst.error = error.to_string();
                return true;
            }
        }
        false
    }

    pub fn update_scheduled(&mut self, defn_id: DefnId, inst_id: InstId, scheduled: bool) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.scheduled != scheduled {
                inst.scheduled = scheduled;
                return true;
            }
        }
        false
    }

    pub fn update_storage_mode(&mut self, defn_id: DefnId, inst_id: InstId, mode: &str) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.storage_mode != mode {
                inst.storage_mode = mode.to_string();
                return true;
            }
        }
        false
    }

    pub fn update_old_storage_mode(
        &mut self,
        defn_id: DefnId,
        inst_id: InstId,
        mode: &str,
    ) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.old_storage_mode != mode {
                inst.old_storage_mode = mode.to_string();
                return true;
            }
        }
        false
    }

    pub fn update_version(&mut self, defn_id: DefnId, inst_id: InstId, version: u64) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            if inst.version != version {
                inst.version = version;
                return true;
            }
        }
        false
    }

    /// Append partitions (with versions) to an instance, skipping
    /// part-ids it already holds.
    pub fn add_partitions(
        &mut self,
        defn_id: DefnId,
        inst_id: InstId,
        indexer_id: &str,
        partitions: &[PartitionId],
        versions: &[u64],
    ) -> bool {
        if let Some(inst) = self.instance_mut(defn_id, inst_id) {
            let mut changed = false;
            for (i, &part_id) in partitions.iter().enumerate() {
                if inst.partitions.iter().any(|p| p.part_id == part_id) {
                    continue;
                }
                let version = versions.get(i).copied().unwrap_or(0);
                inst.partitions.push(PartitionRef { part_id, version });
                changed = true;
            }
            if changed {
                inst.indexer_id = indexer_id.to_string();
                inst.num_partitions = inst.partitions.len() as u32;
            }
            return changed;
        }
        false
    }

    // ── Partition migration ────────────────────────────────────────

    /// Split the named partitions out of `inst_id` into a fresh proxy
    /// instance `proxy_inst_id`, all within this blob.
    pub fn split_partitions(
        &mut self,
        defn_id: DefnId,
        inst_id: InstId,
        proxy_inst_id: InstId,
        partitions: &[PartitionId],
    ) -> bool {
        let Some(source) = self.instance_mut(defn_id, inst_id) else {
            return false;
        };

        let mut moved = Vec::new();
        source.partitions.retain(|p| {
            if partitions.contains(&p.part_id) {
                moved.push(p.clone());
                false
            } else {
                true
            }
        });
        if moved.is_empty() {
            return false;
        }
        source.num_partitions = source.partitions.len() as u32;

        let proxy = IndexInstRef {
            inst_id: proxy_inst_id,
            real_inst_id: inst_id,
            replica_id: source.replica_id,
            state: IndexState::Deleted,
            rstate: RebalanceState::PendingDelete,
            stream: StreamId::Nil,
            error: String::new(),
            scheduled: false,
            storage_mode: source.storage_mode.clone(),
            old_storage_mode: String::new(),
            version: source.version,
            num_partitions: moved.len() as u32,
            partitions: moved,
            indexer_id: source.indexer_id.clone(),
        };

        if let Some(defn) = self.definitions.iter_mut().find(|d| d.defn_id == defn_id) {
            defn.instances.push(proxy);
            return true;
        }
        false
    }

    /// Move `partitions` (with `versions`) from the source instance to
    /// the target, set the source's rebalance state, and bump the
    /// target's instance version — one atomic blob mutation.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_partitions(
        &mut self,
        indexer_id: &str,
        defn_id: DefnId,
        src_inst_id: InstId,
        src_rstate: RebalanceState,
        tgt_inst_id: InstId,
        tgt_inst_version: u64,
        partitions: &[PartitionId],
        versions: &[u64],
    ) -> bool {
        if let Some(src) = self.instance_mut(defn_id, src_inst_id) {
            src.partitions.retain(|p| !partitions.contains(&p.part_id));
            src.num_partitions = src.partitions.len() as u32;
            src.rstate = src_rstate;
        } else {
            return false;
        }

        let added = self.add_partitions(defn_id, tgt_inst_id, indexer_id, partitions, versions);
        self.update_version(defn_id, tgt_inst_id, tgt_inst_version);
        added
    }
}
