//! Domain types for the index metadata model.
//!
//! These types represent the persisted state of index definitions and
//! the records broadcast through the repository (service map, filtered
//! stats). All types are serializable to/from JSON for storage in redb
//! tables and for the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Globally unique identifier of an index definition.
pub type DefnId = u64;

/// Identifier of an index instance, unique within a definition.
pub type InstId = u64;

/// Identifier of a partition within an instance.
pub type PartitionId = u64;

/// Sentinel bucket UUID: the bucket does not exist (but the cluster is
/// reachable), or no UUID has been captured yet.
pub const BUCKET_UUID_NIL: &str = "";

// ── Lifecycle states ───────────────────────────────────────────────

/// Lifecycle state of an index instance.
///
/// Transitions run forward only (`Created → Ready → Initial → Catchup
/// → Active`); `Deleted` is reachable from every state and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    #[default]
    Nil,
    Created,
    Ready,
    Initial,
    Catchup,
    Active,
    Deleted,
}

impl IndexState {
    /// Position along the forward build path. `Nil` and `Deleted` sit
    /// outside the path.
    fn rank(self) -> Option<u8> {
        match self {
            IndexState::Created => Some(0),
            IndexState::Ready => Some(1),
            IndexState::Initial => Some(2),
            IndexState::Catchup => Some(3),
            IndexState::Active => Some(4),
            IndexState::Nil | IndexState::Deleted => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: IndexState) -> bool {
        if self == IndexState::Deleted {
            return false;
        }
        if next == IndexState::Deleted || self == IndexState::Nil {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(a), Some(b)) => b >= a,
            _ => false,
        }
    }
}

/// Rebalance marker, orthogonal to [`IndexState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceState {
    #[default]
    Nil,
    Active,
    Pending,
    PendingDelete,
    Merged,
}

/// Mutation stream an instance is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamId {
    #[default]
    Nil,
    Maint,
    Init,
    Catchup,
}

impl StreamId {
    /// Decode the one-byte wire representation used by DELETE_BUCKET.
    pub fn from_byte(b: u8) -> StreamId {
        match b {
            1 => StreamId::Maint,
            2 => StreamId::Init,
            3 => StreamId::Catchup,
            _ => StreamId::Nil,
        }
    }
}

// ── Storage / partitioning ─────────────────────────────────────────

/// Storage engine an index is built on.
///
/// `Gsi` is the generic marker clients send when they do not care; it
/// resolves to the cluster-configured mode, or to `Plasma` when none
/// is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Gsi,
    Plasma,
    MemoryOptimized,
    #[serde(rename = "forestdb")]
    ForestDb,
}

impl StorageKind {
    /// Parse a client-supplied storage kind, case-insensitively.
    pub fn parse(s: &str) -> Option<StorageKind> {
        match s.to_ascii_lowercase().as_str() {
            "gsi" => Some(StorageKind::Gsi),
            "plasma" => Some(StorageKind::Plasma),
            "memory_optimized" => Some(StorageKind::MemoryOptimized),
            "forestdb" => Some(StorageKind::ForestDb),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Gsi => "gsi",
            StorageKind::Plasma => "plasma",
            StorageKind::MemoryOptimized => "memory_optimized",
            StorageKind::ForestDb => "forestdb",
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an index is partitioned across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    #[default]
    Single,
    Hash,
    Key,
}

impl PartitionScheme {
    pub fn is_partitioned(self) -> bool {
        self != PartitionScheme::Single
    }
}

// ── Index definition ───────────────────────────────────────────────

/// The declared schema of an index.
///
/// The trailing `inst_*`/`partitions`/`versions`/`replica_id` fields
/// are request-transport only: create-time input captures them into
/// the topology and clears them before the definition is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub defn_id: DefnId,
    pub bucket: String,
    /// Bucket UUID snapshotted when the index was created.
    #[serde(default)]
    pub bucket_uuid: String,
    pub name: String,
    pub using: StorageKind,
    #[serde(default)]
    pub partition_scheme: PartitionScheme,
    #[serde(default)]
    pub num_partitions: u32,
    #[serde(default)]
    pub deferred: bool,
    #[serde(default)]
    pub num_replica: u32,

    // Request-transport fields, cleared before the definition record
    // is written.
    #[serde(default)]
    pub replica_id: i32,
    #[serde(default)]
    pub inst_id: InstId,
    #[serde(default)]
    pub real_inst_id: InstId,
    #[serde(default)]
    pub inst_version: u64,
    #[serde(default)]
    pub partitions: Vec<PartitionId>,
    #[serde(default)]
    pub versions: Vec<u64>,
}

impl IndexDefinition {
    pub fn is_partitioned(&self) -> bool {
        self.partition_scheme.is_partitioned()
    }
}

/// Wire shape for CLEANUP_INDEX / RESET_INDEX: an instance wrapped
/// around its definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInstance {
    pub inst_id: InstId,
    #[serde(default)]
    pub state: IndexState,
    pub defn: IndexDefinition,
}

// ── Broadcast records ──────────────────────────────────────────────

/// The node's advertised service map, broadcast through the
/// repository whenever it drifts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceMap {
    pub indexer_id: String,
    pub scan_addr: String,
    pub http_addr: String,
    pub admin_addr: String,
    pub node_addr: String,
    pub server_group: String,
    pub node_uuid: String,
    pub indexer_version: u64,
    pub cluster_version: u64,
}

/// Filtered per-index statistics, broadcast through the repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub stats: Map<String, Value>,
}
