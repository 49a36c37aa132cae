//! redb table definitions for the metadata repository.
//!
//! Each table uses JSON-serialized values. Definitions are keyed by
//! their numeric id, topologies by bucket name, and the small local /
//! broadcast records by a fixed name.

use redb::TableDefinition;

/// Index definitions keyed by `DefnId`.
pub const DEFINITIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("definitions");

/// Per-bucket topology blobs keyed by bucket name.
pub const TOPOLOGIES: TableDefinition<&str, &[u8]> = TableDefinition::new("topologies");

/// Node-local records (indexer id, node UUID) and the last broadcast
/// service map / stats, keyed by record name.
pub const LOCAL: TableDefinition<&str, &[u8]> = TableDefinition::new("local");

pub const INDEXER_ID_KEY: &str = "indexer_id";
pub const NODE_UUID_KEY: &str = "node_uuid";
pub const SERVICE_MAP_KEY: &str = "service_map";
pub const INDEX_STATS_KEY: &str = "index_stats";
