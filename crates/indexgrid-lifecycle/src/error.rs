//! Error types for the lifecycle manager.
//!
//! User-facing variants carry the exact message text clients key off;
//! everything else is surfaced verbatim behind a stable prefix.

use thiserror::Error;

use crate::notifier::IndexerError;
use indexgrid_coord::CoordError;
use indexgrid_meta::MetaError;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors that can occur during lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("metadata repository error: {0}")]
    Meta(#[from] MetaError),

    #[error("coordination store error: {0}")]
    Coord(#[from] CoordError),

    #[error("{0}")]
    Indexer(#[from] IndexerError),

    #[error("Index {bucket}.{name} already exists")]
    DuplicateIndex { bucket: String, name: String },

    #[error("Index Replica not supported in non-Enterprise Edition")]
    ReplicaNotSupported,

    #[error("Index Partitioning is not supported in non-Enterprise Edition")]
    PartitionNotSupported,

    #[error(
        "Bucket does not exist or temporarily unavailable for creating new index. \
         Please retry the operation at a later time ({0})."
    )]
    BucketUnavailable(String),

    #[error("Fail to build index.  Index build will retry in background.")]
    BuildWillRetry,

    #[error("Fail to create index due to internal build error.  Please retry the operation.")]
    InternalBuildError,

    #[error("{0}")]
    BuildFailed(String),

    #[error("Encounter error when dropping index: {0}. Drop index will retry in background.")]
    DropWillRetry(String),

    #[error("Missing real instance id when rebalancing partitioned index")]
    MissingRealInstId,

    #[error("Found duplicate instance {0} already existed in index.")]
    DuplicateInstance(u64),

    #[error("Found overlapping partition when rebalancing. Instance {inst_id} partition {part_id}.")]
    OverlappingPartition { inst_id: u64, part_id: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cluster info error: {0}")]
    ClusterInfo(String),

    #[error("{0}")]
    Request(String),

    #[error("lifecycle manager is shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}
