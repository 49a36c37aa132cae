//! Indexer callback surface.
//!
//! The local indexer process is behind this trait: the lifecycle
//! manager tells it to create, build, delete, or prune, and the
//! indexer reports failures with typed error codes so that retry
//! classification does not depend on message text. Calls may block;
//! the dispatcher tolerates that.

use std::collections::HashMap;

use thiserror::Error;

use indexgrid_meta::{IndexDefinition, InstId, PartitionId};

/// Where a DDL request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    User,
    Rebalance,
}

/// Context threaded through every DDL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub source: RequestSource,
}

impl RequestContext {
    pub fn user() -> Self {
        RequestContext {
            source: RequestSource::User,
        }
    }

    pub fn rebalance() -> Self {
        RequestContext {
            source: RequestSource::Rebalance,
        }
    }
}

/// Typed failure codes reported by the indexer.
///
/// `Generic` covers errors the indexer did not classify; those are
/// treated as transient for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerErrorCode {
    Generic,
    IndexNotExist,
    InvalidBucket,
    IndexAlreadyExist,
    IndexInvalidState,
    RebalanceInProgress,
}

/// A failure reported by the indexer callbacks.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct IndexerError {
    pub code: IndexerErrorCode,
    pub reason: String,
}

impl IndexerError {
    pub fn new(code: IndexerErrorCode, reason: impl Into<String>) -> Self {
        IndexerError {
            code,
            reason: reason.into(),
        }
    }
}

/// Callbacks into the local indexer process.
///
/// Implementations may block on I/O. The dispatcher never calls two
/// of these concurrently for metadata-mutating operations.
pub trait IndexerNotifier: Send + Sync {
    /// A new index instance has been recorded; the indexer should
    /// allocate its runtime structures.
    #[allow(clippy::too_many_arguments)]
    fn on_index_create(
        &self,
        defn: &IndexDefinition,
        inst_id: InstId,
        replica_id: i32,
        partitions: &[PartitionId],
        versions: &[u64],
        num_partitions: u32,
        real_inst_id: InstId,
        ctx: RequestContext,
    ) -> Result<(), IndexerError>;

    /// Start building the given instances. Returns per-instance
    /// failures; an empty map means every build was accepted.
    fn on_index_build(
        &self,
        inst_ids: &[InstId],
        buckets: &[String],
        ctx: RequestContext,
    ) -> HashMap<InstId, IndexerError>;

    /// Tear down one instance.
    fn on_index_delete(
        &self,
        inst_id: InstId,
        bucket: &str,
        ctx: RequestContext,
    ) -> Result<(), IndexerError>;

    /// Drop a subset of partitions from an instance.
    fn on_partition_prune(
        &self,
        inst_id: InstId,
        partitions: &[PartitionId],
        ctx: RequestContext,
    ) -> Result<(), IndexerError>;

    /// A client fetched the service map; refresh stats opportunistically.
    fn on_fetch_stats(&self) {}
}

/// Whether a drop-side indexer error means the work was already done.
///
/// The typed `IndexNotExist` code is authoritative; the message
/// substring is a legacy fallback for indexers that only report text.
pub(crate) fn is_idempotent_drop_error(err: &IndexerError) -> bool {
    err.code == IndexerErrorCode::IndexNotExist || err.reason.contains("Unknown Index Instance")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_drop_classification() {
        let gone = IndexerError::new(IndexerErrorCode::IndexNotExist, "no such index");
        assert!(is_idempotent_drop_error(&gone));

        let legacy = IndexerError::new(IndexerErrorCode::Generic, "Unknown Index Instance 42");
        assert!(is_idempotent_drop_error(&legacy));

        let real = IndexerError::new(IndexerErrorCode::Generic, "disk full");
        assert!(!is_idempotent_drop_error(&real));
    }
}
