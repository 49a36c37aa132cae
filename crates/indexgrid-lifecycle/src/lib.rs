//! Lifecycle manager for the indexgrid secondary-index service.
//!
//! A node-local singleton that serializes every DDL-style mutation on
//! index metadata: create / drop / build / reset, topology updates,
//! partition merge and prune, bucket-deletion fan-out, and background
//! reconciliation. One dispatcher task owns all writes; the janitor,
//! builder, and updator hold read snapshots and re-enter the
//! dispatcher through [`RequestServer`].

mod builder;
mod cluster;
mod config;
mod ddl;
mod error;
mod janitor;
mod manager;
mod notifier;
mod request;
mod service;
mod updator;

pub use cluster::{ClusterInfo, ClusterInfoCache, ClusterSnapshot};
pub use config::{LifecycleConfig, BUILD_BATCH_SIZE_KEY, BUILD_DISABLE_KEY, INDEXER_VERSION};
pub use error::{LifecycleError, LifecycleResult};
pub use manager::LifecycleManager;
pub use notifier::{
    IndexerError, IndexerErrorCode, IndexerNotifier, RequestContext, RequestSource,
};
pub use request::{
    DropInstanceRequest, IndexIdList, MergePartitionRequest, OpCode, RequestPacket, RequestServer,
    ResponsePacket, TopologyChange, INTERNAL_FID,
};
