//! Index metadata model and repository for indexgrid.
//!
//! This crate defines the durable shape of a secondary index — the
//! definition, its instances, their partitions, and the per-bucket
//! topology blob — plus the redb-backed `MetadataRepo` that persists
//! all of it. The lifecycle manager is the only writer; everything
//! else reads snapshots.

mod error;
mod store;
mod tables;
mod topology;
mod types;

pub use error::{MetaError, MetaResult};
pub use store::MetadataRepo;
pub use topology::{BucketTopology, IndexDefnRef, IndexInstRef, PartitionRef};
pub use types::*;
