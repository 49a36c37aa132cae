//! Coordination store and DDL command tokens for indexgrid.
//!
//! The store is a hierarchical key/value space with list-children
//! semantics. Build and delete tokens live under two well-known path
//! roots; they are durable intent records that outlive individual
//! nodes and are replayed by the background reconcilers after a crash.

mod error;
mod store;
mod tokens;

pub use error::{CoordError, CoordResult};
pub use store::CoordStore;
pub use tokens::{
    build_token_path, delete_token_path, BuildToken, DeleteToken, BUILD_TOKEN_ROOT,
    DELETE_TOKEN_ROOT,
};
