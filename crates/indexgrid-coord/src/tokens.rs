//! Durable DDL command tokens.
//!
//! A token records cluster-wide intent to build or drop an index. It
//! survives node crashes; the janitor and builder replay tokens until
//! the intent is satisfied.

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};
use crate::store::CoordStore;

/// Path root for build tokens.
pub const BUILD_TOKEN_ROOT: &str = "ddl/build";

/// Path root for delete tokens.
pub const DELETE_TOKEN_ROOT: &str = "ddl/delete";

/// Durable request to build the index with this definition id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildToken {
    pub defn_id: u64,
}

/// Durable request to drop the index with this definition id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteToken {
    pub defn_id: u64,
}

pub fn build_token_path(defn_id: u64) -> String {
    format!("{BUILD_TOKEN_ROOT}/{defn_id}")
}

pub fn delete_token_path(defn_id: u64) -> String {
    format!("{DELETE_TOKEN_ROOT}/{defn_id}")
}

impl BuildToken {
    /// Persist this token in the coordination store.
    pub fn post(&self, store: &CoordStore) -> CoordResult<()> {
        let value = serde_json::to_vec(self).map_err(|e| CoordError::Serialize(e.to_string()))?;
        store.put(&build_token_path(self.defn_id), &value)
    }

    pub fn decode(value: &[u8]) -> CoordResult<BuildToken> {
        serde_json::from_slice(value).map_err(|e| CoordError::Deserialize(e.to_string()))
    }
}

impl DeleteToken {
    /// Persist this token in the coordination store.
    pub fn post(&self, store: &CoordStore) -> CoordResult<()> {
        let value = serde_json::to_vec(self).map_err(|e| CoordError::Serialize(e.to_string()))?;
        store.put(&delete_token_path(self.defn_id), &value)
    }

    pub fn decode(value: &[u8]) -> CoordResult<DeleteToken> {
        serde_json::from_slice(value).map_err(|e| CoordError::Deserialize(e.to_string()))
    }
}
