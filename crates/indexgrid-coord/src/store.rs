//! Hierarchical key/value store backed by redb.
//!
//! Paths are `/`-separated strings; `list_children` is a prefix range
//! scan, the only traversal primitive the lifecycle manager needs.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{CoordError, CoordResult};

/// Path → value entries.
const PATHS: TableDefinition<&str, &[u8]> = TableDefinition::new("paths");

/// Convert any `Display` error into a `CoordError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CoordError::$variant(e.to_string())
    };
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct CoordStore {
    db: Arc<Database>,
}

impl CoordStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> CoordResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> CoordResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> CoordResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(PATHS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or overwrite the value at a path.
    pub fn put(&self, path: &str, value: &[u8]) -> CoordResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PATHS).map_err(map_err!(Table))?;
            table.insert(path, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read the value at a path.
    pub fn get(&self, path: &str) -> CoordResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PATHS).map_err(map_err!(Table))?;
        match table.get(path).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    /// Delete the value at a path. Returns true if it existed.
    pub fn delete(&self, path: &str) -> CoordResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PATHS).map_err(map_err!(Table))?;
            existed = table.remove(path).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// List all entries below a path root, as (path, value) pairs in
    /// path order.
    pub fn list_children(&self, root: &str) -> CoordResult<Vec<(String, Vec<u8>)>> {
        let prefix = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{root}/")
        };

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PATHS).map_err(map_err!(Table))?;

        let mut entries = Vec::new();
        let iter = table.range(prefix.as_str()..).map_err(map_err!(Read))?;
        for item in iter {
            let (key, value) = item.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let store = CoordStore::open_in_memory().unwrap();
        assert!(store.get("a/b").unwrap().is_none());

        store.put("a/b", b"value").unwrap();
        assert_eq!(store.get("a/b").unwrap().unwrap(), b"value");

        assert!(store.delete("a/b").unwrap());
        assert!(store.get("a/b").unwrap().is_none());
        assert!(!store.delete("a/b").unwrap());
    }

    #[test]
    fn list_children_scans_only_the_root() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put("ddl/build/1", b"a").unwrap();
        store.put("ddl/build/2", b"b").unwrap();
        store.put("ddl/delete/3", b"c").unwrap();
        // Sibling path that shares the textual prefix but not the root.
        store.put("ddl/builds", b"d").unwrap();

        let children = store.list_children("ddl/build").unwrap();
        let paths: Vec<&str> = children.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["ddl/build/1", "ddl/build/2"]);
    }

    #[test]
    fn list_children_empty_root() {
        let store = CoordStore::open_in_memory().unwrap();
        assert!(store.list_children("nothing/here").unwrap().is_empty());
    }
}
