//! Ancillary datastore abstraction
//!
//! The datastore holds everything that is not the value index itself: staged
//! advertisement and entry blocks (keyed by CID string), provider records
//! (`registry/<peer>`), ingest head pointers (`ingester/last_ad/<peer>`),
//! index counts, assignments, and the freeze marker.
//!
//! Two implementations are provided: an in-memory map for tests and a
//! redb-backed store for the daemon.

use crate::error::{Error, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const DATASTORE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("datastore");

/// Key-value datastore operations.
///
/// Deletes are idempotent: removing a missing key succeeds. `list` returns
/// the keys under a prefix and may be expensive for large prefixes; it is
/// used for startup scans and admin operations only.
#[async_trait]
pub trait Datastore: Debug + Send + Sync {
    /// Read a value, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, overwriting any existing entry.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Check whether a key exists.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Delete a key. Succeeds if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Flush buffered writes to durable storage.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// MemoryDatastore
// ============================================================================

/// In-memory datastore for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .expect("RwLock poisoned")
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.data
            .write()
            .expect("RwLock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().expect("RwLock poisoned").contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().expect("RwLock poisoned").remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().expect("RwLock poisoned");
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ============================================================================
// RedbDatastore
// ============================================================================

/// Durable datastore backed by a single redb table.
pub struct RedbDatastore {
    db: Arc<Database>,
    path: PathBuf,
}

impl Debug for RedbDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDatastore")
            .field("path", &self.path)
            .finish()
    }
}

impl RedbDatastore {
    /// Open (or create) the datastore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let db = Database::create(&path)
            .map_err(|e| Error::storage(format!("cannot open datastore: {}", e)))?;

        // Ensure the table exists so reads on a fresh database succeed.
        let wtx = db
            .begin_write()
            .map_err(|e| Error::storage(e.to_string()))?;
        wtx.open_table(DATASTORE_TABLE)
            .map_err(|e| Error::storage(e.to_string()))?;
        wtx.commit().map_err(|e| Error::storage(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Datastore for RedbDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rtx = self
            .db
            .begin_read()
            .map_err(|e| Error::storage(e.to_string()))?;
        let table = rtx
            .open_table(DATASTORE_TABLE)
            .map_err(|e| Error::storage(e.to_string()))?;
        Ok(table
            .get(key)
            .map_err(|e| Error::storage(e.to_string()))?
            .map(|guard| guard.value().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let wtx = self
            .db
            .begin_write()
            .map_err(|e| Error::storage(e.to_string()))?;
        {
            let mut table = wtx
                .open_table(DATASTORE_TABLE)
                .map_err(|e| Error::storage(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| Error::storage(e.to_string()))?;
        }
        wtx.commit().map_err(|e| Error::storage(e.to_string()))
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let wtx = self
            .db
            .begin_write()
            .map_err(|e| Error::storage(e.to_string()))?;
        {
            let mut table = wtx
                .open_table(DATASTORE_TABLE)
                .map_err(|e| Error::storage(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| Error::storage(e.to_string()))?;
        }
        wtx.commit().map_err(|e| Error::storage(e.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let rtx = self
            .db
            .begin_read()
            .map_err(|e| Error::storage(e.to_string()))?;
        let table = rtx
            .open_table(DATASTORE_TABLE)
            .map_err(|e| Error::storage(e.to_string()))?;
        let mut keys = Vec::new();
        for item in table
            .range(prefix..)
            .map_err(|e| Error::storage(e.to_string()))?
        {
            let (k, _) = item.map_err(|e| Error::storage(e.to_string()))?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(ds: &dyn Datastore) {
        ds.put("registry/peer-a", b"record-a").await.unwrap();
        ds.put("registry/peer-b", b"record-b").await.unwrap();
        ds.put("ingester/last_ad/peer-a", b"cid").await.unwrap();

        assert_eq!(
            ds.get("registry/peer-a").await.unwrap(),
            Some(b"record-a".to_vec())
        );
        assert_eq!(ds.get("missing").await.unwrap(), None);
        assert!(ds.has("registry/peer-b").await.unwrap());

        let mut keys = ds.list("registry/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["registry/peer-a", "registry/peer-b"]);

        ds.delete("registry/peer-a").await.unwrap();
        assert!(!ds.has("registry/peer-a").await.unwrap());
        // Idempotent delete
        ds.delete("registry/peer-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_datastore() {
        let ds = MemoryDatastore::new();
        exercise(&ds).await;
    }

    #[tokio::test]
    async fn test_redb_datastore() {
        let dir = tempfile::tempdir().unwrap();
        let ds = RedbDatastore::open(dir.path().join("datastore.redb")).unwrap();
        exercise(&ds).await;
    }

    #[tokio::test]
    async fn test_redb_datastore_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datastore.redb");
        {
            let ds = RedbDatastore::open(&path).unwrap();
            ds.put("ingester/last_ad/peer", b"head-cid").await.unwrap();
        }
        let ds = RedbDatastore::open(&path).unwrap();
        assert_eq!(
            ds.get("ingester/last_ad/peer").await.unwrap(),
            Some(b"head-cid".to_vec())
        );
    }
}
