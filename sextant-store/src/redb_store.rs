//! Durable value store engine backed by redb
//!
//! A single `values` table maps padded multihash bytes to a CBOR-encoded
//! value list. Batched puts and removes run inside one write transaction so
//! an interrupted batch never leaves a half-applied advertisement visible.

use crate::{merge_value, subtract_value, ValueStore};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use redb::{Database, Durability, ReadableTable, TableDefinition};
use sextant_core::value::{decode_values, encode_values};
use sextant_core::{Error, Result, Value};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

const VALUES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("values");

/// Engines with hash-table layouts cannot index very short keys; this is the
/// default minimum the ingester pads up to.
const DEFAULT_MIN_KEY_LENGTH: usize = 4;

/// Configuration for the durable engine.
#[derive(Debug, Clone)]
pub struct RedbValueStoreConfig {
    /// Directory holding the database file.
    pub dir: PathBuf,
    /// Engine block cache size in bytes.
    pub cache_size_bytes: usize,
    /// Minimum key length; shorter keys are rejected.
    pub min_key_length: usize,
    /// Fsync every commit. Disable only when losing recent writes on power
    /// loss is acceptable.
    pub sync_writes: bool,
}

impl Default for RedbValueStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("valuestore"),
            cache_size_bytes: 1 << 30,
            min_key_length: DEFAULT_MIN_KEY_LENGTH,
            sync_writes: true,
        }
    }
}

/// Durable engine.
pub struct RedbValueStore {
    db: Arc<Database>,
    path: PathBuf,
    min_key_length: usize,
    durability: Durability,
}

impl Debug for RedbValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbValueStore")
            .field("path", &self.path)
            .field("min_key_length", &self.min_key_length)
            .finish()
    }
}

impl RedbValueStore {
    /// Open (or create) the engine under `config.dir`.
    pub fn open(config: RedbValueStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| Error::io(format!("cannot create {}: {}", config.dir.display(), e)))?;
        let path = config.dir.join("values.redb");
        let db = Database::builder()
            .set_cache_size(config.cache_size_bytes)
            .create(&path)
            .map_err(|e| Error::storage(format!("cannot open value store: {}", e)))?;

        let durability = if config.sync_writes {
            Durability::Immediate
        } else {
            Durability::Eventual
        };

        let store = Self {
            db: Arc::new(db),
            path,
            min_key_length: config.min_key_length,
            durability,
        };

        // Ensure the table exists so reads on a fresh database succeed.
        store.mutate(|_| Ok(()))?;
        Ok(store)
    }

    fn check_keys(&self, keys: &[Vec<u8>]) -> Result<()> {
        for key in keys {
            if key.len() < self.min_key_length {
                return Err(Error::storage(format!(
                    "key length {} below engine minimum {}",
                    key.len(),
                    self.min_key_length
                )));
            }
        }
        Ok(())
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut redb::Table<'_, &'static [u8], &'static [u8]>) -> Result<()>,
    ) -> Result<()> {
        let mut wtx = self
            .db
            .begin_write()
            .map_err(|e| Error::storage(e.to_string()))?;
        wtx.set_durability(self.durability);
        {
            let mut table = wtx
                .open_table(VALUES_TABLE)
                .map_err(|e| Error::storage(e.to_string()))?;
            apply(&mut table)?;
        }
        wtx.commit().map_err(|e| Error::storage(e.to_string()))
    }
}

#[async_trait]
impl ValueStore for RedbValueStore {
    async fn put(&self, value: &Value, keys: &[Vec<u8>]) -> Result<()> {
        self.check_keys(keys)?;
        self.mutate(|table| {
            for key in keys {
                let mut values = match table
                    .get(key.as_slice())
                    .map_err(|e| Error::storage(e.to_string()))?
                {
                    Some(guard) => decode_values(guard.value())?,
                    None => Vec::new(),
                };
                if merge_value(&mut values, value) {
                    table
                        .insert(key.as_slice(), encode_values(&values).as_slice())
                        .map_err(|e| Error::storage(e.to_string()))?;
                }
            }
            Ok(())
        })
    }

    async fn remove(&self, value: &Value, keys: &[Vec<u8>]) -> Result<()> {
        self.check_keys(keys)?;
        self.mutate(|table| {
            for key in keys {
                let existing = match table
                    .get(key.as_slice())
                    .map_err(|e| Error::storage(e.to_string()))?
                {
                    Some(guard) => Some(decode_values(guard.value())?),
                    None => None,
                };
                let Some(mut values) = existing else {
                    continue;
                };
                if !subtract_value(&mut values, value) {
                    continue;
                }
                if values.is_empty() {
                    table
                        .remove(key.as_slice())
                        .map_err(|e| Error::storage(e.to_string()))?;
                } else {
                    table
                        .insert(key.as_slice(), encode_values(&values).as_slice())
                        .map_err(|e| Error::storage(e.to_string()))?;
                }
            }
            Ok(())
        })
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<Value>>> {
        let rtx = self
            .db
            .begin_read()
            .map_err(|e| Error::storage(e.to_string()))?;
        let table = rtx
            .open_table(VALUES_TABLE)
            .map_err(|e| Error::storage(e.to_string()))?;
        match table.get(key).map_err(|e| Error::storage(e.to_string()))? {
            Some(guard) => Ok(Some(decode_values(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn flush(&self) -> Result<()> {
        // Commits are transactional; there is no write buffer to drain.
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| Error::io(format!("cannot stat {}: {}", self.path.display(), e)))?;
        Ok(meta.len())
    }

    async fn iter(&self) -> Result<BoxStream<'static, Result<(Vec<u8>, Vec<Value>)>>> {
        let rtx = self
            .db
            .begin_read()
            .map_err(|e| Error::storage(e.to_string()))?;
        let table = rtx
            .open_table(VALUES_TABLE)
            .map_err(|e| Error::storage(e.to_string()))?;
        let mut snapshot = Vec::new();
        for item in table.iter().map_err(|e| Error::storage(e.to_string()))? {
            let (k, v) = item.map_err(|e| Error::storage(e.to_string()))?;
            snapshot.push((k.value().to_vec(), decode_values(v.value())?));
        }
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn min_key_length(&self) -> usize {
        self.min_key_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::{pad_key, sha256_multihash};
    use sextant_core::PeerId;

    fn open(dir: &std::path::Path) -> RedbValueStore {
        RedbValueStore::open(RedbValueStoreConfig {
            dir: dir.to_path_buf(),
            cache_size_bytes: 1 << 20,
            ..Default::default()
        })
        .unwrap()
    }

    fn value(seed: u8) -> Value {
        Value::new(
            PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32])),
            b"ctx".to_vec(),
            b"meta".to_vec(),
        )
    }

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| sha256_multihash(format!("mh-{}", i).as_bytes()).to_bytes())
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let v = value(1);
        let ks = keys(3);

        store.put(&v, &ks).await.unwrap();
        for k in &ks {
            assert_eq!(store.get(k).await.unwrap(), Some(vec![v.clone()]));
        }

        store.remove(&v, &ks).await.unwrap();
        for k in &ks {
            assert_eq!(store.get(k).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_put_idempotent_and_batched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let v = value(1);
        let ks = keys(100);

        store.put(&v, &ks).await.unwrap();
        store.put(&v, &ks).await.unwrap();
        assert_eq!(store.get(&ks[50]).await.unwrap(), Some(vec![v]));
    }

    #[tokio::test]
    async fn test_same_slot_metadata_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let ks = keys(1);

        let v1 = value(1);
        let mut v2 = value(1);
        v2.metadata = b"updated".to_vec();

        store.put(&v1, &ks).await.unwrap();
        store.put(&v2, &ks).await.unwrap();
        assert_eq!(store.get(&ks[0]).await.unwrap(), Some(vec![v2]));
    }

    #[tokio::test]
    async fn test_min_key_length_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let v = value(1);

        let short = vec![b"ab".to_vec()];
        assert!(store.put(&v, &short).await.is_err());

        let padded = vec![pad_key(b"ab", store.min_key_length())];
        store.put(&v, &padded).await.unwrap();
        assert_eq!(store.get(&padded[0]).await.unwrap(), Some(vec![v]));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let v = value(1);
        let ks = keys(2);
        {
            let store = open(dir.path());
            store.put(&v, &ks).await.unwrap();
            store.close().await.unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(&ks[0]).await.unwrap(), Some(vec![v]));
    }

    #[tokio::test]
    async fn test_two_providers_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let ks = keys(1);
        let v1 = value(1);
        let v2 = value(2);

        store.put(&v1, &ks).await.unwrap();
        store.put(&v2, &ks).await.unwrap();

        let got = store.get(&ks[0]).await.unwrap().unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&v1) && got.contains(&v2));

        // Removing one provider leaves the other.
        store.remove(&v1, &ks).await.unwrap();
        assert_eq!(store.get(&ks[0]).await.unwrap(), Some(vec![v2]));
    }
}
