//! Indexing engine: cache + value store + key padding
//!
//! The engine is the single front used by both the ingest path (put/remove)
//! and the find path (get). It pads keys to the engine minimum, routes reads
//! through the optional result cache, invalidates on writes, and refuses
//! puts while the indexer is frozen.

use crate::{ResultCache, ValueStore};
use sextant_core::link::pad_key;
use sextant_core::{Error, Multihash, Result, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cache-fronted value store with key padding.
#[derive(Debug)]
pub struct Engine {
    cache: Option<ResultCache>,
    store: Arc<dyn ValueStore>,
    min_key_length: usize,
    frozen: Arc<AtomicBool>,
}

impl Engine {
    /// Compose an engine from an optional cache and a value store. The
    /// store's own minimum key length is the floor for padding.
    pub fn new(cache: Option<ResultCache>, store: Arc<dyn ValueStore>) -> Self {
        let min_key_length = store.min_key_length();
        Self {
            cache,
            store,
            min_key_length,
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the minimum key length above the engine's own floor.
    pub fn with_min_key_length(mut self, min: usize) -> Self {
        self.min_key_length = self.min_key_length.max(min);
        self
    }

    /// Share the given frozen latch instead of a private one.
    pub fn with_frozen_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.frozen = flag;
        self
    }

    /// The frozen latch. Freezing refuses puts but keeps reads working.
    pub fn frozen_flag(&self) -> Arc<AtomicBool> {
        self.frozen.clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Effective minimum key length callers must be aware of for stats.
    pub fn min_key_length(&self) -> usize {
        self.min_key_length
    }

    fn key_for(&self, mh: &Multihash) -> Vec<u8> {
        pad_key(&mh.to_bytes(), self.min_key_length)
    }

    /// Current values for a multihash. Empty result means not indexed.
    pub async fn get(&self, mh: &Multihash) -> Result<Option<Vec<Value>>> {
        let key = self.key_for(mh);
        if let Some(cache) = &self.cache {
            if let Some(values) = cache.get(&key) {
                return Ok(Some(values));
            }
        }
        let values = self.store.get(&key).await?;
        if let (Some(cache), Some(values)) = (&self.cache, &values) {
            cache.insert(key, values.clone());
        }
        Ok(values)
    }

    /// Index a batch of multihashes under a value.
    ///
    /// Refused while frozen; the caller decides whether that aborts the
    /// current pass or the whole sync.
    pub async fn put(&self, value: &Value, mhs: &[Multihash]) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::Frozen);
        }
        let keys: Vec<Vec<u8>> = mhs.iter().map(|mh| self.key_for(mh)).collect();
        self.store.put(value, &keys).await?;
        if let Some(cache) = &self.cache {
            for key in &keys {
                cache.invalidate(key);
            }
        }
        Ok(())
    }

    /// Remove a value's slot from a batch of multihashes.
    pub async fn remove(&self, value: &Value, mhs: &[Multihash]) -> Result<()> {
        let keys: Vec<Vec<u8>> = mhs.iter().map(|mh| self.key_for(mh)).collect();
        self.store.remove(value, &keys).await?;
        if let Some(cache) = &self.cache {
            for key in &keys {
                cache.invalidate(key);
            }
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    pub async fn size(&self) -> Result<u64> {
        self.store.size().await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryValueStore;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::sha256_multihash;
    use sextant_core::PeerId;

    fn value(seed: u8) -> Value {
        Value::new(
            PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32])),
            b"ctx".to_vec(),
            b"meta".to_vec(),
        )
    }

    fn mhs(n: usize) -> Vec<Multihash> {
        (0..n)
            .map(|i| sha256_multihash(format!("mh-{}", i).as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_then_get_with_and_without_cache() {
        let v = value(1);
        let batch = mhs(5);

        for cache in [None, Some(ResultCache::new(16))] {
            let engine = Engine::new(cache, Arc::new(MemoryValueStore::new()));
            engine.put(&v, &batch).await.unwrap();
            for mh in &batch {
                assert_eq!(engine.get(mh).await.unwrap(), Some(vec![v.clone()]));
            }
            // Second read exercises the cached path when a cache exists.
            assert_eq!(engine.get(&batch[0]).await.unwrap(), Some(vec![v.clone()]));
        }
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_write() {
        let engine = Engine::new(
            Some(ResultCache::new(16)),
            Arc::new(MemoryValueStore::new()),
        );
        let batch = mhs(1);
        let v1 = value(1);
        let v2 = value(2);

        engine.put(&v1, &batch).await.unwrap();
        assert_eq!(engine.get(&batch[0]).await.unwrap(), Some(vec![v1.clone()]));

        // A write through the same engine must not serve the stale entry.
        engine.put(&v2, &batch).await.unwrap();
        let got = engine.get(&batch[0]).await.unwrap().unwrap();
        assert_eq!(got.len(), 2);

        engine.remove(&v1, &batch).await.unwrap();
        assert_eq!(engine.get(&batch[0]).await.unwrap(), Some(vec![v2]));
    }

    #[tokio::test]
    async fn test_short_keys_padded() {
        let engine = Engine::new(None, Arc::new(MemoryValueStore::new())).with_min_key_length(64);
        let v = value(1);
        // An identity multihash over a tiny input produces a short key.
        let short = Multihash::wrap(0x00, b"ab").unwrap();

        engine.put(&v, &[short]).await.unwrap();
        assert_eq!(engine.get(&short).await.unwrap(), Some(vec![v]));
    }

    #[tokio::test]
    async fn test_frozen_refuses_put_keeps_reads() {
        let engine = Engine::new(None, Arc::new(MemoryValueStore::new()));
        let batch = mhs(2);
        let v = value(1);

        engine.put(&v, &batch[..1]).await.unwrap();
        engine.frozen_flag().store(true, Ordering::SeqCst);

        assert!(matches!(
            engine.put(&v, &batch[1..]).await,
            Err(Error::Frozen)
        ));
        // Previously stored values remain readable.
        assert_eq!(engine.get(&batch[0]).await.unwrap(), Some(vec![v]));
        assert_eq!(engine.get(&batch[1]).await.unwrap(), None);
    }
}
