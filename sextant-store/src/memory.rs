//! In-memory value store engine
//!
//! Maps a key prefix (the first N bytes of each key, full key by default)
//! to a list of values. Used for tests and for running an indexer without
//! persistence.

use crate::{merge_value, subtract_value, ValueStore};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use sextant_core::{Result, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Memory engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryValueStore {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<Value>>>>,
    prefix_len: Option<usize>,
}

impl MemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key entries by the first `n` bytes of each key instead of the full
    /// key. Keys shorter than `n` are used whole.
    pub fn with_prefix_len(n: usize) -> Self {
        Self {
            data: Arc::default(),
            prefix_len: Some(n),
        }
    }

    fn bucket_key(&self, key: &[u8]) -> Vec<u8> {
        match self.prefix_len {
            Some(n) if key.len() > n => key[..n].to_vec(),
            _ => key.to_vec(),
        }
    }

    /// Number of distinct keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().expect("RwLock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ValueStore for MemoryValueStore {
    async fn put(&self, value: &Value, keys: &[Vec<u8>]) -> Result<()> {
        let mut data = self.data.write().expect("RwLock poisoned");
        for key in keys {
            let bucket = data.entry(self.bucket_key(key)).or_default();
            merge_value(bucket, value);
        }
        Ok(())
    }

    async fn remove(&self, value: &Value, keys: &[Vec<u8>]) -> Result<()> {
        let mut data = self.data.write().expect("RwLock poisoned");
        for key in keys {
            let bucket_key = self.bucket_key(key);
            if let Some(bucket) = data.get_mut(&bucket_key) {
                subtract_value(bucket, value);
                if bucket.is_empty() {
                    data.remove(&bucket_key);
                }
            }
        }
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<Value>>> {
        Ok(self
            .data
            .read()
            .expect("RwLock poisoned")
            .get(&self.bucket_key(key))
            .cloned())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let data = self.data.read().expect("RwLock poisoned");
        let mut size = 0u64;
        for (key, values) in data.iter() {
            size += key.len() as u64;
            size += sextant_core::value::encode_values(values).len() as u64;
        }
        Ok(size)
    }

    async fn iter(&self) -> Result<BoxStream<'static, Result<(Vec<u8>, Vec<Value>)>>> {
        let snapshot: Vec<(Vec<u8>, Vec<Value>)> = self
            .data
            .read()
            .expect("RwLock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
