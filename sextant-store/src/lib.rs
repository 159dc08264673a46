//! Value store engines for the sextant content index
//!
//! The value store is the write-heavy (multihash → list-of-values) index at
//! the heart of every indexer. This crate defines the [`ValueStore`]
//! contract, two engines that satisfy it, a bounded [`ResultCache`] read
//! front, the [`Engine`] composition used by ingest and find paths, and the
//! [`IndexCounts`] operational counter.
//!
//! ## Engines
//!
//! - [`MemoryValueStore`]: map-based, used in tests
//! - [`RedbValueStore`]: durable embedded engine for the daemon
//!
//! The engine choice is process-static; everything above the trait treats
//! engines uniformly apart from the `min_key_length` hint that short keys
//! must be padded up to.

pub mod cache;
pub mod counter;
pub mod engine;
pub mod memory;
pub mod redb_store;

pub use cache::ResultCache;
pub use counter::IndexCounts;
pub use engine::Engine;
pub use memory::MemoryValueStore;
pub use redb_store::{RedbValueStore, RedbValueStoreConfig};

use async_trait::async_trait;
use futures::stream::BoxStream;
use sextant_core::{Result, Value};
use std::fmt::Debug;

/// The (multihash → values) storage contract.
///
/// Keys are raw (already padded) multihash bytes. `put` is union-append:
/// the stored list for each key becomes `old ∪ {value}`, where a value
/// occupying the same (provider, context) slot is replaced. `remove`
/// subtracts the value's slot. Both are idempotent. The order of values
/// returned by `get` is unspecified.
#[async_trait]
pub trait ValueStore: Debug + Send + Sync {
    /// Append a value to each of the given keys.
    async fn put(&self, value: &Value, keys: &[Vec<u8>]) -> Result<()>;

    /// Remove the value's (provider, context) slot from each key.
    async fn remove(&self, value: &Value, keys: &[Vec<u8>]) -> Result<()>;

    /// Current value list for a key, or `None` if the key is absent.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<Value>>>;

    /// Flush buffered writes.
    async fn flush(&self) -> Result<()>;

    /// Approximate on-disk size in bytes.
    async fn size(&self) -> Result<u64>;

    /// Stream all (key, values) pairs. Used by maintenance jobs only.
    async fn iter(&self) -> Result<BoxStream<'static, Result<(Vec<u8>, Vec<Value>)>>>;

    /// Release resources. Further operations may fail.
    async fn close(&self) -> Result<()>;

    /// Minimum key length this engine can index; shorter keys must be
    /// padded by the caller before any operation.
    fn min_key_length(&self) -> usize {
        0
    }
}

/// Merge a value into a list under slot semantics: a value with the same
/// (provider, context) replaces the old entry, otherwise it is appended.
/// Returns true if the list changed.
pub(crate) fn merge_value(values: &mut Vec<Value>, value: &Value) -> bool {
    for existing in values.iter_mut() {
        if existing.same_slot(value) {
            if existing == value {
                return false;
            }
            *existing = value.clone();
            return true;
        }
    }
    values.push(value.clone());
    true
}

/// Remove a value's slot from a list. Returns true if the list changed.
pub(crate) fn subtract_value(values: &mut Vec<Value>, value: &Value) -> bool {
    let before = values.len();
    values.retain(|existing| !existing.same_slot(value));
    values.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sextant_core::PeerId;

    fn value(seed: u8, ctx: &[u8], meta: &[u8]) -> Value {
        Value::new(
            PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32])),
            ctx.to_vec(),
            meta.to_vec(),
        )
    }

    #[test]
    fn test_merge_value_appends_and_replaces() {
        let mut values = Vec::new();
        let a = value(1, b"ctx", b"m1");
        assert!(merge_value(&mut values, &a));
        // Same value again: no change.
        assert!(!merge_value(&mut values, &a));
        assert_eq!(values.len(), 1);

        // Same slot, new metadata: replaced in place.
        let a2 = value(1, b"ctx", b"m2");
        assert!(merge_value(&mut values, &a2));
        assert_eq!(values, vec![a2.clone()]);

        // Different context: appended.
        let b = value(1, b"other", b"m1");
        assert!(merge_value(&mut values, &b));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_subtract_value_matches_slot() {
        let mut values = vec![value(1, b"ctx", b"m1"), value(2, b"ctx", b"m1")];
        // Metadata differs, but the slot matches.
        assert!(subtract_value(&mut values, &value(1, b"ctx", b"other-meta")));
        assert_eq!(values.len(), 1);
        // Absent slot: no change.
        assert!(!subtract_value(&mut values, &value(3, b"ctx", b"m1")));
    }
}
