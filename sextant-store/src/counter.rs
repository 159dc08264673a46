//! Index count bookkeeping
//!
//! Tracks a monotonic estimate of distinct multihashes indexed per provider,
//! persisted to the datastore under `counts/<peer>`. Counts are operational
//! stats, not authoritative data; a configurable addend lets operators
//! account for items indexed outside the counter's observation.

use sextant_core::{Datastore, Error, PeerId, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const COUNTS_PREFIX: &str = "counts/";

/// Per-provider multihash counts.
#[derive(Debug)]
pub struct IndexCounts {
    ds: Arc<dyn Datastore>,
    counts: RwLock<HashMap<PeerId, u64>>,
    total_addend: AtomicU64,
}

impl IndexCounts {
    /// Create the counter, loading persisted counts from the datastore.
    pub async fn load(ds: Arc<dyn Datastore>) -> Result<Self> {
        let mut counts = HashMap::new();
        for key in ds.list(COUNTS_PREFIX).await? {
            let peer_str = &key[COUNTS_PREFIX.len()..];
            let Ok(peer) = PeerId::from_str(peer_str) else {
                tracing::warn!(key = %key, "Skipping malformed count key");
                continue;
            };
            if let Some(bytes) = ds.get(&key).await? {
                counts.insert(peer, decode_count(&bytes)?);
            }
        }
        Ok(Self {
            ds,
            counts: RwLock::new(counts),
            total_addend: AtomicU64::new(0),
        })
    }

    /// Set the operator adjustment added to the reported total.
    pub fn set_total_addend(&self, addend: u64) {
        self.total_addend.store(addend, Ordering::SeqCst);
    }

    /// Record `n` newly indexed multihashes for a provider.
    pub async fn add_count(&self, provider: &PeerId, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut counts = self.counts.write().await;
        let count = counts.entry(*provider).or_insert(0);
        *count += n;
        let value = count.to_le_bytes();
        self.ds
            .put(&format!("{}{}", COUNTS_PREFIX, provider), &value)
            .await
    }

    /// Drop a provider's count (admin removal).
    pub async fn remove_provider(&self, provider: &PeerId) -> Result<()> {
        self.counts.write().await.remove(provider);
        self.ds
            .delete(&format!("{}{}", COUNTS_PREFIX, provider))
            .await
    }

    /// Current estimate for one provider.
    pub async fn provider_count(&self, provider: &PeerId) -> u64 {
        self.counts
            .read()
            .await
            .get(provider)
            .copied()
            .unwrap_or(0)
    }

    /// Sum over all providers, without the addend.
    pub async fn total(&self) -> u64 {
        self.counts.read().await.values().sum()
    }

    /// Sum over all providers plus the operator addend.
    pub async fn total_with_addend(&self) -> u64 {
        self.total().await + self.total_addend.load(Ordering::SeqCst)
    }
}

fn decode_count(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::decode("count record is not 8 bytes"))?;
    Ok(u64::from_le_bytes(arr))
}
