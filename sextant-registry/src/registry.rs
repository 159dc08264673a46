//! Provider registry
//!
//! The authoritative record of known providers and publishers, their policy
//! state, and the freeze latch. Records are held in memory behind a
//! reader-writer lock and persisted to the ancillary datastore under
//! `registry/<peer-id>`.

use crate::policy::{Policy, PolicyConfig};
use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use sextant_core::link::cid_serde_opt;
use sextant_core::schema::ExtendedProviderEntry;
use sextant_core::{Cid, Datastore, Error, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const PROVIDER_PREFIX: &str = "registry/";
const FROZEN_MARKER_KEY: &str = "indexer/frozen";

/// Stored record for one provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub peer_id: PeerId,
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Peer publishing advertisements for this provider; may differ from
    /// the provider itself.
    #[serde(default)]
    pub publisher: Option<PeerId>,
    #[serde(default)]
    pub publisher_addresses: Vec<String>,
    /// Head of the last fully indexed advertisement chain.
    #[serde(default, with = "cid_serde_opt")]
    pub last_advertisement: Option<Cid>,
    #[serde(default)]
    pub last_advertisement_time: Option<DateTime<Utc>>,
    /// Per-context alternate providers, keyed by hex context id. The empty
    /// key holds chain-level extended providers.
    #[serde(default)]
    pub extended_providers: HashMap<String, Vec<ExtendedProviderEntry>>,
    /// Head snapshot taken when the indexer froze; used to resume.
    #[serde(default, with = "cid_serde_opt")]
    pub frozen_at_advertisement: Option<Cid>,
    /// Estimated number of indexed multihashes.
    #[serde(default)]
    pub index_count: u64,
}

impl ProviderInfo {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addresses: Vec::new(),
            publisher: None,
            publisher_addresses: Vec::new(),
            last_advertisement: None,
            last_advertisement_time: None,
            extended_providers: HashMap::new(),
            frozen_at_advertisement: None,
            index_count: 0,
        }
    }

    /// All extended providers that apply to the given context: chain-level
    /// entries plus entries registered for exactly this context.
    pub fn extended_providers_for(&self, context_id: &[u8]) -> Vec<ExtendedProviderEntry> {
        let mut out = Vec::new();
        if let Some(chain_level) = self.extended_providers.get("") {
            out.extend(chain_level.iter().cloned());
        }
        if !context_id.is_empty() {
            if let Some(scoped) = self.extended_providers.get(&hex::encode(context_id)) {
                out.extend(scoped.iter().cloned());
            }
        }
        out
    }
}

/// Fields applied by a registry update after a successful sync or an
/// accepted announcement.
#[derive(Clone, Debug)]
pub struct ProviderUpdate {
    pub provider: PeerId,
    /// Replaces stored addresses when non-empty.
    pub addresses: Vec<String>,
    pub publisher: Option<PeerId>,
    pub publisher_addresses: Vec<String>,
    /// Advances the provider's head when set.
    pub last_advertisement: Option<Cid>,
    /// Context the extended providers below are scoped to; empty for
    /// chain-level entries.
    pub context_id: Vec<u8>,
    /// Extended providers to merge. Replaces any prior entries stored for
    /// the same context; other contexts are left untouched.
    pub extended_providers: Vec<ExtendedProviderEntry>,
    /// Multihashes newly indexed by this update (added to the estimate).
    pub added_count: u64,
}

impl ProviderUpdate {
    pub fn new(provider: PeerId) -> Self {
        Self {
            provider,
            addresses: Vec::new(),
            publisher: None,
            publisher_addresses: Vec::new(),
            last_advertisement: None,
            context_id: Vec::new(),
            extended_providers: Vec::new(),
            added_count: 0,
        }
    }
}

/// Provider registry with policy and freeze state.
#[derive(Debug)]
pub struct Registry {
    ds: Arc<dyn Datastore>,
    providers: RwLock<HashMap<PeerId, ProviderInfo>>,
    policy: SyncRwLock<Policy>,
    frozen: Arc<AtomicBool>,
}

impl Registry {
    /// Create a registry, loading persisted provider records and the freeze
    /// marker from the datastore.
    pub async fn new(policy_cfg: &PolicyConfig, ds: Arc<dyn Datastore>) -> Result<Self> {
        let policy = Policy::new(policy_cfg)?;

        let mut providers = HashMap::new();
        for key in ds.list(PROVIDER_PREFIX).await? {
            let Some(bytes) = ds.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<ProviderInfo>(&bytes) {
                Ok(info) => {
                    providers.insert(info.peer_id, info);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable provider record");
                }
            }
        }

        let frozen = ds.has(FROZEN_MARKER_KEY).await?;
        if frozen {
            tracing::warn!("Registry loaded in frozen state");
        }
        tracing::info!(providers = providers.len(), "Provider registry loaded");

        Ok(Self {
            ds,
            providers: RwLock::new(providers),
            policy: SyncRwLock::new(policy),
            frozen: Arc::new(AtomicBool::new(frozen)),
        })
    }

    // ------------------------------------------------------------------
    // Provider records
    // ------------------------------------------------------------------

    pub async fn provider_info(&self, peer: &PeerId) -> Option<ProviderInfo> {
        self.providers.read().await.get(peer).cloned()
    }

    pub async fn all_providers(&self) -> Vec<ProviderInfo> {
        let mut all: Vec<ProviderInfo> = self.providers.read().await.values().cloned().collect();
        all.sort_by_key(|p| p.peer_id);
        all
    }

    /// Upsert a provider record.
    ///
    /// While frozen, updates to existing providers (head advances from an
    /// in-flight pass) are accepted but registering a new provider is
    /// refused.
    pub async fn update(&self, update: ProviderUpdate) -> Result<()> {
        let mut providers = self.providers.write().await;

        let info = match providers.get_mut(&update.provider) {
            Some(info) => info,
            None => {
                if self.frozen() {
                    return Err(Error::Frozen);
                }
                providers
                    .entry(update.provider)
                    .or_insert_with(|| ProviderInfo::new(update.provider))
            }
        };

        if !update.addresses.is_empty() {
            info.addresses = update.addresses;
        }
        if let Some(publisher) = update.publisher {
            info.publisher = Some(publisher);
            if !update.publisher_addresses.is_empty() {
                info.publisher_addresses = update.publisher_addresses;
            }
        }
        if let Some(cid) = update.last_advertisement {
            info.last_advertisement = Some(cid);
            info.last_advertisement_time = Some(Utc::now());
        }
        if !update.extended_providers.is_empty() {
            info.extended_providers.insert(
                hex::encode(&update.context_id),
                update.extended_providers,
            );
        }
        info.index_count += update.added_count;

        let record = serde_json::to_vec(&*info)
            .map_err(|e| Error::other(format!("cannot encode provider record: {}", e)))?;
        self.ds
            .put(&provider_key(&update.provider), &record)
            .await
    }

    /// Delete a provider record.
    ///
    /// The provider's mapping contributions in the value store are not
    /// swept; find responses drop values whose provider is unknown, so the
    /// orphaned mappings are unreachable until overwritten.
    pub async fn remove_provider(&self, peer: &PeerId) -> Result<()> {
        self.providers.write().await.remove(peer);
        self.ds.delete(&provider_key(peer)).await
    }

    // ------------------------------------------------------------------
    // Policy
    // ------------------------------------------------------------------

    /// Replace the policy from config (reload path). No reader observes a
    /// half-applied policy.
    pub fn set_policy(&self, cfg: &PolicyConfig) -> Result<()> {
        let new_policy = Policy::new(cfg)?;
        self.policy.write().copy(&new_policy);
        Ok(())
    }

    pub fn allowed(&self, peer: &PeerId) -> bool {
        self.policy.read().allowed(peer)
    }

    pub fn publish_allowed(&self, publisher: &PeerId, provider: &PeerId) -> bool {
        self.policy.read().publish_allowed(publisher, provider)
    }

    /// Flip a peer to allowed (admin API). Returns true if changed.
    pub fn allow_peer(&self, peer: PeerId) -> bool {
        self.policy.write().allow(peer)
    }

    /// Flip a peer to blocked (admin API). Returns true if changed.
    pub fn block_peer(&self, peer: PeerId) -> bool {
        self.policy.write().block(peer)
    }

    pub fn policy_config(&self) -> PolicyConfig {
        self.policy.read().to_config()
    }

    /// Peers explicitly allowed under a default-block policy.
    pub fn allowed_peers(&self) -> Vec<PeerId> {
        self.policy.read().allowed_peers()
    }

    // ------------------------------------------------------------------
    // Freeze lifecycle
    // ------------------------------------------------------------------

    pub fn frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// The freeze latch, shared with the value store engine so puts are
    /// refused the moment the registry freezes.
    pub fn frozen_flag(&self) -> Arc<AtomicBool> {
        self.frozen.clone()
    }

    /// Latch the registry frozen: persist the marker and snapshot every
    /// provider's current head as its resume point.
    pub async fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::warn!("Freezing indexer: no new multihashes will be ingested");
        self.ds.put(FROZEN_MARKER_KEY, b"frozen").await?;

        let mut providers = self.providers.write().await;
        for info in providers.values_mut() {
            info.frozen_at_advertisement = info.last_advertisement;
            let record = serde_json::to_vec(&*info)
                .map_err(|e| Error::other(format!("cannot encode provider record: {}", e)))?;
            self.ds.put(&provider_key(&info.peer_id), &record).await?;
        }
        Ok(())
    }

    /// Clear the freeze latch and return the providers that were frozen,
    /// with the heads to resume from.
    pub async fn unfreeze(&self) -> Result<Vec<(PeerId, Option<Cid>)>> {
        self.frozen.store(false, Ordering::SeqCst);
        self.ds.delete(FROZEN_MARKER_KEY).await?;

        let mut resumed = Vec::new();
        let mut providers = self.providers.write().await;
        for info in providers.values_mut() {
            if info.frozen_at_advertisement.is_some() || info.last_advertisement.is_some() {
                resumed.push((info.peer_id, info.frozen_at_advertisement));
            }
            info.frozen_at_advertisement = None;
            let record = serde_json::to_vec(&*info)
                .map_err(|e| Error::other(format!("cannot encode provider record: {}", e)))?;
            self.ds.put(&provider_key(&info.peer_id), &record).await?;
        }
        tracing::info!(providers = resumed.len(), "Indexer unfrozen");
        Ok(resumed)
    }
}

fn provider_key(peer: &PeerId) -> String {
    format!("{}{}", PROVIDER_PREFIX, peer)
}

/// Parse a peer id from an admin-supplied string, mapping errors uniformly.
pub fn parse_peer_id(s: &str) -> Result<PeerId> {
    PeerId::from_str(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::cid_for_data;
    use sextant_core::MemoryDatastore;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32]))
    }

    fn allow_all() -> PolicyConfig {
        PolicyConfig {
            allow: true,
            ..Default::default()
        }
    }

    async fn new_registry(ds: Arc<dyn Datastore>) -> Registry {
        Registry::new(&allow_all(), ds).await.unwrap()
    }

    #[tokio::test]
    async fn test_update_creates_and_persists() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let reg = new_registry(ds.clone()).await;

        let provider = peer(1);
        let head = cid_for_data(0x71, b"ad-1");
        let mut update = ProviderUpdate::new(provider);
        update.addresses = vec!["http://127.0.0.1:3200".to_string()];
        update.last_advertisement = Some(head);
        reg.update(update).await.unwrap();

        let info = reg.provider_info(&provider).await.unwrap();
        assert_eq!(info.last_advertisement, Some(head));
        assert!(info.last_advertisement_time.is_some());

        // A reloaded registry sees the persisted record.
        let reg2 = new_registry(ds).await;
        let info2 = reg2.provider_info(&provider).await.unwrap();
        assert_eq!(info2.last_advertisement, Some(head));
    }

    #[tokio::test]
    async fn test_remove_provider() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let reg = new_registry(ds.clone()).await;
        let provider = peer(1);

        reg.update(ProviderUpdate::new(provider)).await.unwrap();
        assert!(reg.provider_info(&provider).await.is_some());

        reg.remove_provider(&provider).await.unwrap();
        assert!(reg.provider_info(&provider).await.is_none());
        assert!(new_registry(ds).await.provider_info(&provider).await.is_none());
    }

    #[tokio::test]
    async fn test_extended_providers_merge_per_context() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let reg = new_registry(ds).await;
        let provider = peer(1);
        let alt_a = ExtendedProviderEntry {
            peer_id: peer(2),
            addrs: vec!["http://a".to_string()],
            metadata: vec![],
        };
        let alt_b = ExtendedProviderEntry {
            peer_id: peer(3),
            addrs: vec!["http://b".to_string()],
            metadata: vec![],
        };

        let mut u1 = ProviderUpdate::new(provider);
        u1.context_id = b"ctx-1".to_vec();
        u1.extended_providers = vec![alt_a.clone()];
        reg.update(u1).await.unwrap();

        // A different context merges alongside the first.
        let mut u2 = ProviderUpdate::new(provider);
        u2.context_id = b"ctx-2".to_vec();
        u2.extended_providers = vec![alt_b.clone()];
        reg.update(u2).await.unwrap();

        let info = reg.provider_info(&provider).await.unwrap();
        assert_eq!(info.extended_providers_for(b"ctx-1"), vec![alt_a.clone()]);
        assert_eq!(info.extended_providers_for(b"ctx-2"), vec![alt_b.clone()]);

        // Repeating a context replaces only that context's entries.
        let mut u3 = ProviderUpdate::new(provider);
        u3.context_id = b"ctx-1".to_vec();
        u3.extended_providers = vec![alt_b.clone()];
        reg.update(u3).await.unwrap();

        let info = reg.provider_info(&provider).await.unwrap();
        assert_eq!(info.extended_providers_for(b"ctx-1"), vec![alt_b.clone()]);
        assert_eq!(info.extended_providers_for(b"ctx-2"), vec![alt_b]);
    }

    #[tokio::test]
    async fn test_freeze_snapshots_heads_and_refuses_new_providers() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let reg = new_registry(ds.clone()).await;
        let provider = peer(1);
        let head = cid_for_data(0x71, b"ad-1");

        let mut update = ProviderUpdate::new(provider);
        update.last_advertisement = Some(head);
        reg.update(update).await.unwrap();

        reg.freeze().await.unwrap();
        assert!(reg.frozen());

        let info = reg.provider_info(&provider).await.unwrap();
        assert_eq!(info.frozen_at_advertisement, Some(head));

        // Existing provider updates still land while frozen.
        let head2 = cid_for_data(0x71, b"ad-2");
        let mut update = ProviderUpdate::new(provider);
        update.last_advertisement = Some(head2);
        reg.update(update).await.unwrap();

        // New providers are refused.
        let err = reg.update(ProviderUpdate::new(peer(2))).await.unwrap_err();
        assert!(matches!(err, Error::Frozen));

        // Frozen state survives a reload.
        let reg2 = new_registry(ds).await;
        assert!(reg2.frozen());
    }

    #[tokio::test]
    async fn test_unfreeze_returns_resume_points() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let reg = new_registry(ds).await;
        let provider = peer(1);
        let head = cid_for_data(0x71, b"ad-1");

        let mut update = ProviderUpdate::new(provider);
        update.last_advertisement = Some(head);
        reg.update(update).await.unwrap();

        reg.freeze().await.unwrap();
        let resumed = reg.unfreeze().await.unwrap();
        assert!(!reg.frozen());
        assert_eq!(resumed, vec![(provider, Some(head))]);

        let info = reg.provider_info(&provider).await.unwrap();
        assert_eq!(info.frozen_at_advertisement, None);
    }

    #[tokio::test]
    async fn test_policy_surface() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let trusted = peer(1);
        let other = peer(2);
        let cfg = PolicyConfig {
            allow: false,
            except: vec![trusted.to_string()],
            publish: false,
            publish_except: vec![],
        };
        let reg = Registry::new(&cfg, ds).await.unwrap();

        assert!(reg.allowed(&trusted));
        assert!(!reg.allowed(&other));
        assert_eq!(reg.allowed_peers(), vec![trusted]);

        assert!(reg.allow_peer(other));
        assert!(reg.allowed(&other));

        // Reload flips membership immediately.
        reg.set_policy(&PolicyConfig {
            allow: true,
            except: vec![other.to_string()],
            publish: true,
            publish_except: vec![],
        })
        .unwrap();
        assert!(reg.allowed(&trusted));
        assert!(!reg.allowed(&other));
    }
}
