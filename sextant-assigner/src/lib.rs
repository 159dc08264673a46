//! Publisher assignment for a fleet of indexers
//!
//! The assigner subscribes to the same announce topic as the indexers. On
//! an announce from an unassigned publisher it picks `replication` indexers
//! from its pool (fewest assigned publishers first, ties rotated), tells
//! each indexer's admin API to allow the publisher, persists the
//! assignment, and forwards the announce to the chosen indexers' ingest
//! APIs. Announces from already-assigned publishers are forwarded without
//! reassignment.

pub mod server;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sextant_core::schema::Announce;
use sextant_core::{Datastore, PeerId};
use sextant_ingest::AnnounceEvent;
use sextant_registry::{Policy, PolicyConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

const ASSIGNED_PREFIX: &str = "assigner/assigned/";

/// Result type alias using [`AssignerError`]
pub type Result<T> = std::result::Result<T, AssignerError>;

/// Assigner errors.
#[derive(Error, Debug)]
pub enum AssignerError {
    /// An indexer admin or ingest call failed.
    #[error("indexer API error: {0}")]
    Api(String),

    /// No indexer in the pool could take the assignment.
    #[error("no indexer available for assignment")]
    NoIndexers,

    #[error(transparent)]
    Core(#[from] sextant_core::Error),
}

/// One indexer in the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerConfig {
    pub admin_url: String,
    pub ingest_url: String,
}

/// Assigner configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignerConfig {
    pub indexer_pool: Vec<IndexerConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Announce topic, for logging and subscription.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// How many indexers each publisher is assigned to.
    #[serde(default = "default_replication")]
    pub replication: usize,
}

fn default_topic() -> String {
    sextant_ingest::DEFAULT_TOPIC.to_string()
}

fn default_replication() -> usize {
    1
}

/// The admin + ingest surface of one indexer, as seen by the assigner.
/// Behind a trait so tests run without HTTP servers.
#[async_trait]
pub trait IndexerApi: Debug + Send + Sync {
    /// Tell the indexer to allow a publisher.
    async fn allow(&self, admin_url: &str, peer: &PeerId) -> Result<()>;

    /// The peers the indexer currently allows.
    async fn list_allowed(&self, admin_url: &str) -> Result<Vec<PeerId>>;

    /// Forward an announce to the indexer's ingest API.
    async fn announce(&self, ingest_url: &str, announce: &Announce) -> Result<()>;
}

/// HTTP client for the indexer admin and ingest APIs.
#[derive(Debug, Clone)]
pub struct HttpIndexerApi {
    client: reqwest::Client,
}

impl HttpIndexerApi {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
        }
    }
}

impl Default for HttpIndexerApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexerApi for HttpIndexerApi {
    async fn allow(&self, admin_url: &str, peer: &PeerId) -> Result<()> {
        let url = format!(
            "{}/admin/allow?peer={}",
            admin_url.trim_end_matches('/'),
            peer
        );
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| AssignerError::Api(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AssignerError::Api(format!(
                "{}: status {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    async fn list_allowed(&self, admin_url: &str) -> Result<Vec<PeerId>> {
        let url = format!("{}/admin/list-allowed", admin_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AssignerError::Api(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AssignerError::Api(format!(
                "{}: status {}",
                url,
                response.status()
            )));
        }
        let ids: Vec<String> = response
            .json()
            .await
            .map_err(|e| AssignerError::Api(format!("{}: {}", url, e)))?;
        let mut peers = Vec::with_capacity(ids.len());
        for id in ids {
            peers.push(PeerId::from_str(&id)?);
        }
        Ok(peers)
    }

    async fn announce(&self, ingest_url: &str, announce: &Announce) -> Result<()> {
        let url = format!("{}/ingest/announce", ingest_url.trim_end_matches('/'));
        let response = self
            .client
            .put(&url)
            .header("content-type", "application/cbor")
            .body(announce.encode())
            .send()
            .await
            .map_err(|e| AssignerError::Api(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AssignerError::Api(format!(
                "{}: status {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct IndexerState {
    config: IndexerConfig,
    assigned: HashSet<PeerId>,
}

/// The assignment control loop.
#[derive(Debug)]
pub struct Assigner {
    indexers: Mutex<Vec<IndexerState>>,
    policy: RwLock<Policy>,
    ds: Arc<dyn Datastore>,
    api: Arc<dyn IndexerApi>,
    replication: usize,
    round_robin: AtomicUsize,
    watchers: Mutex<HashMap<PeerId, Vec<mpsc::UnboundedSender<String>>>>,
    dropped_announces: AtomicU64,
}

impl Assigner {
    /// Create the assigner: compile policy, load persisted assignments, and
    /// reconcile against each indexer's list-allowed endpoint so publishers
    /// already on an indexer count as pre-assigned.
    pub async fn new(
        config: AssignerConfig,
        ds: Arc<dyn Datastore>,
        api: Arc<dyn IndexerApi>,
    ) -> Result<Arc<Self>> {
        let policy = Policy::new(&config.policy)?;
        let mut indexers: Vec<IndexerState> = config
            .indexer_pool
            .into_iter()
            .map(|config| IndexerState {
                config,
                assigned: HashSet::new(),
            })
            .collect();

        // Persisted assignments from a previous run.
        for key in ds.list(ASSIGNED_PREFIX).await? {
            let Ok(peer) = PeerId::from_str(&key[ASSIGNED_PREFIX.len()..]) else {
                continue;
            };
            let Some(bytes) = ds.get(&key).await? else {
                continue;
            };
            let admin_urls: Vec<String> = serde_json::from_slice(&bytes)
                .map_err(|e| sextant_core::Error::decode(e.to_string()))?;
            for indexer in indexers.iter_mut() {
                if admin_urls.contains(&indexer.config.admin_url) {
                    indexer.assigned.insert(peer);
                }
            }
        }

        // Reconcile with what the indexers already allow.
        for indexer in indexers.iter_mut() {
            match api.list_allowed(&indexer.config.admin_url).await {
                Ok(peers) => {
                    for peer in peers {
                        indexer.assigned.insert(peer);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        indexer = %indexer.config.admin_url,
                        error = %e,
                        "Cannot read allowed peers at startup"
                    );
                }
            }
        }

        tracing::info!(
            indexers = indexers.len(),
            replication = config.replication,
            "Assigner ready"
        );

        Ok(Arc::new(Self {
            indexers: Mutex::new(indexers),
            policy: RwLock::new(policy),
            ds,
            api,
            replication: config.replication.max(1),
            round_robin: AtomicUsize::new(0),
            watchers: Mutex::new(HashMap::new()),
            dropped_announces: AtomicU64::new(0),
        }))
    }

    /// Subscribe to assignment events for a publisher. Each assignment
    /// delivers the admin URL of the chosen indexer.
    pub fn on_assignment(&self, peer: PeerId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().entry(peer).or_default().push(tx);
        rx
    }

    /// Admin URLs of the indexers a publisher is assigned to.
    pub fn assigned_indexers(&self, peer: &PeerId) -> Vec<String> {
        self.indexers
            .lock()
            .iter()
            .filter(|indexer| indexer.assigned.contains(peer))
            .map(|indexer| indexer.config.admin_url.clone())
            .collect()
    }

    /// Announces dropped by policy.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_announces.load(Ordering::Relaxed)
    }

    /// Handle one announce from the topic or the announce endpoint.
    pub async fn handle_announce(&self, event: AnnounceEvent) -> Result<()> {
        let publisher = event.publisher;

        let policy_ok = {
            let policy = self.policy.read();
            policy.allowed(&publisher) && policy.publish_allowed(&publisher, &publisher)
        };
        if !policy_ok {
            tracing::debug!(publisher = %publisher, "Announce dropped by policy");
            self.dropped_announces.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Already assigned: forward to the existing indexers only.
        let existing: Vec<IndexerConfig> = self
            .indexers
            .lock()
            .iter()
            .filter(|indexer| indexer.assigned.contains(&publisher))
            .map(|indexer| indexer.config.clone())
            .collect();
        if !existing.is_empty() {
            self.forward(&existing, &event.announce).await;
            return Ok(());
        }

        let picked = self.pick_indexers(self.replication);
        if picked.is_empty() {
            return Err(AssignerError::NoIndexers);
        }

        let mut assigned = Vec::new();
        for config in picked {
            match self.api.allow(&config.admin_url, &publisher).await {
                Ok(()) => assigned.push(config),
                Err(e) => {
                    tracing::warn!(
                        indexer = %config.admin_url,
                        publisher = %publisher,
                        error = %e,
                        "Cannot allow publisher on indexer"
                    );
                }
            }
        }
        if assigned.is_empty() {
            return Err(AssignerError::NoIndexers);
        }

        self.record_assignment(publisher, &assigned).await?;
        self.forward(&assigned, &event.announce).await;

        for config in &assigned {
            tracing::info!(
                publisher = %publisher,
                indexer = %config.admin_url,
                "Publisher assigned"
            );
        }
        Ok(())
    }

    /// Pick up to `count` indexers: fewest assigned publishers first, ties
    /// broken by a rotating offset.
    fn pick_indexers(&self, count: usize) -> Vec<IndexerConfig> {
        let indexers = self.indexers.lock();
        if indexers.is_empty() {
            return Vec::new();
        }
        let rotation = self.round_robin.fetch_add(1, Ordering::Relaxed) % indexers.len();
        let mut order: Vec<usize> = (0..indexers.len()).collect();
        order.sort_by_key(|&i| {
            (
                indexers[i].assigned.len(),
                (i + indexers.len() - rotation) % indexers.len(),
            )
        });
        order
            .into_iter()
            .take(count)
            .map(|i| indexers[i].config.clone())
            .collect()
    }

    async fn record_assignment(
        &self,
        publisher: PeerId,
        assigned: &[IndexerConfig],
    ) -> Result<()> {
        let admin_urls: Vec<String> = {
            let mut indexers = self.indexers.lock();
            for indexer in indexers.iter_mut() {
                if assigned.contains(&indexer.config) {
                    indexer.assigned.insert(publisher);
                }
            }
            assigned.iter().map(|c| c.admin_url.clone()).collect()
        };

        let record = serde_json::to_vec(&admin_urls)
            .map_err(|e| sextant_core::Error::other(e.to_string()))?;
        self.ds
            .put(&format!("{}{}", ASSIGNED_PREFIX, publisher), &record)
            .await?;

        if let Some(watchers) = self.watchers.lock().get(&publisher) {
            for watcher in watchers {
                for url in &admin_urls {
                    let _ = watcher.send(url.clone());
                }
            }
        }
        Ok(())
    }

    async fn forward(&self, indexers: &[IndexerConfig], announce: &Announce) {
        for config in indexers {
            if let Err(e) = self.api.announce(&config.ingest_url, announce).await {
                tracing::warn!(
                    indexer = %config.ingest_url,
                    error = %e,
                    "Cannot forward announce to indexer"
                );
            }
        }
    }
}

/// Mock indexer API shared by unit and router tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Records admin/ingest calls instead of making them.
    #[derive(Debug, Default)]
    pub struct MockApi {
        pub allowed: Mutex<HashMap<String, Vec<PeerId>>>,
        pub announced: Mutex<Vec<(String, Announce)>>,
        pub preallowed: Mutex<HashMap<String, Vec<PeerId>>>,
    }

    #[async_trait]
    impl IndexerApi for MockApi {
        async fn allow(&self, admin_url: &str, peer: &PeerId) -> Result<()> {
            self.allowed
                .lock()
                .entry(admin_url.to_string())
                .or_default()
                .push(*peer);
            Ok(())
        }

        async fn list_allowed(&self, admin_url: &str) -> Result<Vec<PeerId>> {
            Ok(self
                .preallowed
                .lock()
                .get(admin_url)
                .cloned()
                .unwrap_or_default())
        }

        async fn announce(&self, ingest_url: &str, announce: &Announce) -> Result<()> {
            self.announced
                .lock()
                .push((ingest_url.to_string(), announce.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::MockApi;
    use super::*;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::cid_for_data;
    use sextant_core::MemoryDatastore;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32]))
    }

    fn event(seed: u8, payload: &[u8]) -> AnnounceEvent {
        AnnounceEvent {
            publisher: peer(seed),
            announce: Announce {
                cid: cid_for_data(0x71, payload),
                addrs: vec![format!("http://pub.test:9999/p2p/{}", peer(seed))],
            },
        }
    }

    fn pool(n: usize) -> Vec<IndexerConfig> {
        (0..n)
            .map(|i| IndexerConfig {
                admin_url: format!("http://indexer-{}.test:3602", i),
                ingest_url: format!("http://indexer-{}.test:3601", i),
            })
            .collect()
    }

    fn config_for(publisher: PeerId, n: usize) -> AssignerConfig {
        AssignerConfig {
            indexer_pool: pool(n),
            policy: PolicyConfig {
                allow: false,
                except: vec![publisher.to_string()],
                publish: false,
                publish_except: vec![],
            },
            topic: default_topic(),
            replication: 1,
        }
    }

    #[tokio::test]
    async fn test_announce_assigns_and_forwards() {
        let publisher = peer(1);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        let assigner = Assigner::new(config_for(publisher, 2), ds, api.clone())
            .await
            .unwrap();

        let mut assignments = assigner.on_assignment(publisher);
        assigner.handle_announce(event(1, b"head-1")).await.unwrap();

        let admin_url = assignments.recv().await.unwrap();
        assert!(admin_url.starts_with("http://indexer-"));
        assert_eq!(assigner.assigned_indexers(&publisher), vec![admin_url.clone()]);
        assert_eq!(api.allowed.lock().get(&admin_url).unwrap(), &vec![publisher]);
        assert_eq!(api.announced.lock().len(), 1);

        // Second announce reuses the assignment: no new allow calls.
        assigner.handle_announce(event(1, b"head-2")).await.unwrap();
        assert_eq!(api.allowed.lock().get(&admin_url).unwrap().len(), 1);
        assert_eq!(api.announced.lock().len(), 2);
        assert_eq!(assigner.assigned_indexers(&publisher).len(), 1);
    }

    #[tokio::test]
    async fn test_policy_denied_announce_dropped() {
        let publisher = peer(1);
        let other = peer(2);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        let assigner = Assigner::new(config_for(publisher, 1), ds, api.clone())
            .await
            .unwrap();

        assigner.handle_announce(event(2, b"head")).await.unwrap();
        assert_eq!(assigner.dropped_count(), 1);
        assert!(assigner.assigned_indexers(&other).is_empty());
        assert!(api.announced.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_based_selection() {
        let p1 = peer(1);
        let p2 = peer(2);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        let mut config = config_for(p1, 2);
        config.policy.except.push(p2.to_string());
        let assigner = Assigner::new(config, ds, api).await.unwrap();

        assigner.handle_announce(event(1, b"h1")).await.unwrap();
        assigner.handle_announce(event(2, b"h2")).await.unwrap();

        // With load-based selection, the two publishers land on different
        // indexers.
        let i1 = assigner.assigned_indexers(&p1);
        let i2 = assigner.assigned_indexers(&p2);
        assert_eq!(i1.len(), 1);
        assert_eq!(i2.len(), 1);
        assert_ne!(i1[0], i2[0]);
    }

    #[tokio::test]
    async fn test_replication_factor() {
        let publisher = peer(1);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        let mut config = config_for(publisher, 3);
        config.replication = 2;
        let assigner = Assigner::new(config, ds, api.clone()).await.unwrap();

        assigner.handle_announce(event(1, b"head")).await.unwrap();
        assert_eq!(assigner.assigned_indexers(&publisher).len(), 2);
        assert_eq!(api.announced.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_startup_reconciles_preassigned() {
        let publisher = peer(1);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        api.preallowed
            .lock()
            .insert("http://indexer-0.test:3602".to_string(), vec![publisher]);

        let assigner = Assigner::new(config_for(publisher, 2), ds, api.clone())
            .await
            .unwrap();
        assert_eq!(
            assigner.assigned_indexers(&publisher),
            vec!["http://indexer-0.test:3602".to_string()]
        );

        // An announce forwards without allocating a new indexer.
        assigner.handle_announce(event(1, b"head")).await.unwrap();
        assert!(api.allowed.lock().is_empty());
        assert_eq!(api.announced.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_assignments_persist_across_restart() {
        let publisher = peer(1);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        {
            let assigner = Assigner::new(config_for(publisher, 2), ds.clone(), api.clone())
                .await
                .unwrap();
            assigner.handle_announce(event(1, b"head")).await.unwrap();
        }

        let restarted = Assigner::new(config_for(publisher, 2), ds, api.clone())
            .await
            .unwrap();
        assert_eq!(restarted.assigned_indexers(&publisher).len(), 1);

        restarted.handle_announce(event(1, b"head-2")).await.unwrap();
        // Still one allow call in total: the restart did not reassign.
        let total_allows: usize = api.allowed.lock().values().map(|v| v.len()).sum();
        assert_eq!(total_allows, 1);
    }

    #[tokio::test]
    async fn test_empty_pool_errors() {
        let publisher = peer(1);
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let api = Arc::new(MockApi::default());
        let assigner = Assigner::new(config_for(publisher, 0), ds, api).await.unwrap();

        let err = assigner.handle_announce(event(1, b"head")).await.unwrap_err();
        assert!(matches!(err, AssignerError::NoIndexers));
    }
}
