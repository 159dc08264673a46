//! Advertisement ingestion pipeline
//!
//! The [`Ingester`] keeps the local index consistent with each allowed
//! publisher's advertisement chain. Announces arrive from the topic
//! subscription or the ingest HTTP endpoint, collapse per publisher
//! (keep-latest-head), and are drained by a bounded worker pool. Each job
//! syncs the chain backward to the publisher's recorded head, validates
//! signatures, then applies advertisements forward in chain order: removals
//! delete, entry chains index in batches, and the head pointer advances only
//! after an advertisement has fully applied. Staged blocks survive a crash
//! and are either applied again (puts are idempotent) or archived.

pub mod announce;
pub mod backoff;
pub mod carwriter;
pub mod error;
pub mod ratelimit;
pub mod transport;

pub use announce::{AnnounceBus, AnnounceEvent, AnnounceSource, DEFAULT_TOPIC};
pub use carwriter::{decode_car, encode_car, CarWriter};
pub use error::{IngestError, Result};
pub use transport::{AdTransport, HttpTransport, MemTransport};

use crate::backoff::ExponentialBackoff;
use crate::ratelimit::RateLimiter;
use parking_lot::Mutex;
use sextant_core::schema::{Advertisement, Entries, EntryNode};
use sextant_core::{Cid, Datastore, Error, PeerId, Value};
use sextant_registry::{ProviderUpdate, Registry};
use sextant_store::{Engine, IndexCounts};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

const HEAD_PREFIX: &str = "ingester/last_ad/";

/// Ingester tunables. Worker count and rate limit are runtime-adjustable
/// through [`Ingester::run_workers`] and [`Ingester::set_rate_limit`].
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Announce topic name, for logging and subscription.
    pub topic: String,
    /// Number of concurrent sync+index workers.
    pub worker_count: usize,
    /// Multihashes per engine put/remove batch.
    pub batch_size: usize,
    /// Maximum chain depth fetched in one sync (cycle defense).
    pub sync_depth_limit: usize,
    /// Block fetches per second per publisher; zero disables limiting.
    pub rate_limit_per_publisher: f64,
    /// Initial and maximum backoff for transient sync failures.
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            worker_count: 8,
            batch_size: 1024,
            sync_depth_limit: 4096,
            rate_limit_per_publisher: 0.0,
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
        }
    }
}

struct WorkerHandle {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// The ingestion pipeline.
pub struct Ingester {
    config: IngestConfig,
    engine: Arc<Engine>,
    registry: Arc<Registry>,
    ds: Arc<dyn Datastore>,
    transport: Arc<dyn AdTransport>,
    counts: Arc<IndexCounts>,
    carwriter: Option<CarWriter>,
    rate_limiter: RateLimiter,

    /// Latest pending announce per publisher (keep-latest coalescing).
    pending: Mutex<HashMap<PeerId, AnnounceEvent>>,
    queue_tx: mpsc::UnboundedSender<PeerId>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<PeerId>>,

    /// One sync at a time per publisher.
    sync_locks: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,
    /// Publishers latched failed after a validation error.
    failed: Mutex<HashMap<PeerId, String>>,
    retries: Mutex<HashMap<PeerId, ExponentialBackoff>>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutdown: CancellationToken,
    dropped_announces: AtomicU64,
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester")
            .field("topic", &self.config.topic)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl Ingester {
    /// Create the ingester and start its worker pool.
    ///
    /// Pass a [`CarWriter`] to archive applied advertisements; without one,
    /// staged blocks are deleted after they are applied.
    pub fn new(
        config: IngestConfig,
        engine: Arc<Engine>,
        registry: Arc<Registry>,
        ds: Arc<dyn Datastore>,
        transport: Arc<dyn AdTransport>,
        counts: Arc<IndexCounts>,
        carwriter: Option<CarWriter>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let rate_limiter = RateLimiter::new(config.rate_limit_per_publisher);
        let worker_count = config.worker_count;

        let ingester = Arc::new(Self {
            config,
            engine,
            registry,
            ds,
            transport,
            counts,
            carwriter,
            rate_limiter,
            pending: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            sync_locks: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            dropped_announces: AtomicU64::new(0),
        });
        ingester.run_workers(worker_count);
        ingester
    }

    // ------------------------------------------------------------------
    // Announce intake
    // ------------------------------------------------------------------

    /// Handle an announce from the topic or the direct HTTP endpoint.
    ///
    /// Policy-denied and failed-latched publishers are dropped silently
    /// (the drop count is exposed); an announce for the already-current
    /// head is a no-op; otherwise the announce coalesces with any pending
    /// one for the same publisher, keeping the latest head.
    pub async fn announce(&self, event: AnnounceEvent) -> Result<()> {
        let publisher = event.publisher;

        if !self.registry.allowed(&publisher) {
            tracing::debug!(publisher = %publisher, "Announce dropped by policy");
            self.dropped_announces.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if let Some(reason) = self.failed.lock().get(&publisher) {
            tracing::warn!(
                publisher = %publisher,
                reason = %reason,
                "Announce dropped: publisher latched failed"
            );
            self.dropped_announces.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if self.head(&publisher).await? == Some(event.announce.cid) {
            tracing::debug!(
                publisher = %publisher,
                head = %event.announce.cid,
                "Announce for current head, nothing to sync"
            );
            return Ok(());
        }

        let newly_queued = self.pending.lock().insert(publisher, event).is_none();
        if newly_queued {
            // A send error only means shutdown already started.
            let _ = self.queue_tx.send(publisher);
        }
        Ok(())
    }

    /// Pump an announce source (topic subscription) into the queue.
    pub fn attach_source(
        self: &Arc<Self>,
        mut source: impl AnnounceSource + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let ingester = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ingester.shutdown.cancelled() => return,
                    event = source.recv() => {
                        let Some(event) = event else { return };
                        if let Err(e) = ingester.announce(event).await {
                            tracing::warn!(error = %e, "Error handling announce");
                        }
                    }
                }
            }
        })
    }

    /// Announces dropped by policy or the failed latch.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_announces.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Worker pool
    // ------------------------------------------------------------------

    /// Resize the worker pool (reload path).
    pub fn run_workers(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock();
        while workers.len() < count {
            let cancel = CancellationToken::new();
            let ingester = self.clone();
            let worker_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                ingester.worker_loop(worker_cancel).await;
            });
            workers.push(WorkerHandle { cancel, handle });
        }
        while workers.len() > count {
            if let Some(worker) = workers.pop() {
                worker.cancel.cancel();
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let publisher = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.shutdown.cancelled() => return,
                received = async {
                    let mut rx = self.queue_rx.lock().await;
                    rx.recv().await
                } => match received {
                    Some(publisher) => publisher,
                    None => return,
                },
            };
            self.process_publisher(publisher).await;
        }
    }

    fn publisher_lock(&self, publisher: PeerId) -> Arc<AsyncMutex<()>> {
        self.sync_locks
            .lock()
            .entry(publisher)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn process_publisher(self: &Arc<Self>, publisher: PeerId) {
        let Some(event) = self.pending.lock().remove(&publisher) else {
            return;
        };

        let lock = self.publisher_lock(publisher);
        let _guard = lock.lock().await;

        match self.sync_and_index(&event).await {
            Ok(applied) => {
                self.retries.lock().remove(&publisher);
                if applied > 0 {
                    tracing::info!(
                        publisher = %publisher,
                        head = %event.announce.cid,
                        applied,
                        "Advertisement chain indexed"
                    );
                }
            }
            Err(e) if e.is_frozen() => {
                tracing::info!(
                    publisher = %publisher,
                    "Indexing interrupted by freeze; head stays at last applied advertisement"
                );
            }
            Err(IngestError::NotAllowed(peer)) => {
                tracing::warn!(publisher = %publisher, peer = %peer, "Sync halted by policy");
            }
            Err(e) if e.is_validation() => {
                tracing::error!(
                    publisher = %publisher,
                    head = %event.announce.cid,
                    error = %e,
                    "Validation failed; publisher latched until admin action"
                );
                self.failed.lock().insert(publisher, e.to_string());
            }
            Err(e) if e.is_transient() => {
                self.schedule_retry(publisher, event, &e);
            }
            Err(e) => {
                tracing::error!(publisher = %publisher, error = %e, "Sync failed");
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, publisher: PeerId, event: AnnounceEvent, err: &IngestError) {
        let delay = {
            let mut retries = self.retries.lock();
            retries
                .entry(publisher)
                .or_insert_with(|| {
                    ExponentialBackoff::new(self.config.retry_initial, self.config.retry_max, 2.0)
                })
                .next_delay()
        };
        tracing::warn!(
            publisher = %publisher,
            error = %err,
            retry_in_ms = delay.as_millis(),
            "Transient sync failure, will retry"
        );

        // A newer announce supersedes the retried one.
        self.pending.lock().entry(publisher).or_insert(event);

        let ingester = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ingester.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if ingester.pending.lock().contains_key(&publisher) {
                        let _ = ingester.queue_tx.send(publisher);
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Sync (backward chain walk)
    // ------------------------------------------------------------------

    async fn sync_and_index(&self, event: &AnnounceEvent) -> Result<usize> {
        let publisher = event.publisher;
        let mut addrs = event.announce.transport_addrs();
        if addrs.is_empty() {
            if let Some(info) = self.registry.provider_info(&publisher).await {
                addrs = info.publisher_addresses;
            }
        }

        let chain = self
            .sync_chain(publisher, event.announce.cid, &addrs)
            .await?;
        if chain.is_empty() {
            return Ok(0);
        }
        self.index_ads(publisher, &addrs, chain).await
    }

    /// Walk backward from `head` to the recorded head (or the depth limit),
    /// fetching, staging, and signature-checking each advertisement, then
    /// return the list in forward chain order.
    async fn sync_chain(
        &self,
        publisher: PeerId,
        head: Cid,
        addrs: &[String],
    ) -> Result<Vec<(Cid, Advertisement)>> {
        let last_known = self.head(&publisher).await?;
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(head);

        while let Some(cid) = cursor {
            if Some(cid) == last_known {
                break;
            }
            if !visited.insert(cid) {
                return Err(IngestError::validation(cid, "cycle in previous links"));
            }
            if chain.len() >= self.config.sync_depth_limit {
                tracing::warn!(
                    publisher = %publisher,
                    depth = chain.len(),
                    "Sync depth limit reached, truncating chain walk"
                );
                break;
            }

            let bytes = self.load_block(&publisher, addrs, &cid).await?;
            let ad = Advertisement::decode(&bytes)
                .map_err(|e| IngestError::validation(cid, e.to_string()))?;
            ad.verify(&publisher)
                .map_err(|e| IngestError::validation(cid, format!("bad signature: {}", e)))?;
            if !self.registry.publish_allowed(&publisher, &ad.provider) {
                return Err(IngestError::NotAllowed(ad.provider));
            }

            cursor = ad.previous;
            chain.push((cid, ad));
        }

        chain.reverse();
        Ok(chain)
    }

    // ------------------------------------------------------------------
    // Index (forward application)
    // ------------------------------------------------------------------

    async fn index_ads(
        &self,
        publisher: PeerId,
        addrs: &[String],
        chain: Vec<(Cid, Advertisement)>,
    ) -> Result<usize> {
        let mut applied = 0;

        for (ad_cid, ad) in chain {
            if self.registry.frozen() {
                tracing::info!(
                    publisher = %publisher,
                    "Indexer frozen, dropping remaining advertisements in this pass"
                );
                break;
            }

            let (added, staged) = self.apply_ad(&publisher, addrs, &ad_cid, &ad).await?;

            // The advertisement fully applied; advance the head atomically
            // before any cleanup. A crash after this point re-syncs from
            // the new head; a crash before re-applies this ad, which put
            // idempotence makes safe.
            self.set_head(&publisher, &ad_cid).await?;

            let mut update = ProviderUpdate::new(ad.provider);
            update.addresses = ad.addresses.clone();
            update.publisher = Some(publisher);
            update.publisher_addresses = addrs.to_vec();
            update.last_advertisement = Some(ad_cid);
            update.context_id = ad.context_id.clone();
            update.extended_providers = ad.extended_providers.clone();
            update.added_count = added;
            match self.registry.update(update).await {
                Ok(()) => {}
                Err(Error::Frozen) => {
                    tracing::info!(publisher = %publisher, "Registry frozen for new providers");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            if added > 0 {
                self.counts.add_count(&ad.provider, added).await?;
            }

            if let Some(carwriter) = &self.carwriter {
                match carwriter.write(ad_cid, ad.is_rm).await {
                    Ok(_) => {}
                    Err(e @ IngestError::ArchiveWrite(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            ad = %ad_cid,
                            error = %e,
                            "Cannot archive advertisement, leaving staged blocks"
                        );
                    }
                }
            } else {
                // Delete staged blocks, entry tail first, advertisement last.
                for cid in staged.iter().rev() {
                    if let Err(e) = self.ds.delete(&cid.to_string()).await {
                        tracing::error!(cid = %cid, error = %e, "Error deleting staged block");
                    }
                }
            }

            applied += 1;
        }

        Ok(applied)
    }

    /// Apply a single advertisement to the value store. Returns the number
    /// of multihashes added and the staged block CIDs (ad first).
    async fn apply_ad(
        &self,
        publisher: &PeerId,
        addrs: &[String],
        ad_cid: &Cid,
        ad: &Advertisement,
    ) -> Result<(u64, Vec<Cid>)> {
        let mut staged = vec![*ad_cid];
        let value = Value::new(ad.provider, ad.context_id.clone(), ad.metadata.clone());

        if ad.is_rm {
            if ad.context_id.is_empty() {
                tracing::warn!(ad = %ad_cid, "Removal without context id has no effect");
                return Ok((0, staged));
            }
            if let Entries::Link(first) = ad.entries {
                self.remove_entries(publisher, addrs, first, &value, &mut staged)
                    .await?;
            }
            return Ok((0, staged));
        }

        let Entries::Link(first) = ad.entries else {
            // NoEntries: chain placeholder, advance head only.
            return Ok((0, staged));
        };

        let mut added = 0u64;
        let mut cursor = Some(first);
        while let Some(cid) = cursor {
            let bytes = self.load_block(publisher, addrs, &cid).await?;
            staged.push(cid);
            let node = EntryNode::decode(&bytes)
                .map_err(|e| IngestError::validation(cid, e.to_string()))?;
            cursor = match node {
                EntryNode::Hamt(root) => {
                    added += self.put_batches(&value, &root.multihashes).await?;
                    None
                }
                EntryNode::Chunk(chunk) => {
                    added += self.put_batches(&value, &chunk.multihashes).await?;
                    chunk.next
                }
            };
        }
        Ok((added, staged))
    }

    async fn put_batches(&self, value: &Value, mhs: &[sextant_core::Multihash]) -> Result<u64> {
        for batch in mhs.chunks(self.config.batch_size.max(1)) {
            self.engine.put(value, batch).await?;
        }
        Ok(mhs.len() as u64)
    }

    /// Removal walk: chunk chains only. A HAMT root ends the walk; HAMT
    /// removal semantics are undefined and the root is left in place.
    async fn remove_entries(
        &self,
        publisher: &PeerId,
        addrs: &[String],
        first: Cid,
        value: &Value,
        staged: &mut Vec<Cid>,
    ) -> Result<()> {
        let mut cursor = Some(first);
        while let Some(cid) = cursor {
            let bytes = self.load_block(publisher, addrs, &cid).await?;
            staged.push(cid);
            let node = EntryNode::decode(&bytes)
                .map_err(|e| IngestError::validation(cid, e.to_string()))?;
            cursor = match node {
                EntryNode::Hamt(_) => {
                    tracing::warn!(cid = %cid, "Removal points at a HAMT, skipping walk");
                    None
                }
                EntryNode::Chunk(chunk) => {
                    for batch in chunk.multihashes.chunks(self.config.batch_size.max(1)) {
                        self.engine.remove(value, batch).await?;
                    }
                    chunk.next
                }
            };
        }
        Ok(())
    }

    /// Load a block from the staging datastore, falling back to the
    /// transport (rate limited) and staging what it returns.
    async fn load_block(&self, publisher: &PeerId, addrs: &[String], cid: &Cid) -> Result<Vec<u8>> {
        let key = cid.to_string();
        if let Some(bytes) = self.ds.get(&key).await? {
            return Ok(bytes);
        }
        self.rate_limiter.acquire(publisher).await;
        let bytes = self.transport.fetch_block(addrs, cid).await?;
        self.ds.put(&key, &bytes).await?;
        Ok(bytes)
    }

    // ------------------------------------------------------------------
    // Head pointers
    // ------------------------------------------------------------------

    /// The publisher's last fully indexed advertisement.
    pub async fn head(&self, publisher: &PeerId) -> Result<Option<Cid>> {
        let Some(bytes) = self.ds.get(&head_key(publisher)).await? else {
            return Ok(None);
        };
        let s = String::from_utf8(bytes).map_err(|e| Error::decode(e.to_string()))?;
        Ok(Some(Cid::from_str(&s).map_err(|e| {
            Error::invalid_cid(e.to_string())
        })?))
    }

    async fn set_head(&self, publisher: &PeerId, cid: &Cid) -> Result<()> {
        self.ds
            .put(&head_key(publisher), cid.to_string().as_bytes())
            .await
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Trigger a resync of a provider from its recorded publisher: fetch
    /// the publisher's current head and enqueue it. Clears the failed latch
    /// so admin intervention can restart a latched publisher.
    pub async fn sync_provider(&self, provider: &PeerId) -> Result<()> {
        let info = self
            .registry
            .provider_info(provider)
            .await
            .ok_or_else(|| Error::not_found(format!("provider {}", provider)))?;
        let publisher = info.publisher.unwrap_or(*provider);
        let addrs = if info.publisher_addresses.is_empty() {
            info.addresses
        } else {
            info.publisher_addresses
        };

        self.failed.lock().remove(&publisher);
        let head = self.transport.fetch_head(&addrs).await?;
        self.announce(AnnounceEvent {
            publisher,
            announce: sextant_core::schema::Announce { cid: head, addrs },
        })
        .await
    }

    /// Publishers latched failed, with the reason.
    pub fn failed_publishers(&self) -> Vec<(PeerId, String)> {
        let mut failed: Vec<(PeerId, String)> = self
            .failed
            .lock()
            .iter()
            .map(|(peer, reason)| (*peer, reason.clone()))
            .collect();
        failed.sort_by_key(|(peer, _)| *peer);
        failed
    }

    /// Change the per-publisher fetch rate limit (reload path).
    pub fn set_rate_limit(&self, rate: f64) {
        self.rate_limiter.set_rate(rate);
    }

    /// Reset head pointers to the frozen-at snapshots so the next announce
    /// re-syncs everything indexed after the freeze point.
    pub async fn unfreeze(&self, resumed: Vec<(PeerId, Option<Cid>)>) -> Result<()> {
        for (provider, frozen_at) in resumed {
            let info = self.registry.provider_info(&provider).await;
            let publisher = info.and_then(|i| i.publisher).unwrap_or(provider);
            match frozen_at {
                Some(cid) => self.set_head(&publisher, &cid).await?,
                None => self.ds.delete(&head_key(&publisher)).await?,
            }
        }
        Ok(())
    }

    /// Archive whatever is left in the staging datastore (startup path).
    /// No-op without a CAR writer.
    pub fn write_existing(&self) -> Option<tokio::sync::oneshot::Receiver<usize>> {
        self.carwriter.as_ref().map(|cw| cw.write_existing())
    }

    /// Periodically resync every known provider from its publisher, picking
    /// up chains whose announces were missed.
    pub fn spawn_resync(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let ingester = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ingester.shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for info in ingester.registry.all_providers().await {
                    if let Err(e) = ingester.sync_provider(&info.peer_id).await {
                        tracing::debug!(
                            provider = %info.peer_id,
                            error = %e,
                            "Periodic resync failed"
                        );
                    }
                }
            }
        })
    }

    /// Stop accepting work, cancel workers, and flush the engine.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let workers: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }
        self.engine.flush().await?;
        Ok(())
    }
}

fn head_key(publisher: &PeerId) -> String {
    format!("{}{}", HEAD_PREFIX, publisher)
}
