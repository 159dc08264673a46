//! Shared application state for the HTTP servers

use sextant_ingest::ratelimit::RateLimiter;
use sextant_ingest::Ingester;
use sextant_registry::Registry;
use sextant_store::{Engine, IndexCounts};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A reload request from the admin API. The daemon's reload loop answers on
/// `done` once the config has been re-applied.
#[derive(Debug)]
pub struct ReloadRequest {
    pub done: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

/// State shared by the find, ingest, and admin routers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub registry: Arc<Registry>,
    pub ingester: Arc<Ingester>,
    pub counts: Arc<IndexCounts>,
    /// Per-publisher direct-announce rate limiter (zero rate disables).
    pub announce_limiter: RateLimiter,
    /// Channel into the daemon's reload loop; `None` when reload is not
    /// wired (tests, embedded use).
    pub reload_tx: Option<mpsc::Sender<ReloadRequest>>,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        registry: Arc<Registry>,
        ingester: Arc<Ingester>,
        counts: Arc<IndexCounts>,
    ) -> Self {
        Self {
            engine,
            registry,
            ingester,
            counts,
            announce_limiter: RateLimiter::new(0.0),
            reload_tx: None,
        }
    }

    /// Limit direct announces per publisher (per second).
    pub fn with_announce_rate(mut self, rate: f64) -> Self {
        self.announce_limiter = RateLimiter::new(rate);
        self
    }

    /// Wire the admin reload endpoint to the daemon's reload loop.
    pub fn with_reload(mut self, tx: mpsc::Sender<ReloadRequest>) -> Self {
        self.reload_tx = Some(tx);
        self
    }
}
