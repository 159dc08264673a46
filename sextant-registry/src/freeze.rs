//! Disk-pressure freeze watcher
//!
//! A background task samples the fullness of the monitored directories on a
//! fixed interval and latches the registry frozen when any directory crosses
//! the configured threshold. The latch is one-way; only an explicit
//! unfreeze clears it.

use crate::registry::Registry;
use sextant_core::{Error, Result};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A point-in-time disk usage sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskUsage {
    pub used: u64,
    pub total: u64,
}

impl DiskUsage {
    /// Fullness as a percentage of total capacity.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64 * 100.0
    }
}

/// Source of disk usage samples. Behind a trait so tests can inject
/// fullness without filling a filesystem.
pub trait DiskSampler: Debug + Send + Sync {
    fn usage(&self, path: &Path) -> Result<DiskUsage>;
}

/// Sampler reading real filesystem statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsSampler;

impl DiskSampler for StatfsSampler {
    fn usage(&self, path: &Path) -> Result<DiskUsage> {
        let total = fs4::total_space(path)
            .map_err(|e| Error::io(format!("cannot stat {}: {}", path.display(), e)))?;
        let available = fs4::available_space(path)
            .map_err(|e| Error::io(format!("cannot stat {}: {}", path.display(), e)))?;
        Ok(DiskUsage {
            used: total.saturating_sub(available),
            total,
        })
    }
}

/// Background task freezing the registry on disk pressure.
pub struct FreezeWatcher {
    registry: Arc<Registry>,
    dirs: Vec<PathBuf>,
    freeze_at_percent: f64,
    interval: Duration,
    sampler: Arc<dyn DiskSampler>,
}

impl FreezeWatcher {
    pub fn new(
        registry: Arc<Registry>,
        dirs: Vec<PathBuf>,
        freeze_at_percent: f64,
        interval: Duration,
    ) -> Self {
        Self::with_sampler(
            registry,
            dirs,
            freeze_at_percent,
            interval,
            Arc::new(StatfsSampler),
        )
    }

    pub fn with_sampler(
        registry: Arc<Registry>,
        dirs: Vec<PathBuf>,
        freeze_at_percent: f64,
        interval: Duration,
        sampler: Arc<dyn DiskSampler>,
    ) -> Self {
        Self {
            registry,
            dirs,
            freeze_at_percent,
            interval,
            sampler,
        }
    }

    /// One sampling pass. Returns true if the threshold was crossed.
    pub async fn check_once(&self) -> bool {
        for dir in &self.dirs {
            let usage = match self.sampler.usage(dir) {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Cannot sample disk usage");
                    continue;
                }
            };
            if usage.percent() >= self.freeze_at_percent {
                tracing::warn!(
                    dir = %dir.display(),
                    percent = usage.percent(),
                    threshold = self.freeze_at_percent,
                    "Disk usage crossed freeze threshold"
                );
                if let Err(e) = self.registry.freeze().await {
                    tracing::error!(error = %e, "Failed to freeze registry");
                }
                return true;
            }
        }
        false
    }

    /// Spawn the watcher as a background tokio task. The task exits once
    /// the registry freezes (or if it was created frozen).
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so a fresh daemon
            // does not sample before its stores exist on disk.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if self.registry.frozen() || self.check_once().await {
                    break;
                }
            }
        })
    }
}
