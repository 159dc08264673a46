//! `sextant daemon`: assemble and run one indexer
//!
//! Builds the daemon aggregate from the config file (value store engine,
//! datastore, cache, registry, ingester, the three HTTP servers, and the
//! freeze watcher), then runs the reload loop until a shutdown signal.
//! Reload is triggered by SIGHUP, by `POST /admin/reload`, or by a change
//! to the config file's modification time.

use crate::cli::DaemonArgs;
use crate::config::{Config, ValueStoreType};
use crate::error::{CliError, Result};
use crate::FilterHandle;
use sextant_core::{Datastore, DirFileStore, RedbDatastore};
use sextant_ingest::{
    AdTransport, CarWriter, HttpTransport, IngestConfig, Ingester,
};
use sextant_registry::{FreezeWatcher, Registry};
use sextant_server::{AppState, ReloadRequest, Server, ServerKind};
use sextant_store::{
    Engine, IndexCounts, MemoryValueStore, RedbValueStore, RedbValueStoreConfig, ResultCache,
    ValueStore,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub async fn run(dir: &Path, args: &DaemonArgs, log_handle: FilterHandle) -> Result<()> {
    let config = Config::load(dir)?;
    apply_log_level(&log_handle, &config.logging.level);

    let (peer_id, _key) = config.identity.decode()?;
    tracing::info!(peer = %peer_id, dir = %dir.display(), "Starting sextant daemon");

    // Ancillary datastore.
    let ds_dir = config.resolve(dir, &config.datastore_dir);
    let ds: Arc<dyn Datastore> = Arc::new(
        RedbDatastore::open(ds_dir.join("store.redb"))
            .map_err(|e| CliError::daemon_start(e.to_string()))?,
    );

    // Registry with policy and freeze state.
    let registry = Arc::new(
        Registry::new(&config.policy, ds.clone())
            .await
            .map_err(|e| CliError::daemon_start(e.to_string()))?,
    );

    // Value store engine.
    let mut freeze_dirs: Vec<PathBuf> = vec![ds_dir.clone()];
    let store: Arc<dyn ValueStore> = match config.indexer.value_store_type {
        ValueStoreType::Memory => Arc::new(MemoryValueStore::new()),
        ValueStoreType::Redb => {
            let vs_dir = config.resolve(dir, &config.indexer.value_store_dir);
            freeze_dirs.push(vs_dir.clone());
            Arc::new(
                RedbValueStore::open(RedbValueStoreConfig {
                    dir: vs_dir,
                    cache_size_bytes: config.indexer.engine_cache_bytes,
                    min_key_length: config.ingest.min_key_length,
                    sync_writes: config.indexer.sync_writes,
                })
                .map_err(|e| CliError::daemon_start(e.to_string()))?,
            )
        }
    };
    tracing::info!(kind = ?config.indexer.value_store_type, "Value store initialized");

    let cache_size = args.cache_size.unwrap_or(config.indexer.cache_size);
    let cache = if cache_size > 0 {
        tracing::info!(size = cache_size, "Result cache enabled");
        Some(ResultCache::new(cache_size))
    } else {
        tracing::info!("Result cache disabled");
        None
    };
    let engine = Arc::new(
        Engine::new(cache, store)
            .with_min_key_length(config.ingest.min_key_length)
            .with_frozen_flag(registry.frozen_flag()),
    );

    let counts = Arc::new(
        IndexCounts::load(ds.clone())
            .await
            .map_err(|e| CliError::daemon_start(e.to_string()))?,
    );
    counts.set_total_addend(config.indexer.index_count_total_addend);

    // Archiver, when an archive directory is configured.
    let carwriter = config.ingest.archive_dir.as_ref().map(|archive_dir| {
        let files = Arc::new(DirFileStore::new(config.resolve(dir, archive_dir)));
        CarWriter::new(ds.clone(), files)
    });

    let transport: Arc<dyn AdTransport> = Arc::new(HttpTransport::default());
    let ingester = Ingester::new(
        IngestConfig {
            topic: config.ingest.topic.clone(),
            worker_count: config.ingest.worker_count,
            batch_size: config.ingest.batch_size,
            sync_depth_limit: config.ingest.sync_depth_limit,
            rate_limit_per_publisher: config.ingest.rate_limit_per_publisher,
            ..Default::default()
        },
        engine.clone(),
        registry.clone(),
        ds.clone(),
        transport,
        counts.clone(),
        carwriter,
    );

    if config.indexer.unfreeze_on_start && registry.frozen() {
        let resumed = registry
            .unfreeze()
            .await
            .map_err(|e| CliError::daemon_start(e.to_string()))?;
        ingester
            .unfreeze(resumed)
            .await
            .map_err(|e| CliError::daemon_start(e.to_string()))?;
        println!("Indexer reverted to unfrozen state");
    }

    // Archive whatever a previous run left staged.
    if let Some(done) = ingester.write_existing() {
        drop(done); // runs in the background
    }

    let resync_task = (config.ingest.resync_interval_ms > 0).then(|| {
        ingester.spawn_resync(Duration::from_millis(config.ingest.resync_interval_ms))
    });

    // Shared server state + reload channel.
    let (reload_tx, mut reload_rx) = mpsc::channel::<ReloadRequest>(1);
    let state = Arc::new(
        AppState::new(
            engine.clone(),
            registry.clone(),
            ingester.clone(),
            counts.clone(),
        )
        .with_announce_rate(config.ingest.announce_rate_limit)
        .with_reload(reload_tx),
    );

    // HTTP servers, one per address.
    let (server_err_tx, mut server_err_rx) = mpsc::channel::<String>(3);
    let mut server_tasks = Vec::new();
    let listens = [
        (ServerKind::Find, "Find", override_or(&args.listen_find, &config.addresses.find)),
        (
            ServerKind::Ingest,
            "Ingest",
            override_or(&args.listen_ingest, &config.addresses.ingest),
        ),
        (
            ServerKind::Admin,
            "Admin",
            override_or(&args.listen_admin, &config.addresses.admin),
        ),
    ];
    for (kind, name, listen) in listens {
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| CliError::daemon_start(format!("bad {} address {}: {}", name, listen, e)))?;
        let server = Server::new(kind, addr, state.clone());
        let err_tx = server_err_tx.clone();
        server_tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                let _ = err_tx.send(format!("{} server: {}", name, e)).await;
            }
        }));
        println!("{} server:\t{}", name, listen);
    }

    // Freeze watcher over the store directories.
    let watcher_task = FreezeWatcher::new(
        registry.clone(),
        freeze_dirs,
        config.indexer.freeze_at_percent,
        Duration::from_millis(config.indexer.freeze_check_interval_ms.max(100)),
    )
    .spawn();

    if registry.frozen() {
        println!("Indexer is frozen");
    }
    println!("Indexer is ready");

    // Reload / shutdown loop.
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| CliError::daemon_start(format!("cannot install SIGHUP handler: {}", e)))?;
    let watch_config = !args.no_watch_config;
    let config_path = Config::path(dir);
    let mut config_mod_time = mod_time(&config_path);
    let mut ticker = tokio::time::interval(Duration::from_millis(
        config.indexer.config_check_interval_ms.max(1_000),
    ));
    ticker.tick().await;

    let shutdown_timeout = Duration::from_millis(config.indexer.shutdown_timeout_ms);
    let mut final_err: Option<CliError> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            _ = sighup.recv() => {
                if let Err(e) = do_reload(dir, &registry, &ingester, &counts, &log_handle) {
                    tracing::error!(error = %e, "Error reloading config");
                }
            }
            Some(request) = reload_rx.recv() => {
                let result = do_reload(dir, &registry, &ingester, &counts, &log_handle);
                if let Some(done) = request.done {
                    let _ = done.send(result.map_err(|e| e.to_string()));
                }
            }
            Some(err) = server_err_rx.recv() => {
                tracing::error!(error = %err, "Server failed");
                final_err = Some(CliError::daemon_start(err));
                break;
            }
            _ = ticker.tick(), if watch_config => {
                let current = mod_time(&config_path);
                if current != config_mod_time {
                    config_mod_time = current;
                    if let Err(e) = do_reload(dir, &registry, &ingester, &counts, &log_handle) {
                        tracing::error!(error = %e, "Error reloading config");
                    }
                }
            }
        }
    }

    tracing::info!("Shutting down daemon");

    // Order: stop accepting announces, drain the workers, flush the value
    // store, close the datastore. Killed if it exceeds the timeout.
    let shutdown = async {
        for task in &server_tasks {
            task.abort();
        }
        watcher_task.abort();
        if let Some(task) = &resync_task {
            task.abort();
        }
        ingester
            .close()
            .await
            .map_err(|e| CliError::daemon_stop(e.to_string()))?;
        engine
            .close()
            .await
            .map_err(|e| CliError::daemon_stop(e.to_string()))?;
        ds.flush()
            .await
            .map_err(|e| CliError::daemon_stop(e.to_string()))?;
        Ok::<(), CliError>(())
    };

    if shutdown_timeout.is_zero() {
        shutdown.await?;
    } else {
        match tokio::time::timeout(shutdown_timeout, shutdown).await {
            Ok(result) => result?,
            Err(_) => {
                eprintln!("Timed out on shutdown, terminating...");
                std::process::exit(1);
            }
        }
    }

    tracing::info!("Indexer stopped");
    match final_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Re-read the config file and apply the runtime-tunable values: policy,
/// rate limit, worker count, count addend, log level.
fn do_reload(
    dir: &Path,
    registry: &Arc<Registry>,
    ingester: &Arc<Ingester>,
    counts: &Arc<IndexCounts>,
    log_handle: &FilterHandle,
) -> Result<()> {
    let new_config = Config::load(dir)?;

    registry
        .set_policy(&new_config.policy)
        .map_err(|e| CliError::config(format!("failed to set policy: {}", e)))?;
    ingester.set_rate_limit(new_config.ingest.rate_limit_per_publisher);
    ingester.run_workers(new_config.ingest.worker_count);
    counts.set_total_addend(new_config.indexer.index_count_total_addend);
    apply_log_level(log_handle, &new_config.logging.level);

    tracing::info!("Reloaded reloadable values from configuration");
    Ok(())
}

fn apply_log_level(handle: &FilterHandle, level: &str) {
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                tracing::warn!(error = %e, "Cannot apply log level");
            }
        }
        Err(e) => {
            tracing::warn!(level = %level, error = %e, "Bad log level in config");
        }
    }
}

fn override_or(flag: &Option<String>, config_value: &str) -> String {
    flag.clone().unwrap_or_else(|| config_value.to_string())
}

fn mod_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
