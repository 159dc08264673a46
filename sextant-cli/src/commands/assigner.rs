//! `sextant assigner`: run the assignment service for a fleet of indexers

use crate::cli::AssignerArgs;
use crate::error::{CliError, Result};
use sextant_assigner::{Assigner, AssignerConfig, HttpIndexerApi};
use sextant_core::{Datastore, RedbDatastore};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

pub async fn run(dir: &Path, args: &AssignerArgs) -> Result<()> {
    let bytes = std::fs::read(&args.config).map_err(|e| {
        CliError::config(format!("cannot read {}: {}", args.config.display(), e))
    })?;
    let config: AssignerConfig = serde_json::from_slice(&bytes).map_err(|e| {
        CliError::config(format!("cannot parse {}: {}", args.config.display(), e))
    })?;

    let listen: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| CliError::config(format!("bad listen address {}: {}", args.listen, e)))?;

    let ds: Arc<dyn Datastore> = Arc::new(
        RedbDatastore::open(dir.join("assigner").join("store.redb"))
            .map_err(|e| CliError::daemon_start(e.to_string()))?,
    );

    let assigner = Assigner::new(config, ds, Arc::new(HttpIndexerApi::new())).await?;
    println!("Assigner is ready");
    sextant_assigner::server::run(assigner, listen)
        .await
        .map_err(|e| CliError::daemon_start(e.to_string()))
}
