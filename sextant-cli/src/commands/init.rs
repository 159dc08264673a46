//! `sextant init`: create the sextant directory, identity, and config file

use crate::cli::InitArgs;
use crate::config::{Config, ValueStoreType};
use crate::error::{CliError, Result};
use std::path::Path;

pub fn run(dir: &Path, args: &InitArgs) -> Result<()> {
    let mut config = match Config::load(dir) {
        Ok(existing) => {
            if !args.upgrade {
                return Err(CliError::config(format!(
                    "already initialized at {}; use --upgrade to rewrite the config",
                    dir.display()
                )));
            }
            // Keep the identity, regenerate everything else.
            let mut fresh = Config::generate();
            fresh.identity = existing.identity;
            fresh
        }
        Err(CliError::NotInitialized) => Config::generate(),
        Err(e) => return Err(e),
    };

    if let Some(topic) = &args.pubsub_topic {
        config.ingest.topic = topic.clone();
    }
    if args.block_policy {
        config.policy.allow = false;
        config.policy.except.clear();
    }
    if args.memory_store {
        config.indexer.value_store_type = ValueStoreType::Memory;
    }
    if let Some(addr) = &args.listen_find {
        config.addresses.find = addr.clone();
    }
    if let Some(addr) = &args.listen_ingest {
        config.addresses.ingest = addr.clone();
    }
    if let Some(addr) = &args.listen_admin {
        config.addresses.admin = addr.clone();
    }

    config.save(dir)?;
    println!("Initialized sextant at {}", dir.display());
    println!("Peer ID: {}", config.identity.peer_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> InitArgs {
        InitArgs {
            pubsub_topic: None,
            block_policy: false,
            memory_store: false,
            listen_find: None,
            listen_ingest: None,
            listen_admin: None,
            upgrade: false,
        }
    }

    #[test]
    fn test_init_creates_config() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &default_args()).unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert!(config.identity.decode().is_ok());
        assert!(config.policy.allow);
    }

    #[test]
    fn test_init_twice_requires_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &default_args()).unwrap();
        let before = Config::load(dir.path()).unwrap();

        assert!(run(dir.path(), &default_args()).is_err());

        let mut args = default_args();
        args.upgrade = true;
        args.block_policy = true;
        run(dir.path(), &args).unwrap();

        let after = Config::load(dir.path()).unwrap();
        // Upgrade keeps the identity but applies new settings.
        assert_eq!(after.identity.peer_id, before.identity.peer_id);
        assert!(!after.policy.allow);
    }

    #[test]
    fn test_init_flags_apply() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = default_args();
        args.pubsub_topic = Some("/indexer/ingest/testnet".to_string());
        args.listen_admin = Some("127.0.0.1:9602".to_string());
        args.memory_store = true;
        run(dir.path(), &args).unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.ingest.topic, "/indexer/ingest/testnet");
        assert_eq!(config.addresses.admin, "127.0.0.1:9602");
        assert_eq!(config.indexer.value_store_type, ValueStoreType::Memory);
    }
}
