//! Command-line interface definition

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Network content indexer: ingest signed advertisement chains, serve
/// multihash-to-provider lookups.
#[derive(Debug, Parser)]
#[command(name = "sextant", version, about)]
pub struct Cli {
    /// Sextant directory (defaults to $SEXTANT_PATH or ~/.sextant)
    #[arg(long, global = true, env = "SEXTANT_PATH")]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize the sextant directory: identity and config file
    Init(InitArgs),
    /// Run the indexer daemon
    Daemon(DaemonArgs),
    /// Operate a running indexer through its admin API
    Admin(AdminArgs),
    /// Run the assigner service for a fleet of indexers
    Assigner(AssignerArgs),
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Announce topic to subscribe to
    #[arg(long)]
    pub pubsub_topic: Option<String>,

    /// Start with a default-block policy (allow peers via admin API)
    #[arg(long)]
    pub block_policy: bool,

    /// Use the in-memory value store (no persistence)
    #[arg(long)]
    pub memory_store: bool,

    /// Listen address for the find server
    #[arg(long)]
    pub listen_find: Option<String>,

    /// Listen address for the ingest server
    #[arg(long)]
    pub listen_ingest: Option<String>,

    /// Listen address for the admin server
    #[arg(long)]
    pub listen_admin: Option<String>,

    /// Rewrite an existing config, keeping the identity
    #[arg(long)]
    pub upgrade: bool,
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Do not watch the config file for changes
    #[arg(long)]
    pub no_watch_config: bool,

    /// Override the configured result cache size (entries)
    #[arg(long)]
    pub cache_size: Option<usize>,

    /// Override the configured find listen address
    #[arg(long)]
    pub listen_find: Option<String>,

    /// Override the configured ingest listen address
    #[arg(long)]
    pub listen_ingest: Option<String>,

    /// Override the configured admin listen address
    #[arg(long)]
    pub listen_admin: Option<String>,
}

#[derive(Debug, Args)]
pub struct AdminArgs {
    /// Admin API base URL of the indexer to operate
    #[arg(short = 'i', long, default_value = "http://127.0.0.1:3002")]
    pub indexer: String,

    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Allow a peer to publish and be ingested
    Allow {
        #[arg(long)]
        peer: String,
    },
    /// Block a peer
    Block {
        #[arg(long)]
        peer: String,
    },
    /// List the peers the indexer allows
    ListAllowed,
    /// Reload the config file
    Reload,
    /// Freeze the indexer (stop ingesting new multihashes)
    Freeze,
    /// Resync a provider from its publisher's current head
    Sync {
        #[arg(long)]
        peer: String,
    },
    /// Import multihashes for a provider from a file
    Import {
        /// File format
        #[arg(value_enum)]
        kind: ImportKind,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ImportKind {
    /// Newline-delimited JSON objects with a cid field
    Manifest,
    /// Newline-separated base58 multihashes
    Cidlist,
}

#[derive(Debug, Args)]
pub struct AssignerArgs {
    /// Assigner config file (JSON)
    #[arg(long)]
    pub config: PathBuf,

    /// Listen address for the announce endpoint
    #[arg(long, default_value = "127.0.0.1:3700")]
    pub listen: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon() {
        let cli = Cli::try_parse_from(["sextant", "daemon", "--no-watch-config"]).unwrap();
        match cli.command {
            Command::Daemon(args) => assert!(args.no_watch_config),
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn test_parse_admin_allow() {
        let cli = Cli::try_parse_from([
            "sextant",
            "admin",
            "-i",
            "http://127.0.0.1:9999",
            "allow",
            "--peer",
            "some-peer-id",
        ])
        .unwrap();
        match cli.command {
            Command::Admin(args) => {
                assert_eq!(args.indexer, "http://127.0.0.1:9999");
                match args.command {
                    AdminCommand::Allow { peer } => assert_eq!(peer, "some-peer-id"),
                    _ => panic!("expected allow subcommand"),
                }
            }
            _ => panic!("expected admin command"),
        }
    }

    #[test]
    fn test_parse_init_flags() {
        let cli = Cli::try_parse_from([
            "sextant",
            "--dir",
            "/tmp/sxt",
            "init",
            "--pubsub-topic",
            "/indexer/ingest/testnet",
            "--block-policy",
        ])
        .unwrap();
        assert_eq!(cli.dir, Some(PathBuf::from("/tmp/sxt")));
        match cli.command {
            Command::Init(args) => {
                assert_eq!(args.pubsub_topic.as_deref(), Some("/indexer/ingest/testnet"));
                assert!(args.block_policy);
            }
            _ => panic!("expected init command"),
        }
    }

    #[test]
    fn test_parse_import() {
        let cli = Cli::try_parse_from([
            "sextant", "admin", "import", "cidlist", "--provider", "peer-x", "--file",
            "/tmp/cids",
        ])
        .unwrap();
        match cli.command {
            Command::Admin(args) => match args.command {
                AdminCommand::Import {
                    kind,
                    provider,
                    file,
                } => {
                    assert_eq!(kind, ImportKind::Cidlist);
                    assert_eq!(provider, "peer-x");
                    assert_eq!(file, PathBuf::from("/tmp/cids"));
                }
                _ => panic!("expected import subcommand"),
            },
            _ => panic!("expected admin command"),
        }
    }
}
