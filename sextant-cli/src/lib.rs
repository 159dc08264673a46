//! Sextant CLI: init, daemon, and admin commands
//!
//! The binary lives in `main.rs`; this library exposes the pieces so
//! command behavior is testable without spawning a process.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Command};
pub use config::{sextant_dir, Config};
pub use error::{CliError, Result};

use tracing_subscriber::{reload, EnvFilter};

/// Handle for swapping the log filter on config reload.
pub type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::registry::Registry>;

/// Initialize logging with a reloadable filter. Returns the handle the
/// daemon uses to apply the configured log level.
pub fn init_logging() -> FilterHandle {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    handle
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli, log_handle: FilterHandle) -> Result<()> {
    let dir = sextant_dir(cli.dir.clone());
    match &cli.command {
        Command::Init(args) => commands::init::run(&dir, args),
        Command::Daemon(args) => commands::daemon::run(&dir, args, log_handle).await,
        Command::Admin(args) => commands::admin::run(args).await,
        Command::Assigner(args) => commands::assigner::run(&dir, args).await,
    }
}
