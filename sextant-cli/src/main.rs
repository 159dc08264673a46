//! Sextant daemon and admin CLI
//!
//! Run with: `sextant --help`

use clap::Parser;
use sextant_cli::{init_logging, run, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_handle = init_logging();

    if let Err(e) = run(cli, log_handle).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
