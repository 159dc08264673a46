//! CLI error types

use thiserror::Error;

/// Result type alias using [`CliError`]
pub type Result<T> = std::result::Result<T, CliError>;

/// Top-level CLI errors. The process exits non-zero for any of these.
#[derive(Error, Debug)]
pub enum CliError {
    /// No config file in the sextant directory.
    #[error("sextant is not initialized\nTo initialize, run: sextant init")]
    NotInitialized,

    /// Malformed or inconsistent configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The daemon failed to come up.
    #[error("daemon did not start correctly: {0}")]
    DaemonStart(String),

    /// The daemon failed to shut down cleanly.
    #[error("daemon did not stop correctly: {0}")]
    DaemonStop(String),

    /// An admin API request failed.
    #[error("admin request failed: {0}")]
    Admin(String),

    #[error(transparent)]
    Core(#[from] sextant_core::Error),

    #[error(transparent)]
    Ingest(#[from] sextant_ingest::IngestError),

    #[error(transparent)]
    Assigner(#[from] sextant_assigner::AssignerError),
}

impl CliError {
    pub fn config(msg: impl Into<String>) -> Self {
        CliError::Config(msg.into())
    }

    pub fn daemon_start(msg: impl Into<String>) -> Self {
        CliError::DaemonStart(msg.into())
    }

    pub fn daemon_stop(msg: impl Into<String>) -> Self {
        CliError::DaemonStop(msg.into())
    }

    pub fn admin(msg: impl Into<String>) -> Self {
        CliError::Admin(msg.into())
    }
}
