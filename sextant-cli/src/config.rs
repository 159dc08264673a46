//! Daemon configuration file
//!
//! `sextant init` writes `config.json` into the sextant directory; the
//! daemon loads it at startup and re-reads it on SIGHUP, on
//! `POST /admin/reload`, and when the file's modification time changes.
//! Runtime-tunable values: policy, rate limit, worker count, count addend,
//! and log level.

use crate::error::{CliError, Result};
use ed25519_dalek::SigningKey;
use sextant_core::PeerId;
use sextant_registry::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const CONFIG_FILE: &str = "config.json";

/// Node identity: the peer id and its ed25519 private key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub peer_id: String,
    /// Base64 32-byte ed25519 secret key.
    pub private_key: String,
}

impl IdentityConfig {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            peer_id: PeerId::from_signing_key(&key).to_string(),
            private_key: BASE64.encode(key.to_bytes()),
        }
    }

    /// Decode and cross-check the identity.
    pub fn decode(&self) -> Result<(PeerId, SigningKey)> {
        let secret = BASE64
            .decode(&self.private_key)
            .map_err(|e| CliError::config(format!("bad private key encoding: {}", e)))?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| CliError::config("private key must be 32 bytes"))?;
        let key = SigningKey::from_bytes(&secret);
        let derived = PeerId::from_signing_key(&key);
        let declared = PeerId::from_str(&self.peer_id)
            .map_err(|e| CliError::config(format!("bad peer id: {}", e)))?;
        if derived != declared {
            return Err(CliError::config("peer id does not match private key"));
        }
        Ok((derived, key))
    }
}

/// Listen addresses for the three HTTP servers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressesConfig {
    pub find: String,
    pub ingest: String,
    pub admin: String,
}

impl Default for AddressesConfig {
    fn default() -> Self {
        Self {
            find: "127.0.0.1:3000".to_string(),
            ingest: "127.0.0.1:3001".to_string(),
            admin: "127.0.0.1:3002".to_string(),
        }
    }
}

/// Which value store engine backs the index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueStoreType {
    /// In-memory engine; the index is lost on restart.
    Memory,
    /// Durable embedded engine.
    #[default]
    Redb,
}

/// Indexer-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexerSection {
    pub value_store_type: ValueStoreType,
    pub value_store_dir: String,
    /// Result cache entries; zero disables the cache.
    pub cache_size: usize,
    /// Engine block cache bytes.
    pub engine_cache_bytes: usize,
    /// Fsync engine commits.
    pub sync_writes: bool,
    /// Freeze when any monitored directory reaches this fullness.
    pub freeze_at_percent: f64,
    pub freeze_check_interval_ms: u64,
    /// Unfreeze and resume from frozen heads at startup.
    pub unfreeze_on_start: bool,
    /// Operator adjustment added to reported totals.
    pub index_count_total_addend: u64,
    pub shutdown_timeout_ms: u64,
    pub config_check_interval_ms: u64,
}

impl Default for IndexerSection {
    fn default() -> Self {
        Self {
            value_store_type: ValueStoreType::Redb,
            value_store_dir: "valuestore".to_string(),
            cache_size: 300_000,
            engine_cache_bytes: 1 << 30,
            sync_writes: true,
            freeze_at_percent: 90.0,
            freeze_check_interval_ms: 10_000,
            unfreeze_on_start: false,
            index_count_total_addend: 0,
            shutdown_timeout_ms: 5_000,
            config_check_interval_ms: 30_000,
        }
    }
}

/// Ingest pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestSection {
    pub topic: String,
    pub worker_count: usize,
    pub batch_size: usize,
    pub sync_depth_limit: usize,
    /// Block fetches per second per publisher; zero disables.
    pub rate_limit_per_publisher: f64,
    /// Direct announces per second per publisher; zero disables.
    pub announce_rate_limit: f64,
    /// Pad store keys up to this many bytes.
    pub min_key_length: usize,
    /// Archive applied advertisement chains into CAR files here.
    pub archive_dir: Option<String>,
    /// Resync known providers this often; zero disables.
    pub resync_interval_ms: u64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            topic: sextant_ingest::DEFAULT_TOPIC.to_string(),
            worker_count: 8,
            batch_size: 1024,
            sync_depth_limit: 4096,
            rate_limit_per_publisher: 0.0,
            announce_rate_limit: 0.0,
            min_key_length: 4,
            archive_dir: None,
            resync_interval_ms: 0,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSection {
    /// tracing filter directive (e.g. "info", "sextant_ingest=debug").
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// The daemon configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub identity: IdentityConfig,
    #[serde(default)]
    pub addresses: AddressesConfig,
    #[serde(default)]
    pub indexer: IndexerSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Datastore directory, relative to the sextant dir.
    #[serde(default = "default_datastore_dir")]
    pub datastore_dir: String,
}

fn default_datastore_dir() -> String {
    "datastore".to_string()
}

impl Config {
    /// A fresh config with a generated identity.
    pub fn generate() -> Self {
        Self {
            identity: IdentityConfig::generate(),
            addresses: AddressesConfig::default(),
            indexer: IndexerSection::default(),
            ingest: IngestSection::default(),
            policy: PolicyConfig {
                allow: true,
                ..Default::default()
            },
            logging: LoggingSection::default(),
            datastore_dir: default_datastore_dir(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    /// Load the config file, mapping a missing file to NotInitialized.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CliError::NotInitialized)
            }
            Err(e) => {
                return Err(CliError::config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| CliError::config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Write the config file, creating the directory if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CliError::config(format!("cannot create {}: {}", dir.display(), e)))?;
        let path = Self::path(dir);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CliError::config(format!("cannot encode config: {}", e)))?;
        std::fs::write(&path, json)
            .map_err(|e| CliError::config(format!("cannot write {}: {}", path.display(), e)))
    }

    /// Absolute path of a dir-relative config entry.
    pub fn resolve(&self, dir: &Path, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        }
    }
}

/// The sextant directory: `--dir` flag, `SEXTANT_PATH`, or `~/.sextant`.
pub fn sextant_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var("SEXTANT_PATH") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".sextant"),
        _ => PathBuf::from(".sextant"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generate_and_decode() {
        let identity = IdentityConfig::generate();
        let (peer, key) = identity.decode().unwrap();
        assert_eq!(peer, PeerId::from_signing_key(&key));
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let mut identity = IdentityConfig::generate();
        identity.peer_id = IdentityConfig::generate().peer_id;
        assert!(identity.decode().is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::generate();
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.identity.peer_id, config.identity.peer_id);
        assert_eq!(loaded.ingest.topic, sextant_ingest::DEFAULT_TOPIC);
        assert!(loaded.policy.allow);
    }

    #[test]
    fn test_load_missing_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(CliError::NotInitialized)
        ));
    }

    #[test]
    fn test_resolve_paths() {
        let config = Config::generate();
        let dir = Path::new("/data/sextant");
        assert_eq!(
            config.resolve(dir, "valuestore"),
            PathBuf::from("/data/sextant/valuestore")
        );
        assert_eq!(
            config.resolve(dir, "/var/lib/vs"),
            PathBuf::from("/var/lib/vs")
        );
    }
}
