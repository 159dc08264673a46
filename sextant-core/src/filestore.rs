//! Archive file store
//!
//! Stores finished CAR archives by name. The store is content-addressed at
//! the naming level (archives are named after the advertisement CID they
//! contain), so a `put` under an existing name is a no-op.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Metadata for a stored archive file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Archive storage operations.
#[async_trait]
pub trait FileStore: Debug + Send + Sync {
    /// Look up a file's metadata without reading it. `None` if absent.
    async fn head(&self, name: &str) -> Result<Option<FileInfo>>;

    /// Store a file under the given name. Idempotent: if a file with this
    /// name already exists, the existing file is kept and returned.
    async fn put(&self, name: &str, data: &[u8]) -> Result<FileInfo>;

    /// Read a stored file's bytes.
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
}

// ============================================================================
// MemFileStore
// ============================================================================

/// In-memory file store for tests.
#[derive(Debug, Clone, Default)]
pub struct MemFileStore {
    files: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemFileStore {
    async fn head(&self, name: &str) -> Result<Option<FileInfo>> {
        Ok(self
            .files
            .read()
            .expect("RwLock poisoned")
            .get(name)
            .map(|data| FileInfo {
                name: name.to_string(),
                size: data.len() as u64,
            }))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<FileInfo> {
        let mut files = self.files.write().expect("RwLock poisoned");
        let stored = files
            .entry(name.to_string())
            .or_insert_with(|| data.to_vec());
        Ok(FileInfo {
            name: name.to_string(),
            size: stored.len() as u64,
        })
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .expect("RwLock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(name))
    }
}

// ============================================================================
// DirFileStore
// ============================================================================

/// File store writing archives into a local directory.
#[derive(Debug, Clone)]
pub struct DirFileStore {
    dir: PathBuf,
}

impl DirFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        // Archive names are CID strings plus an extension; reject anything
        // that could escape the directory.
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::storage(format!("invalid archive name: {}", name)));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn head(&self, name: &str) -> Result<Option<FileInfo>> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(FileInfo {
                name: name.to_string(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!(
                "failed to stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<FileInfo> {
        if let Some(existing) = self.head(name).await? {
            return Ok(existing);
        }
        let path = self.resolve(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(format!("cannot create {}: {}", self.dir.display(), e)))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::io(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(FileInfo {
            name: name.to_string(),
            size: data.len() as u64,
        })
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(name)
            } else {
                Error::io(format!("failed to read {}: {}", path.display(), e))
            }
        })
    }
}
