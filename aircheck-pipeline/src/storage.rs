//! Object storage for recordings and extracted clips
//!
//! Keys are relative paths (e.g. `radio/KXYZ/2026-08-01T12:00:00.mp3`).
//! The trait keeps the stages independent of where the bytes actually
//! live; the shipped implementation is a local directory tree.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use aircheck_common::{Error, Result};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Resolve a key to a readable local file path.
    async fn fetch(&self, key: &str) -> Result<PathBuf>;

    /// Persist a local file under `key`, creating parent directories.
    async fn store(&self, key: &str, local: &Path) -> Result<()>;

    /// Remove the object at `key`. Missing objects are not an error, so
    /// undo operations can be re-run.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Directory-tree storage rooted at a configured path.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are store-internal, but reject traversal anyway.
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(Error::Data(format!("invalid storage key '{key}'")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn fetch(&self, key: &str) -> Result<PathBuf> {
        let path = self.resolve(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("object '{key}' not in storage")));
        }
        Ok(path)
    }

    async fn store(&self, key: &str, local: &Path) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &path).await?;
        debug!(key, dest = %path.display(), "Stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
