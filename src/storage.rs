//! Object storage for agent sources kept outside the local file system.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use tracing::trace;

/// Stores and retrieves files by key.
pub trait ObjectStorage: Send + Sync {
    /// Stores `file` under `dest_key` and returns the key.
    fn upload(&self, file: &Path, dest_key: &str) -> anyhow::Result<String>;

    /// Copies the object to `dest`. With `use_cached`, an existing `dest` is reused.
    fn download(&self, key: &str, dest: &Path, use_cached: bool) -> anyhow::Result<PathBuf>;

    /// A URL the object can be fetched from.
    fn download_url(&self, key: &str) -> anyhow::Result<String>;
}

/// Storage backed by a directory.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Storage rooted at `root`, created if missing.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("could not create storage directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            bail!("invalid storage key '{key}'");
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStorage for FileSystemStorage {
    fn upload(&self, file: &Path, dest_key: &str) -> anyhow::Result<String> {
        let dest = self.object_path(dest_key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(file, &dest).with_context(|| format!("could not upload {}", file.display()))?;
        trace!(key = dest_key, "uploaded");
        Ok(dest_key.to_owned())
    }

    fn download(&self, key: &str, dest: &Path, use_cached: bool) -> anyhow::Result<PathBuf> {
        if use_cached && dest.is_file() {
            return Ok(dest.to_path_buf());
        }
        let source = self.object_path(key)?;
        if !source.is_file() {
            bail!("no object stored under '{key}'");
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, dest).with_context(|| format!("could not download '{key}'"))?;
        Ok(dest.to_path_buf())
    }

    fn download_url(&self, key: &str) -> anyhow::Result<String> {
        let path = self.object_path(key)?;
        Ok(format!("file://{}", path.display()))
    }
}
