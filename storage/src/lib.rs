//! # Storage backends
//!
//! Configuration and unification for the storage backends, and the
//! [`Storage`] handle every higher layer reads and writes through.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{
    check_path, Driver, FileWriter, Metadata, StorageError, StorageErrorKind, WriterState,
};

/// Storage backend selection, usually deserialized from the service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory,

    /// Store files under a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory of the store.
        path: Utf8PathBuf,
    },

    /// Store files in a fresh temporary directory, removed on drop.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured driver.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let storage: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(StorageError::with("temp", StorageErrorKind::Io))?
                .into(),
        };
        Ok(storage)
    }
}

/// Whether [`Storage::walk`] should descend into a directory it just visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep walking, descending into directories.
    Continue,

    /// Do not descend into this directory.
    SkipDir,
}

/// A shared handle to a storage driver.
///
/// Paths are validated before they reach the driver, and every operation
/// is traced.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: Arc<dyn Driver>,
}

impl<D> From<D> for Storage
where
    D: Driver + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    fn check(&self, path: &Utf8Path) -> Result<(), StorageError> {
        storage_driver::check_path(self.driver.name(), path)
    }

    /// Read the committed content at a path.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        self.check(path)?;
        let content = self.driver.get_content(path).await?;
        tracing::trace!(%path, len = content.len(), "Read content");
        Ok(content)
    }

    /// Atomically replace the content at a path.
    #[tracing::instrument(skip(self, content), fields(driver=self.driver.name()))]
    pub async fn put_content<C>(&self, path: &Utf8Path, content: C) -> Result<(), StorageError>
    where
        C: Into<Bytes>,
    {
        self.check(path)?;
        let content = content.into();
        tracing::trace!(%path, len = content.len(), "Writing content");
        self.driver.put_content(path, content).await
    }

    /// Open a buffered writer at a path.
    ///
    /// With `append`, a commit extends the existing content; otherwise it replaces it.
    pub async fn writer<P>(&self, path: P, append: bool) -> Result<FileWriter, StorageError>
    where
        P: Into<Utf8PathBuf>,
    {
        FileWriter::open(self.driver.clone(), path.into(), append).await
    }

    /// Get the metadata for a path.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.check(path)?;
        self.driver.stat(path).await
    }

    /// Check whether a path exists. Only a missing path answers `false`; other
    /// failures are returned.
    pub async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// List the immediate children of a directory, sorted.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.check(path)?;
        let children = self.driver.list(path).await?;
        tracing::trace!(%path, "Found {} entries", children.len());
        Ok(children)
    }

    /// Move a file or directory.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn move_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        self.check(src)?;
        self.check(dst)?;
        self.driver.move_to(src, dst).await
    }

    /// Delete a file or directory tree.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.check(path)?;
        self.driver.delete(path).await
    }

    /// Walk everything below `root` depth first, in lexicographic order.
    ///
    /// Directories are listed only when the walk reaches them, so the walk never
    /// holds more than the pending siblings along the current branch. Entries
    /// which disappear mid-walk are skipped. The first visitor error stops the walk.
    pub async fn walk<F, E>(&self, root: &Utf8Path, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&Metadata) -> Result<WalkControl, E>,
        E: From<StorageError>,
    {
        let mut stack = vec![self.list(root).await?.into_iter()];

        while let Some(siblings) = stack.last_mut() {
            let Some(child) = siblings.next() else {
                stack.pop();
                continue;
            };

            let metadata = match self.stat(&child).await {
                Ok(metadata) => metadata,
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error.into()),
            };

            if visit(&metadata)? == WalkControl::Continue && metadata.is_dir {
                match self.list(&child).await {
                    Ok(children) => stack.push(children.into_iter()),
                    Err(error) if error.is_not_found() => continue,
                    Err(error) => return Err(error.into()),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_config() {
        let config: StorageConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));

        let config: StorageConfig =
            serde_json::from_str(r#"{"local": {"path": "/var/lib/registry"}}"#).unwrap();
        match config {
            StorageConfig::Local { path } => assert_eq!(path, "/var/lib/registry"),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[tokio::test]
    async fn walk_visits_in_order_and_skips() {
        let storage = StorageConfig::Memory.build().unwrap();
        for path in ["r/a/1", "r/a/2", "r/b/skipped/3", "r/c"] {
            storage
                .put_content(Utf8Path::new(path), path.as_bytes().to_vec())
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        storage
            .walk(Utf8Path::new("r"), |metadata| {
                seen.push(metadata.path.to_string());
                if metadata.path == "r/b" {
                    Ok::<_, StorageError>(WalkControl::SkipDir)
                } else {
                    Ok(WalkControl::Continue)
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, vec!["r/a", "r/a/1", "r/a/2", "r/b", "r/c"]);
    }

    #[tokio::test]
    async fn invalid_paths_never_reach_driver() {
        let storage = StorageConfig::Memory.build().unwrap();
        let err = storage.get_content(Utf8Path::new("/etc/passwd")).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidPath);
    }
}
