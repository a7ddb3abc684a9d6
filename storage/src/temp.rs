use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, StorageError};

/// A storage driver that stores files in a temporary directory.
///
/// The directory, and everything in it, is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "temporary directory is not utf-8")
            })?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.get_content(path).await
    }

    async fn write_at(
        &self,
        path: &Utf8Path,
        offset: u64,
        content: Bytes,
    ) -> Result<(), StorageError> {
        self.driver.write_at(path, offset, content).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.stat(path).await
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(path).await
    }

    async fn move_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        self.driver.move_to(src, dst).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }
}
