use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use crate::error::{StorageError, StorageErrorKind};

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The path this metadata describes.
    pub path: Utf8PathBuf,

    /// The size of the file in bytes. Directories report zero.
    pub size: u64,

    /// The last modification timestamp.
    pub modified: DateTime<Utc>,

    /// Whether the path is a directory (a prefix of other paths).
    pub is_dir: bool,
}

/// A storage driver, which provides a path-keyed byte store over some backend.
///
/// Every operation either completes against committed state or fails; a reader
/// never observes a partially written object. Multi-step writes are staged by a
/// [`FileWriter`](crate::FileWriter) and land through [`Driver::write_at`].
///
/// Paths handed to a driver have already been checked with [`check_path`].
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Read the full committed content at a path.
    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError>;

    /// Replace the content at a path as a single atomic operation.
    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<(), StorageError> {
        self.write_at(path, 0, content).await
    }

    /// Atomically replace the content at `path` with its first `offset` bytes
    /// followed by `content`.
    ///
    /// An `offset` of zero truncates. An `offset` past the end of the existing
    /// content (or any non-zero offset on an absent path) is an invalid request.
    async fn write_at(
        &self,
        path: &Utf8Path,
        offset: u64,
        content: Bytes,
    ) -> Result<(), StorageError>;

    /// Get the metadata for a file or directory, by path.
    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// List the immediate children of a directory, sorted.
    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError>;

    /// Move an object from `src` to `dst`, replacing `dst` atomically.
    async fn move_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError>;

    /// Delete a file, or a directory and everything below it.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;
}

fn valid_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && component
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b':'))
}

/// Validate a storage path: relative, `/` separated, with every component made
/// of `[A-Za-z0-9._:-]` and none of them empty, `.` or `..`.
pub fn check_path(engine: &'static str, path: &Utf8Path) -> Result<(), StorageError> {
    if path.as_str().split('/').all(valid_component) {
        return Ok(());
    }

    Err(StorageError::builder(
        engine,
        StorageErrorKind::InvalidPath,
        format!("Invalid storage path: {path:?}"),
    )
    .path(path.as_str())
    .build())
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<(), StorageError> {
        self.deref().put_content(path, content).await
    }

    async fn write_at(
        &self,
        path: &Utf8Path,
        offset: u64,
        content: Bytes,
    ) -> Result<(), StorageError> {
        self.deref().write_at(path, offset, content).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().stat(path).await
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.deref().list(path).await
    }

    async fn move_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        self.deref().move_to(src, dst).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }
}
