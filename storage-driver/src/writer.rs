use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::BytesMut;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWrite;

use crate::driver::{check_path, Driver};
use crate::error::{StorageError, StorageErrorKind};

/// Lifecycle of a [`FileWriter`]. `Committed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting writes.
    Open,

    /// The buffer was written to the backing path.
    Committed,

    /// The buffer was discarded.
    Cancelled,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterState::Open => write!(f, "open"),
            WriterState::Committed => write!(f, "committed"),
            WriterState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A buffered writer bound to one path and start offset of a driver.
///
/// Writes accumulate in memory and never reach the backend until
/// [`commit`](FileWriter::commit), which lands the whole buffer through
/// [`Driver::write_at`]. Readers of the path see the previously committed
/// content until then. [`cancel`](FileWriter::cancel) discards the buffer
/// without touching the backend.
///
/// [`close`](FileWriter::close) commits a writer which is still open. Dropping
/// an open writer discards its buffer, the same as `cancel`.
pub struct FileWriter {
    driver: Arc<dyn Driver>,
    path: Utf8PathBuf,
    offset: u64,
    size: u64,
    buffer: BytesMut,
    state: WriterState,
}

impl fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWriter")
            .field("driver", &self.driver.name())
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("state", &self.state)
            .finish()
    }
}

impl FileWriter {
    /// Open a writer at `path`.
    ///
    /// With `append`, the writer starts at the end of any existing content, so a
    /// commit extends it. Without `append`, the writer starts at offset zero and
    /// a commit replaces whatever was there.
    #[tracing::instrument(skip(driver), fields(driver = driver.name()))]
    pub async fn open(
        driver: Arc<dyn Driver>,
        path: Utf8PathBuf,
        append: bool,
    ) -> Result<Self, StorageError> {
        check_path(driver.name(), &path)?;

        let offset = if append {
            match driver.stat(&path).await {
                Ok(metadata) if metadata.is_dir => {
                    return Err(StorageError::builder(
                        driver.name(),
                        StorageErrorKind::InvalidRequest,
                        format!("Cannot write to directory: {path}"),
                    )
                    .path(path.as_str())
                    .build());
                }
                Ok(metadata) => metadata.size,
                Err(error) if error.is_not_found() => 0,
                Err(error) => return Err(error),
            }
        } else {
            0
        };

        tracing::trace!(%path, offset, "Opened writer");
        Ok(Self::new(driver, path, offset))
    }

    /// Bind a writer to an explicit start offset.
    pub fn new(driver: Arc<dyn Driver>, path: Utf8PathBuf, offset: u64) -> Self {
        Self {
            driver,
            path,
            offset,
            size: offset,
            buffer: BytesMut::new(),
            state: WriterState::Open,
        }
    }

    /// The path this writer commits to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The offset the buffered bytes will be written at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The logical size of the content: start offset plus every byte written.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    fn ensure_open(&self, operation: &str) -> Result<(), StorageError> {
        if self.state == WriterState::Open {
            return Ok(());
        }

        Err(StorageError::builder(
            self.driver.name(),
            StorageErrorKind::AlreadyFinished,
            format!("cannot {operation}: writer is {}", self.state),
        )
        .path(self.path.as_str())
        .build())
    }

    /// Append bytes to the buffer.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError> {
        self.ensure_open("write")?;
        self.buffer.extend_from_slice(buf);
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    /// Write the buffer to the backing path at the start offset.
    ///
    /// On failure the writer stays open with its buffer intact.
    pub async fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_open("commit")?;

        let content = self.buffer.split().freeze();
        tracing::trace!(
            path = %self.path,
            offset = self.offset,
            len = content.len(),
            "Committing writer"
        );
        if let Err(error) = self
            .driver
            .write_at(&self.path, self.offset, content.clone())
            .await
        {
            self.buffer = BytesMut::from(content.as_ref());
            return Err(error);
        }

        self.state = WriterState::Committed;
        Ok(())
    }

    /// Discard the buffer without writing it.
    pub fn cancel(&mut self) -> Result<(), StorageError> {
        self.ensure_open("cancel")?;
        tracing::trace!(path = %self.path, discarded = self.buffer.len(), "Cancelling writer");
        self.buffer = BytesMut::new();
        self.state = WriterState::Cancelled;
        Ok(())
    }

    /// Finish the writer, committing it if neither commit nor cancel was called.
    pub async fn close(mut self) -> Result<(), StorageError> {
        match self.state {
            WriterState::Open => self.commit().await,
            WriterState::Committed | WriterState::Cancelled => Ok(()),
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            tracing::warn!(
                path = %self.path,
                discarded = self.buffer.len(),
                "Writer dropped while open, discarding buffer"
            );
        }
    }
}

impl AsyncWrite for FileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.get_mut().write(buf).map_err(io::Error::other))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    // Shutdown only ends the byte stream; the writer still needs commit or cancel.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use bytes::Bytes;
    use chrono::Utc;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::Metadata;

    /// Flat map driver which counts every `write_at`.
    #[derive(Debug, Default)]
    struct Recording {
        files: Mutex<BTreeMap<Utf8PathBuf, Vec<u8>>>,
        writes: AtomicUsize,
    }

    impl Recording {
        fn content(&self, path: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(Utf8Path::new(path)).cloned()
        }
    }

    #[async_trait::async_trait]
    impl Driver for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
            self.content(path.as_str())
                .map(Bytes::from)
                .ok_or_else(|| StorageError::not_found(self.name(), path.as_str()))
        }

        async fn write_at(
            &self,
            path: &Utf8Path,
            offset: u64,
            content: Bytes,
        ) -> Result<(), StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut files = self.files.lock().unwrap();
            let mut data = files.get(path).cloned().unwrap_or_default();
            data.truncate(offset as usize);
            data.extend_from_slice(&content);
            files.insert(path.to_owned(), data);
            Ok(())
        }

        async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
            let size = self
                .content(path.as_str())
                .ok_or_else(|| StorageError::not_found(self.name(), path.as_str()))?
                .len() as u64;
            Ok(Metadata {
                path: path.to_owned(),
                size,
                modified: Utc::now(),
                is_dir: false,
            })
        }

        async fn list(&self, _path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
            Ok(Vec::new())
        }

        async fn move_to(&self, _src: &Utf8Path, _dst: &Utf8Path) -> Result<(), StorageError> {
            Ok(())
        }

        async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }
    }

    fn recording() -> (Arc<Recording>, Arc<dyn Driver>) {
        let driver = Arc::new(Recording::default());
        let erased: Arc<dyn Driver> = driver.clone();
        (driver, erased)
    }

    #[tokio::test]
    async fn writes_stay_buffered_until_commit() {
        let (recording, driver) = recording();
        let mut writer = FileWriter::open(driver, "x".into(), false).await.unwrap();

        writer.write(b"con").unwrap();
        writer.write(b"tent").unwrap();
        assert_eq!(writer.size(), 7);
        assert_eq!(recording.writes.load(Ordering::SeqCst), 0);
        assert_eq!(recording.content("x"), None);

        writer.commit().await.unwrap();
        assert_eq!(recording.writes.load(Ordering::SeqCst), 1);
        assert_eq!(recording.content("x").unwrap(), b"content");
        assert_eq!(writer.state(), WriterState::Committed);
    }

    #[tokio::test]
    async fn append_starts_at_existing_end() {
        let (recording, driver) = recording();
        driver
            .put_content(Utf8Path::new("x"), Bytes::from_static(b"test1"))
            .await
            .unwrap();

        let mut writer = FileWriter::open(driver, "x".into(), true).await.unwrap();
        assert_eq!(writer.offset(), 5);
        writer.write(b"test").unwrap();
        assert_eq!(writer.size(), 9);
        writer.commit().await.unwrap();

        assert_eq!(recording.content("x").unwrap(), b"test1test");
    }

    #[tokio::test]
    async fn finished_writers_reject_everything() {
        let (_, driver) = recording();
        let mut writer = FileWriter::open(driver, "x".into(), false).await.unwrap();
        writer.write(b"test").unwrap();
        writer.commit().await.unwrap();

        let err = writer.write(b"more").unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::AlreadyFinished);
        let err = writer.commit().await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::AlreadyFinished);
        let err = writer.cancel().unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::AlreadyFinished);
    }

    #[tokio::test]
    async fn cancel_never_touches_backend() {
        let (recording, driver) = recording();
        let mut writer = FileWriter::open(driver, "x".into(), false).await.unwrap();
        writer.write(b"test").unwrap();
        writer.cancel().unwrap();

        assert_eq!(recording.writes.load(Ordering::SeqCst), 0);
        assert_eq!(recording.content("x"), None);
        let err = writer.commit().await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::AlreadyFinished);
        writer.close().await.unwrap();
        assert_eq!(recording.content("x"), None);
    }

    #[tokio::test]
    async fn close_commits_open_writer() {
        let (recording, driver) = recording();
        let mut writer = FileWriter::open(driver, "x".into(), false).await.unwrap();
        writer.write_all(b"test").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(recording.content("x").unwrap(), b"test");
    }

    #[tokio::test]
    async fn dropped_writer_discards_buffer() {
        let (recording, driver) = recording();
        {
            let mut writer = FileWriter::open(driver, "x".into(), false).await.unwrap();
            writer.write(b"test").unwrap();
        }
        assert_eq!(recording.writes.load(Ordering::SeqCst), 0);
        assert_eq!(recording.content("x"), None);
    }

    #[tokio::test]
    async fn open_rejects_invalid_path() {
        let (_, driver) = recording();
        let err = FileWriter::open(driver, "../x".into(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidPath);
    }
}
