use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

#[derive(Debug, Clone)]
struct MemoryFileItem {
    modified: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryFileItem {
    fn from(data: Bytes) -> Self {
        Self {
            modified: Utc::now(),
            data,
        }
    }
}

type Files = BTreeMap<Utf8PathBuf, MemoryFileItem>;

/// Every file strictly below `path`. Path ordering is component-wise, so
/// descendants sort contiguously right after the path itself.
fn descendants<'f>(
    files: &'f Files,
    path: &'f Utf8Path,
) -> impl Iterator<Item = (&'f Utf8PathBuf, &'f MemoryFileItem)> + 'f {
    files
        .range::<Utf8Path, _>((Bound::Excluded(path), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(path))
}

/// Storage driver that stores files in memory.
///
/// Directories are implicit: a path is a directory while some file lives below it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<Files>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn invalid(&self, path: &Utf8Path, message: String) -> StorageError {
        StorageError::builder(self.name(), StorageErrorKind::InvalidRequest, message)
            .path(path.as_str())
            .build()
    }

    fn check_parents(&self, files: &Files, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.ancestors().skip(1).find(|p| files.contains_key(*p)) {
            return Err(self.invalid(path, format!("Parent is a file: {parent}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        let files = self.files.read().await;
        files
            .get(path)
            .map(|item| item.data.clone())
            .ok_or_else(|| StorageError::not_found(self.name(), path.as_str()))
    }

    async fn write_at(
        &self,
        path: &Utf8Path,
        offset: u64,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let mut files = self.files.write().await;

        if descendants(&files, path).next().is_some() {
            return Err(self.invalid(path, format!("Path is a directory: {path}")));
        }
        self.check_parents(&files, path)?;

        let existing = files.get(path).map(|item| item.data.clone()).unwrap_or_default();
        if offset > existing.len() as u64 {
            return Err(self.invalid(
                path,
                format!("Offset {offset} past end of content ({} bytes)", existing.len()),
            ));
        }

        let data = if offset == 0 {
            content
        } else {
            let mut data = BytesMut::with_capacity(offset as usize + content.len());
            data.extend_from_slice(&existing[..offset as usize]);
            data.extend_from_slice(&content);
            data.freeze()
        };

        tracing::trace!(%path, offset, len = data.len(), "memory write");
        files.insert(path.to_owned(), data.into());
        Ok(())
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let files = self.files.read().await;
        if let Some(item) = files.get(path) {
            return Ok(Metadata {
                path: path.to_owned(),
                size: item.data.len() as u64,
                modified: item.modified,
                is_dir: false,
            });
        }

        descendants(&files, path)
            .map(|(_, item)| item.modified)
            .max()
            .map(|modified| Metadata {
                path: path.to_owned(),
                size: 0,
                modified,
                is_dir: true,
            })
            .ok_or_else(|| StorageError::not_found(self.name(), path.as_str()))
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        tracing::trace!(%path, "list memory storage");

        let files = self.files.read().await;
        let children: BTreeSet<Utf8PathBuf> = descendants(&files, path)
            .filter_map(|(key, _)| {
                let rest = key.strip_prefix(path).ok()?;
                let first = rest.components().next()?;
                Some(path.join(first.as_str()))
            })
            .collect();

        if children.is_empty() {
            return Err(StorageError::not_found(self.name(), path.as_str()));
        }
        Ok(children.into_iter().collect())
    }

    async fn move_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        if src == dst {
            return Ok(());
        }
        if dst.starts_with(src) {
            return Err(self.invalid(dst, format!("Cannot move {src} below itself")));
        }

        let mut files = self.files.write().await;
        self.check_parents(&files, dst)?;

        if let Some(item) = files.remove(src) {
            if descendants(&files, dst).next().is_some() {
                files.insert(src.to_owned(), item);
                return Err(self.invalid(dst, format!("Destination is a directory: {dst}")));
            }
            files.insert(dst.to_owned(), item);
            return Ok(());
        }

        let moved: Vec<Utf8PathBuf> = descendants(&files, src)
            .map(|(key, _)| key.clone())
            .collect();
        if moved.is_empty() {
            return Err(StorageError::not_found(self.name(), src.as_str()));
        }

        let stale: Vec<Utf8PathBuf> = descendants(&files, dst)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            files.remove(&key);
        }
        files.remove(dst);

        for key in moved {
            if let (Some(item), Ok(rest)) = (files.remove(&key), key.strip_prefix(src)) {
                files.insert(dst.join(rest), item);
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;

        let mut doomed: Vec<Utf8PathBuf> =
            descendants(&files, path).map(|(key, _)| key.clone()).collect();
        if files.contains_key(path) {
            doomed.push(path.to_owned());
        }
        if doomed.is_empty() {
            return Err(StorageError::not_found(self.name(), path.as_str()));
        }

        tracing::trace!(%path, count = doomed.len(), "memory delete");
        for key in doomed {
            files.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(path: &str) -> &Utf8Path {
        Utf8Path::new(path)
    }

    #[tokio::test]
    async fn directories_are_implicit() {
        let storage = MemoryStorage::new();
        storage
            .put_content(p("a/b/c"), Bytes::from_static(b"c"))
            .await
            .unwrap();
        storage
            .put_content(p("a/b-d"), Bytes::from_static(b"d"))
            .await
            .unwrap();

        assert!(storage.stat(p("a/b")).await.unwrap().is_dir);
        assert_eq!(storage.list(p("a")).await.unwrap(), vec![p("a/b"), p("a/b-d")]);
        assert_eq!(storage.list(p("a/b")).await.unwrap(), vec![p("a/b/c")]);

        let err = storage.get_content(p("a/b")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = storage
            .put_content(p("a/b/c/d"), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn write_at_rejects_gaps() {
        let storage = MemoryStorage::new();
        let err = storage
            .write_at(p("x"), 3, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
        assert!(storage.get_content(p("x")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn move_directory_tree() {
        let storage = MemoryStorage::new();
        storage
            .put_content(p("up/1/data"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        storage
            .put_content(p("up/1/startedat"), Bytes::from_static(b"t"))
            .await
            .unwrap();

        storage.move_to(p("up/1"), p("done/1")).await.unwrap();
        assert!(storage.stat(p("up")).await.unwrap_err().is_not_found());
        assert_eq!(
            storage.get_content(p("done/1/data")).await.unwrap(),
            Bytes::from_static(b"1")
        );
    }

    #[tokio::test]
    async fn delete_removes_subtree() {
        let storage = MemoryStorage::new();
        storage
            .put_content(p("r/a/link"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        storage
            .put_content(p("r/b/link"), Bytes::from_static(b"b"))
            .await
            .unwrap();

        storage.delete(p("r/a")).await.unwrap();
        assert_eq!(storage.list(p("r")).await.unwrap(), vec![p("r/b")]);
        assert!(storage.delete(p("r/a")).await.unwrap_err().is_not_found());
    }
}
