use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Storage driver backed by a directory on the local filesystem.
///
/// Content lives under `<root>/data`. Every write is staged in a file under
/// `<root>/staging` and renamed over its destination, so readers see either the
/// old or the new content.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

/// Convert a wrapped error into a `StorageError`, keeping the I/O kind when
/// there is one.
fn local_error(remote: &Utf8Path) -> impl FnOnce(eyre::Report) -> StorageError + '_ {
    move |report| {
        let kind = report
            .root_cause()
            .downcast_ref::<std::io::Error>()
            .map(|err| StorageErrorKind::from(err.kind()))
            .unwrap_or(StorageErrorKind::Other);
        StorageError::builder("local", kind, report)
            .path(remote.as_str())
            .build()
    }
}

impl LocalDriver {
    /// Create a driver storing files below `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn data(&self) -> Utf8PathBuf {
        self.root.join("data")
    }

    fn path(&self, remote: &Utf8Path) -> Utf8PathBuf {
        self.data().join(remote)
    }

    async fn staging_file(&self) -> eyre::Result<Utf8PathBuf> {
        let staging = self.root.join("staging");
        tokio::fs::create_dir_all(&staging)
            .await
            .wrap_err("create staging directory")?;
        Ok(staging.join(uuid::Uuid::new_v4().to_string()))
    }

    async fn stage(
        &self,
        staged: &Utf8Path,
        target: &Utf8Path,
        offset: u64,
        content: &[u8],
    ) -> eyre::Result<()> {
        let mut file = tokio::fs::File::create(staged)
            .await
            .wrap_err("create staging file")?;

        if offset > 0 {
            let existing = tokio::fs::File::open(target)
                .await
                .wrap_err("open existing content")?;
            let copied = tokio::io::copy(&mut existing.take(offset), &mut file)
                .await
                .wrap_err("copy existing content")?;
            if copied < offset {
                eyre::bail!("offset {offset} past end of content ({copied} bytes)");
            }
        }

        file.write_all(content).await.wrap_err("write content")?;
        file.sync_all().await.wrap_err("sync staging file")?;
        Ok(())
    }

    fn invalid(&self, remote: &Utf8Path, message: String) -> StorageError {
        StorageError::builder(self.name(), StorageErrorKind::InvalidRequest, message)
            .path(remote.as_str())
            .build()
    }

    /// A file can not be written below another file.
    async fn check_parents(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        for parent in remote.ancestors().skip(1).filter(|p| !p.as_str().is_empty()) {
            match tokio::fs::metadata(self.path(parent)).await {
                Ok(metadata) if metadata.is_dir() => return Ok(()),
                Ok(_) => return Err(self.invalid(remote, format!("Parent is a file: {parent}"))),
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(StorageError::io(self.name(), remote.as_str(), error)),
            }
        }
        Ok(())
    }

    /// Remove empty directories left behind by a delete or move, up to the data root.
    async fn prune(&self, mut dir: Option<&Utf8Path>) {
        let data = self.data();
        while let Some(path) = dir {
            if path == data || !path.starts_with(&data) {
                break;
            }
            if tokio::fs::remove_dir(path).await.is_err() {
                break;
            }
            dir = path.parent();
        }
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get_content(&self, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        let content = tokio::fs::read(self.path(remote))
            .await
            .wrap_err("read content")
            .map_err(local_error(remote))?;
        Ok(content.into())
    }

    async fn write_at(
        &self,
        remote: &Utf8Path,
        offset: u64,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let target = self.path(remote);
        self.check_parents(remote).await?;

        let existing = match tokio::fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => {
                return Err(self.invalid(remote, format!("Path is a directory: {remote}")));
            }
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => 0,
            Err(error) => return Err(StorageError::io(self.name(), remote.as_str(), error)),
        };
        if offset > existing {
            return Err(self.invalid(
                remote,
                format!("Offset {offset} past end of content ({existing} bytes)"),
            ));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err("create parent directories")
                .map_err(local_error(remote))?;
        }

        let staged = self.staging_file().await.map_err(local_error(remote))?;
        let result = async {
            self.stage(&staged, &target, offset, &content).await?;
            tokio::fs::rename(&staged, &target)
                .await
                .wrap_err("rename staged content into place")
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }
        result.map_err(local_error(remote))?;

        tracing::trace!(%remote, offset, len = content.len(), "local write");
        Ok(())
    }

    async fn stat(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let metadata = tokio::fs::metadata(self.path(remote))
            .await
            .wrap_err("local driver: metadata")
            .map_err(local_error(remote))?;
        Ok(Metadata {
            path: remote.to_owned(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata
                .modified()
                .wrap_err("modified timestamp")
                .map_err(local_error(remote))?
                .into(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, remote: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let path = self.path(remote);

        let names = tokio::task::spawn_blocking(move || collect_list(&path))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(local_error(remote))?
            .map_err(local_error(remote))?;

        tracing::debug!("Found {} entries", names.len());
        Ok(names.into_iter().map(|name| remote.join(name)).collect())
    }

    async fn move_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        let source = self.path(src);
        let target = self.path(dst);

        tokio::fs::metadata(&source)
            .await
            .wrap_err("stat move source")
            .map_err(local_error(src))?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err("create parent directories")
                .map_err(local_error(dst))?;
        }

        tokio::fs::rename(&source, &target)
            .await
            .wrap_err("rename")
            .map_err(local_error(dst))?;

        self.prune(source.parent()).await;
        Ok(())
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .wrap_err("stat before delete")
            .map_err(local_error(remote))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .wrap_err("remove_dir_all")
                .map_err(local_error(remote))?;
        } else {
            tokio::fs::remove_file(&path)
                .await
                .wrap_err("remove_file")
                .map_err(local_error(remote))?;
        }

        self.prune(path.parent()).await;
        Ok(())
    }
}

#[tracing::instrument]
fn collect_list(path: &Utf8Path) -> eyre::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        names.push(entry.file_name().to_owned());
    }
    names.sort();
    Ok(names)
}
