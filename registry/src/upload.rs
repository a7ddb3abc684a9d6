use chrono::{DateTime, Utc};
use storage::FileWriter;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::blob::LinkedBlobStore;
use crate::descriptor::Descriptor;
use crate::digest::{Digest, Digester};
use crate::error::{RegistryError, RegistryResult};

const READ_CHUNK: usize = 32 * 1024;

/// Read the contents of a session's `startedat` file.
pub(crate) fn parse_started_at(content: &[u8]) -> Option<DateTime<Utc>> {
    let started_at = std::str::from_utf8(content).ok()?;
    let started_at = DateTime::parse_from_rfc3339(started_at.trim()).ok()?;
    Some(started_at.with_timezone(&Utc))
}

/// A chunked blob upload session.
///
/// Each chunk is staged in a [`FileWriter`] under the repository's `_uploads`
/// directory. [`close`](BlobUpload::close) persists the chunk so the session
/// can be resumed by id, and [`commit`](BlobUpload::commit) verifies the digest
/// and moves the content to its canonical location.
///
/// Dropping a session discards the unclosed chunk, but leaves earlier chunks
/// resumable. Sessions which are never committed or cancelled stay in storage
/// until [`Registry::purge_uploads`](crate::Registry::purge_uploads) removes them.
#[derive(Debug)]
pub struct BlobUpload {
    store: LinkedBlobStore,
    id: String,
    started_at: DateTime<Utc>,
    writer: FileWriter,

    // Only a session which saw every byte can finish its digest without
    // reading the content back.
    digester: Option<Digester>,
}

impl BlobUpload {
    pub(crate) async fn create(store: LinkedBlobStore) -> RegistryResult<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let layout = store.layout();

        store
            .storage()
            .put_content(
                &layout.upload_started_at(store.name(), &id),
                started_at.to_rfc3339(),
            )
            .await?;
        let writer = store
            .storage()
            .writer(layout.upload_data(store.name(), &id), false)
            .await?;

        tracing::debug!(%id, "Started upload");
        Ok(Self {
            store,
            id,
            started_at,
            writer,
            digester: Some(Digester::default()),
        })
    }

    pub(crate) async fn resume(store: LinkedBlobStore, id: &str) -> RegistryResult<Self> {
        let unknown = || RegistryError::BlobUploadUnknown(id.to_string());
        let id = uuid::Uuid::parse_str(id).map_err(|_| unknown())?.to_string();
        let layout = store.layout();

        let started_at = match store
            .storage()
            .get_content(&layout.upload_started_at(store.name(), &id))
            .await
        {
            Ok(content) => parse_started_at(&content).ok_or_else(unknown)?,
            Err(error) if error.is_not_found() => return Err(unknown()),
            Err(error) => return Err(error.into()),
        };

        let writer = store
            .storage()
            .writer(layout.upload_data(store.name(), &id), true)
            .await?;

        tracing::debug!(%id, offset = writer.offset(), "Resumed upload");
        Ok(Self {
            store,
            id,
            started_at,
            writer,
            digester: None,
        })
    }

    /// Identifier used to resume this session.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the session was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Bytes received so far, including earlier closed chunks.
    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    /// Buffer more content.
    pub fn write(&mut self, content: &[u8]) -> RegistryResult<usize> {
        let n = self.writer.write(content)?;
        if let Some(digester) = &mut self.digester {
            digester.update(&content[..n]);
        }
        Ok(n)
    }

    /// Buffer everything `reader` yields, returning how many bytes were read.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> RegistryResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0; READ_CHUNK];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(&buf[..n])?;
            total += n as u64;
        }
    }

    /// Persist the buffered chunk. The session stays resumable by id.
    #[tracing::instrument(skip_all, fields(id = %self.id, size = self.size()))]
    pub async fn close(self) -> RegistryResult<()> {
        self.writer.close().await?;
        Ok(())
    }

    /// Finish the upload.
    ///
    /// The content must hash to `expected`. On a mismatch the session is
    /// removed and nothing is linked. The link records `media_type`.
    #[tracing::instrument(skip_all, fields(id = %self.id, %expected, %media_type))]
    pub async fn commit(
        mut self,
        expected: &Digest,
        media_type: &str,
    ) -> RegistryResult<Descriptor> {
        self.writer.commit().await?;

        let storage = self.store.storage();
        let layout = self.store.layout();
        let data = layout.upload_data(self.store.name(), &self.id);

        let actual = match self.digester.take() {
            Some(digester) if digester.algorithm() == expected.algorithm() => digester.finalize(),
            _ => {
                let content = storage.get_content(&data).await?;
                Digest::compute(expected.algorithm(), &content)
            }
        };

        if &actual != expected {
            tracing::warn!(%actual, "Upload does not match its digest");
            self.remove().await?;
            return Err(RegistryError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        if self.store.global().contains(expected).await? {
            tracing::debug!("Blob content already present");
        } else {
            storage.move_to(&data, &layout.blob_data(expected)).await?;
        }

        let descriptor = Descriptor {
            digest: expected.clone(),
            media_type: media_type.to_string(),
            size: self.writer.size(),
        };
        self.store.link(&descriptor).await?;
        self.remove().await?;

        Ok(descriptor)
    }

    /// Abandon the session, removing every chunk.
    #[tracing::instrument(skip_all, fields(id = %self.id))]
    pub async fn cancel(mut self) -> RegistryResult<()> {
        self.writer.cancel()?;
        self.remove().await
    }

    async fn remove(&self) -> RegistryResult<()> {
        let path = self.store.layout().upload(self.store.name(), &self.id);
        match self.store.storage().delete(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::blob::{BlobStatter, BlobStore};
    use crate::descriptor::OCTET_STREAM;
    use crate::paths::{Layout, Links};
    use crate::reference::RepositoryName;

    fn store() -> LinkedBlobStore {
        LinkedBlobStore::new(
            Storage::new(MemoryStorage::new()),
            Arc::new(Layout::default()),
            RepositoryName::new("uploads").unwrap(),
            Links::Layers,
            false,
        )
    }

    #[tokio::test]
    async fn single_chunk_upload() {
        let blobs = store();
        let mut upload = blobs.create().await.unwrap();
        upload.write(b"hello ").unwrap();
        upload.write(b"world").unwrap();
        assert_eq!(upload.size(), 11);

        let digest = Digest::from_bytes(b"hello world");
        let layer = "application/vnd.oci.image.layer.v1.tar+gzip";
        let descriptor = upload.commit(&digest, layer).await.unwrap();
        assert_eq!(descriptor.size, 11);
        assert_eq!(blobs.stat(&digest).await.unwrap().media_type, layer);
        assert_eq!(&blobs.get(&digest).await.unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn resumed_upload_keeps_closed_chunks() {
        let blobs = store();
        let mut upload = blobs.create().await.unwrap();
        let id = upload.id().to_string();
        upload.write(b"first,").unwrap();
        upload.close().await.unwrap();

        let mut upload = blobs.resume(&id).await.unwrap();
        assert_eq!(upload.size(), 6);
        let mut reader: &[u8] = b"second";
        assert_eq!(upload.write_from(&mut reader).await.unwrap(), 6);

        let digest = Digest::from_bytes(b"first,second");
        upload.commit(&digest, OCTET_STREAM).await.unwrap();
        assert_eq!(blobs.stat(&digest).await.unwrap().size, 12);

        let err = blobs.resume(&id).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobUploadUnknown(_)));
    }

    #[tokio::test]
    async fn dropped_chunk_is_discarded() {
        let blobs = store();
        let mut upload = blobs.create().await.unwrap();
        let id = upload.id().to_string();
        upload.write(b"kept").unwrap();
        upload.close().await.unwrap();

        let mut upload = blobs.resume(&id).await.unwrap();
        upload.write(b"lost").unwrap();
        drop(upload);

        let upload = blobs.resume(&id).await.unwrap();
        assert_eq!(upload.size(), 4);
    }

    #[tokio::test]
    async fn mismatched_digest_links_nothing() {
        let blobs = store();
        let mut upload = blobs.create().await.unwrap();
        let id = upload.id().to_string();
        upload.write(b"actual").unwrap();

        let claimed = Digest::from_bytes(b"claimed");
        let err = upload.commit(&claimed, OCTET_STREAM).await.unwrap_err();
        assert!(err.is_integrity_error());
        assert!(blobs.stat(&claimed).await.unwrap_err().is_not_found());
        assert!(blobs.stat(&Digest::from_bytes(b"actual")).await.is_err());
        assert!(blobs.resume(&id).await.is_err());
    }

    #[tokio::test]
    async fn cancel_removes_session() {
        let blobs = store();
        let mut upload = blobs.create().await.unwrap();
        let id = upload.id().to_string();
        upload.write(b"abandoned").unwrap();
        upload.cancel().await.unwrap();

        assert!(matches!(
            blobs.resume(&id).await.unwrap_err(),
            RegistryError::BlobUploadUnknown(_)
        ));
    }

    #[tokio::test]
    async fn upload_of_existing_content_is_deduplicated() {
        let blobs = store();
        let descriptor = blobs
            .put(OCTET_STREAM, Bytes::from_static(b"same"))
            .await
            .unwrap();

        let mut upload = blobs.create().await.unwrap();
        upload.write(b"same").unwrap();
        let committed = upload.commit(&descriptor.digest, OCTET_STREAM).await.unwrap();
        assert_eq!(committed, descriptor);
    }

    #[tokio::test]
    async fn resume_rejects_garbage_ids() {
        let blobs = store();
        for id in ["", "nope", "../../etc", "00000000-0000-0000-0000-000000000000"] {
            assert!(matches!(
                blobs.resume(id).await.unwrap_err(),
                RegistryError::BlobUploadUnknown(_)
            ));
        }
    }
}
