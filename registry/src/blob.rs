//! Blob stores
//!
//! Blob content lives once per namespace under a path derived from its digest.
//! Repositories reach content through link files, so a repository only sees
//! blobs that were pushed to it or mounted into it.

use std::sync::Arc;

use bytes::Bytes;
use storage::{Storage, WalkControl};

use crate::descriptor::{Descriptor, OCTET_STREAM};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::link::{read_link, write_link};
use crate::paths::{Layout, Links, digest_from_path};
use crate::reference::RepositoryName;
use crate::upload::BlobUpload;

/// Visitor for [`BlobEnumerator::enumerate`]. Returning an error stops the enumeration.
pub type BlobVisitor<'a> = dyn FnMut(Digest) -> RegistryResult<()> + Send + 'a;

/// Describes blobs by digest.
#[async_trait::async_trait]
pub trait BlobStatter: Send + Sync {
    /// Describe a blob, or fail with [`RegistryError::BlobUnknown`].
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor>;
}

/// Visits every blob of a store.
#[async_trait::async_trait]
pub trait BlobEnumerator: Send + Sync {
    /// Visit each digest in turn. Digests are discovered while walking storage,
    /// so the set of blobs never has to fit in memory.
    async fn enumerate(&self, visit: &mut BlobVisitor<'_>) -> RegistryResult<()>;
}

/// Content-addressed blob access for one repository.
#[async_trait::async_trait]
pub trait BlobStore: BlobStatter + BlobEnumerator {
    /// Fetch a blob. The content is verified against `digest` before it is returned.
    async fn get(&self, digest: &Digest) -> RegistryResult<Bytes>;

    /// Store a blob, returning its descriptor. Content already linked here is not
    /// written again.
    async fn put(&self, media_type: &str, content: Bytes) -> RegistryResult<Descriptor>;

    /// Start a chunked upload.
    async fn create(&self) -> RegistryResult<BlobUpload>;

    /// Pick up an upload session where the last closed chunk left it.
    async fn resume(&self, id: &str) -> RegistryResult<BlobUpload>;

    /// Link a blob from another repository of the same namespace, without
    /// copying its content.
    async fn mount(&self, from: &RepositoryName, digest: &Digest) -> RegistryResult<Descriptor>;

    /// Unlink a blob from this repository. Shared content is left in place.
    async fn delete(&self, digest: &Digest) -> RegistryResult<()>;
}

/// Namespace-wide view of blob content, independent of any repository.
#[derive(Debug, Clone)]
pub struct GlobalBlobStore {
    storage: Storage,
    layout: Arc<Layout>,
}

impl GlobalBlobStore {
    pub(crate) fn new(storage: Storage, layout: Arc<Layout>) -> Self {
        Self { storage, layout }
    }

    pub(crate) async fn contains(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.storage.exists(&self.layout.blob_data(digest)).await?)
    }

    /// Read content without linking checks, verifying its digest.
    pub(crate) async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        let content = match self.storage.get_content(&self.layout.blob_data(digest)).await {
            Ok(content) => content,
            Err(error) if error.is_not_found() => {
                return Err(RegistryError::BlobUnknown(digest.clone()));
            }
            Err(error) => return Err(error.into()),
        };
        digest.verify(&content)?;
        Ok(content)
    }

    /// Write content at its canonical path unless it is already there.
    /// Returns whether anything was written.
    pub(crate) async fn put(&self, digest: &Digest, content: Bytes) -> RegistryResult<bool> {
        if self.contains(digest).await? {
            tracing::trace!(%digest, "Blob content already present");
            return Ok(false);
        }
        self.storage
            .put_content(&self.layout.blob_data(digest), content)
            .await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl BlobStatter for GlobalBlobStore {
    #[tracing::instrument(skip_all, fields(%digest))]
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        match self.storage.stat(&self.layout.blob_data(digest)).await {
            Ok(metadata) if !metadata.is_dir => Ok(Descriptor {
                digest: digest.clone(),
                media_type: OCTET_STREAM.to_string(),
                size: metadata.size,
            }),
            Ok(_) => Err(RegistryError::BlobUnknown(digest.clone())),
            Err(error) if error.is_not_found() => Err(RegistryError::BlobUnknown(digest.clone())),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl BlobEnumerator for GlobalBlobStore {
    async fn enumerate(&self, visit: &mut BlobVisitor<'_>) -> RegistryResult<()> {
        let root = self.layout.blobs();
        if !self.storage.exists(&root).await? {
            return Ok(());
        }

        self.storage
            .walk(&root, |metadata| {
                if !metadata.is_dir && metadata.path.file_name() == Some("data") {
                    match digest_from_path(&metadata.path, 1) {
                        Some(digest) => visit(digest)?,
                        None => {
                            let path = &metadata.path;
                            tracing::debug!(%path, "Skipping unrecognized blob path");
                        }
                    }
                }
                Ok::<_, RegistryError>(WalkControl::Continue)
            })
            .await
    }
}

/// Blob store for one repository, reading and writing through link files.
///
/// The same store serves layers (`_layers`) and manifest revisions
/// (`_manifests/revisions`).
#[derive(Debug, Clone)]
pub struct LinkedBlobStore {
    storage: Storage,
    layout: Arc<Layout>,
    name: RepositoryName,
    links: Links,
    global: GlobalBlobStore,
    delete_enabled: bool,
}

impl LinkedBlobStore {
    pub(crate) fn new(
        storage: Storage,
        layout: Arc<Layout>,
        name: RepositoryName,
        links: Links,
        delete_enabled: bool,
    ) -> Self {
        let global = GlobalBlobStore::new(storage.clone(), layout.clone());
        Self {
            storage,
            layout,
            name,
            links,
            global,
            delete_enabled,
        }
    }

    /// The repository this store belongs to.
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    fn for_repository(&self, name: &RepositoryName) -> Self {
        Self::new(
            self.storage.clone(),
            self.layout.clone(),
            name.clone(),
            self.links,
            self.delete_enabled,
        )
    }

    async fn linked(&self, digest: &Digest) -> RegistryResult<Option<Descriptor>> {
        read_link(&self.storage, &self.layout.link(&self.name, self.links, digest)).await
    }

    /// The link for `digest`, provided its content still exists.
    async fn present(&self, digest: &Digest) -> RegistryResult<Option<Descriptor>> {
        match self.linked(digest).await? {
            Some(existing) if self.global.contains(digest).await? => Ok(Some(existing)),
            _ => Ok(None),
        }
    }

    /// Link already stored content into this repository.
    pub(crate) async fn link(&self, descriptor: &Descriptor) -> RegistryResult<()> {
        write_link(
            &self.storage,
            &self.layout.link(&self.name, self.links, &descriptor.digest),
            descriptor,
        )
        .await
    }
}

#[async_trait::async_trait]
impl BlobStatter for LinkedBlobStore {
    #[tracing::instrument(skip_all, fields(repository = %self.name, %digest))]
    async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        let descriptor = self
            .linked(digest)
            .await?
            .ok_or_else(|| RegistryError::BlobUnknown(digest.clone()))?;

        // A link can outlive its content if the content was removed out of band.
        if !self.global.contains(digest).await? {
            tracing::warn!(%digest, "Link points at missing blob content");
            return Err(RegistryError::BlobUnknown(digest.clone()));
        }
        Ok(descriptor)
    }
}

#[async_trait::async_trait]
impl BlobEnumerator for LinkedBlobStore {
    async fn enumerate(&self, visit: &mut BlobVisitor<'_>) -> RegistryResult<()> {
        let root = self.layout.links(&self.name, self.links);
        if !self.storage.exists(&root).await? {
            return Ok(());
        }

        self.storage
            .walk(&root, |metadata| {
                if !metadata.is_dir && metadata.path.file_name() == Some("link") {
                    if let Some(digest) = digest_from_path(&metadata.path, 1) {
                        visit(digest)?;
                    }
                }
                Ok::<_, RegistryError>(WalkControl::Continue)
            })
            .await
    }
}

#[async_trait::async_trait]
impl BlobStore for LinkedBlobStore {
    #[tracing::instrument(skip_all, fields(repository = %self.name, %digest))]
    async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        if self.linked(digest).await?.is_none() {
            return Err(RegistryError::BlobUnknown(digest.clone()));
        }
        self.global.get(digest).await
    }

    #[tracing::instrument(
        skip_all,
        fields(%media_type, repository = %self.name, len = content.len())
    )]
    async fn put(&self, media_type: &str, content: Bytes) -> RegistryResult<Descriptor> {
        let descriptor = Descriptor::from_content(media_type, &content);

        if let Some(existing) = self.present(&descriptor.digest).await? {
            tracing::debug!(digest = %existing.digest, "Blob already linked");
            return Ok(existing);
        }

        self.global.put(&descriptor.digest, content).await?;
        self.link(&descriptor).await?;
        tracing::debug!(digest = %descriptor.digest, "Stored blob");
        Ok(descriptor)
    }

    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    async fn create(&self) -> RegistryResult<BlobUpload> {
        BlobUpload::create(self.clone()).await
    }

    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    async fn resume(&self, id: &str) -> RegistryResult<BlobUpload> {
        BlobUpload::resume(self.clone(), id).await
    }

    #[tracing::instrument(skip_all, fields(repository = %self.name, %from, %digest))]
    async fn mount(&self, from: &RepositoryName, digest: &Digest) -> RegistryResult<Descriptor> {
        if let Some(existing) = self.present(digest).await? {
            return Ok(existing);
        }

        let descriptor = self.for_repository(from).stat(digest).await?;
        self.link(&descriptor).await?;
        Ok(descriptor)
    }

    #[tracing::instrument(skip_all, fields(repository = %self.name, %digest))]
    async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        if !self.delete_enabled {
            return Err(RegistryError::Unsupported("delete is disabled"));
        }

        match self
            .storage
            .delete(&self.layout.link_dir(&self.name, self.links, digest))
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Err(RegistryError::BlobUnknown(digest.clone())),
            Err(error) => Err(error.into()),
        }
    }
}

// Accessors for the upload session, which commits into this store.
impl LinkedBlobStore {
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn global(&self) -> &GlobalBlobStore {
        &self.global
    }
}
