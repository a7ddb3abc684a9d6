use std::sync::Arc;

use storage::Storage;

use crate::blob::{BlobStore, LinkedBlobStore};
use crate::error::RegistryResult;
use crate::manifest::{ManifestOptions, ManifestService, ManifestStore};
use crate::paths::{Layout, Links};
use crate::reference::RepositoryName;
use crate::tag::{TagService, TagStore, TrustPolicy};

/// A named repository, giving access to its manifests, blobs and tags.
///
/// A repository is a handle: creating one never touches storage, and a
/// repository with nothing stored is indistinguishable from an empty one.
pub trait Repository: Send + Sync {
    /// Manifest service type.
    type Manifests: ManifestService;

    /// Blob store type.
    type Blobs: BlobStore;

    /// Tag service type.
    type Tags: TagService;

    /// The repository name.
    fn named(&self) -> &RepositoryName;

    /// A manifest service applying `options` to every call.
    fn manifests(&self, options: ManifestOptions) -> RegistryResult<Self::Manifests>;

    /// The repository's blob store.
    fn blobs(&self) -> Self::Blobs;

    /// The repository's tags.
    fn tags(&self) -> Self::Tags;
}

/// A repository kept in registry storage.
#[derive(Debug, Clone)]
pub struct StoredRepository {
    name: RepositoryName,
    storage: Storage,
    layout: Arc<Layout>,
    delete_enabled: bool,
    trust: TrustPolicy,
}

impl StoredRepository {
    pub(crate) fn new(
        name: RepositoryName,
        storage: Storage,
        layout: Arc<Layout>,
        delete_enabled: bool,
        trust: TrustPolicy,
    ) -> Self {
        Self {
            name,
            storage,
            layout,
            delete_enabled,
            trust,
        }
    }

    fn linked(&self, links: Links) -> LinkedBlobStore {
        LinkedBlobStore::new(
            self.storage.clone(),
            self.layout.clone(),
            self.name.clone(),
            links,
            self.delete_enabled,
        )
    }
}

impl Repository for StoredRepository {
    type Manifests = ManifestStore;
    type Blobs = LinkedBlobStore;
    type Tags = TagStore;

    fn named(&self) -> &RepositoryName {
        &self.name
    }

    fn manifests(&self, options: ManifestOptions) -> RegistryResult<ManifestStore> {
        ManifestStore::new(
            self.linked(Links::Revisions),
            self.tags(),
            options,
            self.delete_enabled,
        )
    }

    fn blobs(&self) -> LinkedBlobStore {
        self.linked(Links::Layers)
    }

    fn tags(&self) -> TagStore {
        TagStore::new(
            self.storage.clone(),
            self.layout.clone(),
            self.name.clone(),
            self.trust,
        )
    }
}
