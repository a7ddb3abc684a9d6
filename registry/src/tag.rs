//! Tags: mutable names for manifest descriptors

use std::sync::Arc;

use serde::Deserialize;
use storage::Storage;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::link::{read_link, write_link};
use crate::paths::{Layout, Links};
use crate::reference::{RepositoryName, check_tag};

/// The result of resolving a tag.
///
/// Both variants carry the target, so callers decide what an untrusted
/// association is worth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagLookup {
    /// The tag points at a descriptor whose provenance was verified.
    Trusted(Descriptor),

    /// The tag exists, but nothing vouches for what it points at.
    Untrusted(Descriptor),
}

impl TagLookup {
    /// The target descriptor, whatever the trust.
    pub fn descriptor(&self) -> &Descriptor {
        match self {
            TagLookup::Trusted(descriptor) | TagLookup::Untrusted(descriptor) => descriptor,
        }
    }

    /// Whether the association is trusted.
    pub fn is_trusted(&self) -> bool {
        matches!(self, TagLookup::Trusted(_))
    }

    /// The target descriptor, whatever the trust.
    pub fn into_descriptor(self) -> Descriptor {
        match self {
            TagLookup::Trusted(descriptor) | TagLookup::Untrusted(descriptor) => descriptor,
        }
    }

    /// The target descriptor, or [`RegistryError::TagUntrusted`].
    pub fn into_trusted(self, tag: &str) -> RegistryResult<Descriptor> {
        match self {
            TagLookup::Trusted(descriptor) => Ok(descriptor),
            TagLookup::Untrusted(descriptor) => Err(RegistryError::TagUntrusted {
                tag: tag.to_string(),
                descriptor,
            }),
        }
    }
}

/// How tag lookups decide trust.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Every stored tag is trusted.
    #[default]
    All,

    /// A tag is trusted only when it points at a manifest revision stored in
    /// the same repository.
    VerifiedRevisions,
}

/// Tag operations for one repository.
#[async_trait::async_trait]
pub trait TagService: Send + Sync {
    /// Resolve a tag, or fail with [`RegistryError::TagUnknown`].
    async fn get(&self, tag: &str) -> RegistryResult<TagLookup>;

    /// Point a tag at a descriptor, replacing any previous target.
    async fn tag(&self, tag: &str, descriptor: &Descriptor) -> RegistryResult<()>;

    /// Remove a tag. Removing an absent tag succeeds.
    async fn untag(&self, tag: &str) -> RegistryResult<()>;

    /// Every tag of the repository, sorted.
    async fn all(&self) -> RegistryResult<Vec<String>>;

    /// Every tag currently pointing at `digest`, sorted.
    async fn lookup(&self, digest: &Digest) -> RegistryResult<Vec<String>>;
}

/// Tags stored as link files under `_manifests/tags`.
#[derive(Debug, Clone)]
pub struct TagStore {
    storage: Storage,
    layout: Arc<Layout>,
    name: RepositoryName,
    trust: TrustPolicy,
}

impl TagStore {
    pub(crate) fn new(
        storage: Storage,
        layout: Arc<Layout>,
        name: RepositoryName,
        trust: TrustPolicy,
    ) -> Self {
        Self {
            storage,
            layout,
            name,
            trust,
        }
    }

    async fn classify(&self, descriptor: Descriptor) -> RegistryResult<TagLookup> {
        match self.trust {
            TrustPolicy::All => Ok(TagLookup::Trusted(descriptor)),
            TrustPolicy::VerifiedRevisions => {
                let revision = self
                    .layout
                    .link(&self.name, Links::Revisions, &descriptor.digest);
                if self.storage.exists(&revision).await? {
                    Ok(TagLookup::Trusted(descriptor))
                } else {
                    Ok(TagLookup::Untrusted(descriptor))
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl TagService for TagStore {
    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    async fn get(&self, tag: &str) -> RegistryResult<TagLookup> {
        check_tag(tag)?;
        let descriptor = read_link(&self.storage, &self.layout.tag_current(&self.name, tag))
            .await?
            .ok_or_else(|| RegistryError::TagUnknown(tag.to_string()))?;
        self.classify(descriptor).await
    }

    #[tracing::instrument(
        skip(self, descriptor),
        fields(repository = %self.name, digest = %descriptor.digest)
    )]
    async fn tag(&self, tag: &str, descriptor: &Descriptor) -> RegistryResult<()> {
        check_tag(tag)?;
        write_link(
            &self.storage,
            &self.layout.tag_current(&self.name, tag),
            descriptor,
        )
        .await
    }

    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    async fn untag(&self, tag: &str) -> RegistryResult<()> {
        check_tag(tag)?;
        match self.storage.delete(&self.layout.tag(&self.name, tag)).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn all(&self) -> RegistryResult<Vec<String>> {
        let children = match self.storage.list(&self.layout.tags(&self.name)).await {
            Ok(children) => children,
            Err(error) if error.is_not_found() => {
                return Err(RegistryError::RepositoryUnknown(self.name.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        Ok(children
            .iter()
            .filter_map(|child| child.file_name())
            .map(str::to_string)
            .collect())
    }

    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    async fn lookup(&self, digest: &Digest) -> RegistryResult<Vec<String>> {
        let tags = match self.all().await {
            Ok(tags) => tags,
            Err(RegistryError::RepositoryUnknown(_)) => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut matching = Vec::new();
        for tag in tags {
            // Tags removed while looking are skipped.
            let current = self.layout.tag_current(&self.name, &tag);
            if let Some(descriptor) = read_link(&self.storage, &current).await? {
                if &descriptor.digest == digest {
                    matching.push(tag);
                }
            }
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use storage::MemoryStorage;

    use super::*;

    fn tags(trust: TrustPolicy) -> TagStore {
        TagStore::new(
            Storage::new(MemoryStorage::new()),
            Arc::new(Layout::default()),
            RepositoryName::new("test/repo").unwrap(),
            trust,
        )
    }

    fn manifest(content: &[u8]) -> Descriptor {
        Descriptor::from_content("application/vnd.oci.image.manifest.v1+json", content)
    }

    #[tokio::test]
    async fn tag_overwrite_and_untag() {
        let tags = tags(TrustPolicy::All);
        let first = manifest(b"one");
        let second = manifest(b"two");

        tags.tag("latest", &first).await.unwrap();
        assert_eq!(tags.get("latest").await.unwrap(), TagLookup::Trusted(first));

        tags.tag("latest", &second).await.unwrap();
        assert_eq!(tags.get("latest").await.unwrap().into_descriptor(), second);

        tags.untag("latest").await.unwrap();
        assert!(matches!(
            tags.get("latest").await.unwrap_err(),
            RegistryError::TagUnknown(_)
        ));
        tags.untag("latest").await.unwrap();
    }

    #[tokio::test]
    async fn all_and_lookup() {
        let tags = tags(TrustPolicy::All);
        assert!(matches!(
            tags.all().await.unwrap_err(),
            RegistryError::RepositoryUnknown(_)
        ));

        let first = manifest(b"one");
        let second = manifest(b"two");
        for (tag, descriptor) in [("v1", &first), ("latest", &second), ("stable", &first)] {
            tags.tag(tag, descriptor).await.unwrap();
        }

        assert_eq!(tags.all().await.unwrap(), vec!["latest", "stable", "v1"]);
        assert_eq!(tags.lookup(&first.digest).await.unwrap(), vec!["stable", "v1"]);
        assert_eq!(tags.lookup(&second.digest).await.unwrap(), vec!["latest"]);
        assert!(tags.lookup(&manifest(b"three").digest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verified_revisions_policy() {
        let tags = tags(TrustPolicy::VerifiedRevisions);
        let descriptor = manifest(b"one");
        tags.tag("latest", &descriptor).await.unwrap();

        let lookup = tags.get("latest").await.unwrap();
        assert!(!lookup.is_trusted());
        assert_eq!(lookup.descriptor(), &descriptor);
        match lookup.into_trusted("latest") {
            Err(RegistryError::TagUntrusted { tag, descriptor: target }) => {
                assert_eq!(tag, "latest");
                assert_eq!(target, descriptor);
            }
            other => panic!("expected an untrusted tag, got {other:?}"),
        }

        let revision = tags
            .layout
            .link(&tags.name, Links::Revisions, &descriptor.digest);
        write_link(&tags.storage, &revision, &descriptor).await.unwrap();
        assert!(tags.get("latest").await.unwrap().is_trusted());
    }

    #[tokio::test]
    async fn invalid_tags_are_rejected() {
        let tags = tags(TrustPolicy::All);
        let descriptor = manifest(b"one");
        for tag in ["", "../escape", "a/b"] {
            assert!(matches!(
                tags.tag(tag, &descriptor).await.unwrap_err(),
                RegistryError::InvalidTag(_)
            ));
        }
    }
}
