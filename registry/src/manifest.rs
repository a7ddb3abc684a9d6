//! Manifest storage for the registry

use bytes::Bytes;

use crate::blob::{BlobStatter, BlobStore, LinkedBlobStore};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::reference::check_tag;
use crate::tag::{TagService, TagStore};

/// Docker image manifest, schema 1.
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Signed Docker image manifest, schema 1.
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list, schema 2.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Manifest media types the registry accepts.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    DOCKER_MANIFEST_V1,
    DOCKER_MANIFEST_V1_SIGNED,
    DOCKER_MANIFEST_V2,
    DOCKER_MANIFEST_LIST,
    OCI_MANIFEST,
    OCI_INDEX,
];

/// Detect the media type of a manifest from its JSON payload.
///
/// An explicit `mediaType` wins; otherwise the `schemaVersion` and the presence
/// of a `manifests` list decide. Anything unrecognized is taken as an OCI manifest.
pub fn detect_manifest_type(payload: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }

        match json.get("schemaVersion").and_then(|v| v.as_u64()) {
            Some(1) if json.get("signatures").is_some() => {
                return DOCKER_MANIFEST_V1_SIGNED.to_string();
            }
            Some(1) => return DOCKER_MANIFEST_V1.to_string(),
            Some(2) if json.get("manifests").is_some() => return DOCKER_MANIFEST_LIST.to_string(),
            Some(2) => return DOCKER_MANIFEST_V2.to_string(),
            _ => {}
        }
    }

    OCI_MANIFEST.to_string()
}

/// Check that a media type names a supported manifest format.
pub fn validate_manifest_type(media_type: &str) -> RegistryResult<()> {
    if MANIFEST_MEDIA_TYPES.contains(&media_type) {
        Ok(())
    } else {
        Err(RegistryError::UnsupportedManifestType(media_type.to_string()))
    }
}

/// A manifest: an opaque payload and its media type.
///
/// Payloads are stored byte for byte; the digest of a manifest is the digest of
/// its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    media_type: String,
    payload: Bytes,
}

impl Manifest {
    /// A manifest with an explicit media type.
    pub fn new(media_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            media_type: media_type.into(),
            payload: payload.into(),
        }
    }

    /// A manifest whose media type is detected from the payload.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            media_type: detect_manifest_type(&payload),
            payload,
        }
    }

    /// The media type.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The canonical digest of the payload.
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&self.payload)
    }
}

/// Options applied by a manifest service to every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestOptions {
    /// Tag each successfully stored manifest with this name.
    pub tag: Option<String>,

    /// Only serve manifests stored with one of these media types.
    pub media_types: Option<Vec<String>>,
}

impl ManifestOptions {
    /// Tag every stored manifest.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Restrict the media types served by `get`.
    pub fn with_media_types<I, S>(mut self, media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media_types = Some(media_types.into_iter().map(Into::into).collect());
        self
    }

    fn accepts(&self, media_type: &str) -> bool {
        self.media_types
            .as_ref()
            .is_none_or(|accepted| accepted.iter().any(|m| m == media_type))
    }
}

/// Manifest operations for one repository.
#[async_trait::async_trait]
pub trait ManifestService: Send + Sync {
    /// Whether a manifest revision is stored.
    async fn exists(&self, digest: &Digest) -> RegistryResult<bool>;

    /// Fetch a manifest, verified against its digest.
    async fn get(&self, digest: &Digest) -> RegistryResult<Manifest>;

    /// Store a manifest, returning its digest.
    async fn put(&self, manifest: &Manifest) -> RegistryResult<Digest>;

    /// Delete a manifest revision and every tag pointing at it.
    async fn delete(&self, digest: &Digest) -> RegistryResult<()>;
}

/// Manifests stored as revision links over the shared blob content.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    revisions: LinkedBlobStore,
    tags: TagStore,
    options: ManifestOptions,
    delete_enabled: bool,
}

fn unknown_manifest(error: RegistryError) -> RegistryError {
    match error {
        RegistryError::BlobUnknown(digest) => RegistryError::ManifestUnknown(digest),
        error => error,
    }
}

impl ManifestStore {
    pub(crate) fn new(
        revisions: LinkedBlobStore,
        tags: TagStore,
        options: ManifestOptions,
        delete_enabled: bool,
    ) -> RegistryResult<Self> {
        if let Some(tag) = &options.tag {
            check_tag(tag)?;
        }
        Ok(Self {
            revisions,
            tags,
            options,
            delete_enabled,
        })
    }

    /// The options this service applies.
    pub fn options(&self) -> &ManifestOptions {
        &self.options
    }
}

#[async_trait::async_trait]
impl ManifestService for ManifestStore {
    async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        match self.revisions.stat(digest).await {
            Ok(_) => Ok(true),
            Err(RegistryError::BlobUnknown(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    #[tracing::instrument(skip_all, fields(repository = %self.revisions.name(), %digest))]
    async fn get(&self, digest: &Digest) -> RegistryResult<Manifest> {
        let descriptor = self.revisions.stat(digest).await.map_err(unknown_manifest)?;
        if !self.options.accepts(&descriptor.media_type) {
            return Err(RegistryError::ManifestNotAcceptable(descriptor.media_type));
        }

        let payload = self.revisions.get(digest).await.map_err(unknown_manifest)?;
        Ok(Manifest {
            media_type: descriptor.media_type,
            payload,
        })
    }

    #[tracing::instrument(
        skip_all,
        fields(repository = %self.revisions.name(), media_type = manifest.media_type())
    )]
    async fn put(&self, manifest: &Manifest) -> RegistryResult<Digest> {
        validate_manifest_type(manifest.media_type())?;

        let descriptor = self
            .revisions
            .put(manifest.media_type(), manifest.payload().clone())
            .await?;

        if let Some(tag) = &self.options.tag {
            self.tags.tag(tag, &descriptor).await?;
        }

        tracing::debug!(digest = %descriptor.digest, "Stored manifest");
        Ok(descriptor.digest)
    }

    #[tracing::instrument(skip_all, fields(repository = %self.revisions.name(), %digest))]
    async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        if !self.delete_enabled {
            return Err(RegistryError::Unsupported("delete is disabled"));
        }

        self.revisions.stat(digest).await.map_err(unknown_manifest)?;
        for tag in self.tags.lookup(digest).await? {
            tracing::debug!(%tag, "Untagging deleted manifest");
            self.tags.untag(&tag).await?;
        }

        BlobStore::delete(&self.revisions, digest)
            .await
            .map_err(unknown_manifest)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::paths::{Layout, Links};
    use crate::reference::RepositoryName;
    use crate::tag::TrustPolicy;

    const OCI_PAYLOAD: &[u8] =
        br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#;

    fn manifests(options: ManifestOptions, delete_enabled: bool) -> ManifestStore {
        let storage = Storage::new(MemoryStorage::new());
        let layout = Arc::new(Layout::default());
        let name = RepositoryName::new("test/repo").unwrap();
        ManifestStore::new(
            LinkedBlobStore::new(
                storage.clone(),
                layout.clone(),
                name.clone(),
                Links::Revisions,
                delete_enabled,
            ),
            TagStore::new(storage, layout, name, TrustPolicy::All),
            options,
            delete_enabled,
        )
        .unwrap()
    }

    #[test]
    fn detects_media_types() {
        assert_eq!(detect_manifest_type(OCI_PAYLOAD), OCI_MANIFEST);
        assert_eq!(
            detect_manifest_type(br#"{"schemaVersion":2,"manifests":[]}"#),
            DOCKER_MANIFEST_LIST
        );
        assert_eq!(detect_manifest_type(br#"{"schemaVersion":2}"#), DOCKER_MANIFEST_V2);
        assert_eq!(detect_manifest_type(br#"{"schemaVersion":1}"#), DOCKER_MANIFEST_V1);
        assert_eq!(
            detect_manifest_type(br#"{"schemaVersion":1,"signatures":[]}"#),
            DOCKER_MANIFEST_V1_SIGNED
        );
        assert_eq!(detect_manifest_type(b"not json"), OCI_MANIFEST);
    }

    #[test]
    fn validates_media_types() {
        for media_type in MANIFEST_MEDIA_TYPES {
            assert!(validate_manifest_type(media_type).is_ok());
        }
        assert!(matches!(
            validate_manifest_type("text/plain"),
            Err(RegistryError::UnsupportedManifestType(_))
        ));
    }

    #[tokio::test]
    async fn put_get_with_tag() {
        let manifests = manifests(ManifestOptions::default().with_tag("latest"), false);
        let manifest = Manifest::from_payload(OCI_PAYLOAD);

        let digest = manifests.put(&manifest).await.unwrap();
        assert_eq!(digest, manifest.digest());
        assert!(manifests.exists(&digest).await.unwrap());
        assert_eq!(manifests.get(&digest).await.unwrap(), manifest);

        let lookup = manifests.tags.get("latest").await.unwrap();
        assert_eq!(lookup.descriptor().digest, digest);
    }

    #[tokio::test]
    async fn media_type_negotiation() {
        let manifests = manifests(
            ManifestOptions::default().with_media_types([DOCKER_MANIFEST_V2]),
            false,
        );
        let digest = manifests.put(&Manifest::from_payload(OCI_PAYLOAD)).await.unwrap();

        assert!(matches!(
            manifests.get(&digest).await.unwrap_err(),
            RegistryError::ManifestNotAcceptable(media_type) if media_type == OCI_MANIFEST
        ));
    }

    #[tokio::test]
    async fn unsupported_types_are_not_stored() {
        let manifests = manifests(ManifestOptions::default(), false);
        let manifest = Manifest::new("text/plain", &b"hello"[..]);

        assert!(matches!(
            manifests.put(&manifest).await.unwrap_err(),
            RegistryError::UnsupportedManifestType(_)
        ));
        assert!(!manifests.exists(&manifest.digest()).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_manifest() {
        let manifests = manifests(ManifestOptions::default(), true);
        let digest = Digest::from_bytes(b"missing");

        assert!(!manifests.exists(&digest).await.unwrap());
        assert!(matches!(
            manifests.get(&digest).await.unwrap_err(),
            RegistryError::ManifestUnknown(_)
        ));
        assert!(matches!(
            manifests.delete(&digest).await.unwrap_err(),
            RegistryError::ManifestUnknown(_)
        ));
    }

    #[tokio::test]
    async fn delete_untags() {
        let manifests = manifests(ManifestOptions::default(), true);
        let manifest = Manifest::from_payload(OCI_PAYLOAD);
        let digest = manifests.put(&manifest).await.unwrap();
        let other = manifests
            .put(&Manifest::from_payload(&br#"{"schemaVersion":2}"#[..]))
            .await
            .unwrap();

        let descriptor = manifests.revisions.stat(&digest).await.unwrap();
        let unrelated = manifests.revisions.stat(&other).await.unwrap();
        manifests.tags.tag("latest", &descriptor).await.unwrap();
        manifests.tags.tag("v1", &descriptor).await.unwrap();
        manifests.tags.tag("other", &unrelated).await.unwrap();

        manifests.delete(&digest).await.unwrap();
        assert!(!manifests.exists(&digest).await.unwrap());
        assert_eq!(manifests.tags.all().await.unwrap(), vec!["other"]);
    }

    #[tokio::test]
    async fn delete_can_be_disabled() {
        let manifests = manifests(ManifestOptions::default(), false);
        let digest = manifests.put(&Manifest::from_payload(OCI_PAYLOAD)).await.unwrap();

        assert!(matches!(
            manifests.delete(&digest).await.unwrap_err(),
            RegistryError::Unsupported(_)
        ));
        assert!(manifests.exists(&digest).await.unwrap());
    }

    #[test]
    fn options_validate_tag() {
        let storage = Storage::new(MemoryStorage::new());
        let layout = Arc::new(Layout::default());
        let name = RepositoryName::new("test/repo").unwrap();
        let result = ManifestStore::new(
            LinkedBlobStore::new(
                storage.clone(),
                layout.clone(),
                name.clone(),
                Links::Revisions,
                false,
            ),
            TagStore::new(storage, layout, name, TrustPolicy::All),
            ManifestOptions::default().with_tag("not/a/tag"),
            false,
        );
        assert!(matches!(result, Err(RegistryError::InvalidTag(_))));
    }
}
