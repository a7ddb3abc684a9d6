//! # Container registry storage
//!
//! The content layer of an OCI container registry, built on the [`storage`]
//! crate: content-addressed blobs and manifests, mutable tags, and the
//! namespace that ties repositories together.
//!
//! ## Features
//!
//! - Digest verified reads, deduplicated writes
//! - Chunked, resumable blob uploads with cross-repository mounts
//! - Tags with an explicit trust classification
//! - Paginated repository listing
//! - Pluggable storage backend via the `storage` crate
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use registry::{BlobStore, Namespace, Repository, RegistryBuilder};
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), registry::RegistryError> {
//! let registry = RegistryBuilder::new()
//!     .storage(MemoryStorage::new().into())
//!     .build()?;
//!
//! let repository = registry.repository("library/hello")?;
//! let descriptor = repository
//!     .blobs()
//!     .put("application/octet-stream", Bytes::from_static(b"hello"))
//!     .await?;
//! assert_eq!(descriptor.size, 5);
//! # Ok(())
//! # }
//! ```

mod blob;
mod config;
mod descriptor;
mod digest;
mod error;
mod link;
mod manifest;
mod namespace;
mod paths;
mod reference;
mod repository;
mod tag;
mod upload;

pub use blob::{
    BlobEnumerator, BlobStatter, BlobStore, BlobVisitor, GlobalBlobStore, LinkedBlobStore,
};
pub use config::{RegistryBuilder, RegistryConfig};
pub use descriptor::{Descriptor, OCTET_STREAM};
pub use digest::{Algorithm, Digest, Digester};
pub use error::{RegistryError, RegistryResult};
pub use manifest::{
    DOCKER_MANIFEST_LIST, DOCKER_MANIFEST_V1, DOCKER_MANIFEST_V1_SIGNED, DOCKER_MANIFEST_V2,
    MANIFEST_MEDIA_TYPES, Manifest, ManifestOptions, ManifestService, ManifestStore, OCI_INDEX,
    OCI_MANIFEST, detect_manifest_type, validate_manifest_type,
};
pub use namespace::{
    GlobalScope, Namespace, PrefixScope, Registry, RepositoryEnumerator, RepositoryRemover,
    RepositoryVisitor, Scope,
};
pub use paths::DEFAULT_ROOT;
pub use reference::{RepositoryName, check_tag};
pub use repository::{Repository, StoredRepository};
pub use tag::{TagLookup, TagService, TagStore, TrustPolicy};
pub use upload::BlobUpload;
