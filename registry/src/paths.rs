//! Storage layout of the registry.
//!
//! ```text
//! <root>/blobs/<alg>/<hex[0..2]>/<hex>/data
//! <root>/repositories/<name>/_layers/<alg>/<hex>/link
//! <root>/repositories/<name>/_manifests/revisions/<alg>/<hex>/link
//! <root>/repositories/<name>/_manifests/tags/<tag>/current/link
//! <root>/repositories/<name>/_uploads/<id>/data
//! <root>/repositories/<name>/_uploads/<id>/startedat
//! ```

use camino::{Utf8Path, Utf8PathBuf};

use crate::digest::{Algorithm, Digest};
use crate::reference::RepositoryName;

/// Root directory used when none is configured.
pub const DEFAULT_ROOT: &str = "v2";

pub(crate) const LAYERS: &str = "_layers";
pub(crate) const MANIFESTS: &str = "_manifests";
pub(crate) const UPLOADS: &str = "_uploads";

/// Which link directory of a repository a linked blob store works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Links {
    Layers,
    Revisions,
}

/// Deterministic paths for every object the registry stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Layout {
    root: Utf8PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl Layout {
    pub(crate) fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn blobs(&self) -> Utf8PathBuf {
        self.root.join("blobs")
    }

    pub(crate) fn blob_data(&self, digest: &Digest) -> Utf8PathBuf {
        let hex = digest.hex();
        self.blobs()
            .join(digest.algorithm().as_str())
            .join(&hex[..2])
            .join(hex)
            .join("data")
    }

    pub(crate) fn repositories(&self) -> Utf8PathBuf {
        self.root.join("repositories")
    }

    pub(crate) fn repository(&self, name: &RepositoryName) -> Utf8PathBuf {
        self.repositories().join(name.as_str())
    }

    pub(crate) fn links(&self, name: &RepositoryName, links: Links) -> Utf8PathBuf {
        match links {
            Links::Layers => self.repository(name).join(LAYERS),
            Links::Revisions => self.repository(name).join(MANIFESTS).join("revisions"),
        }
    }

    /// The directory holding one link. Deleting it removes the link.
    pub(crate) fn link_dir(
        &self,
        name: &RepositoryName,
        links: Links,
        digest: &Digest,
    ) -> Utf8PathBuf {
        self.links(name, links)
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    pub(crate) fn link(&self, name: &RepositoryName, links: Links, digest: &Digest) -> Utf8PathBuf {
        self.link_dir(name, links, digest).join("link")
    }

    pub(crate) fn tags(&self, name: &RepositoryName) -> Utf8PathBuf {
        self.repository(name).join(MANIFESTS).join("tags")
    }

    pub(crate) fn tag(&self, name: &RepositoryName, tag: &str) -> Utf8PathBuf {
        self.tags(name).join(tag)
    }

    pub(crate) fn tag_current(&self, name: &RepositoryName, tag: &str) -> Utf8PathBuf {
        self.tag(name, tag).join("current").join("link")
    }

    pub(crate) fn upload(&self, name: &RepositoryName, id: &str) -> Utf8PathBuf {
        self.repository(name).join(UPLOADS).join(id)
    }

    pub(crate) fn upload_data(&self, name: &RepositoryName, id: &str) -> Utf8PathBuf {
        self.upload(name, id).join("data")
    }

    pub(crate) fn upload_started_at(&self, name: &RepositoryName, id: &str) -> Utf8PathBuf {
        self.upload(name, id).join("startedat")
    }
}

/// Recover a digest from the `<alg>/<hex>` pair of directories a path ends in,
/// ignoring `trailing` components after them.
pub(crate) fn digest_from_path(path: &Utf8Path, trailing: usize) -> Option<Digest> {
    let mut components = path.components().rev().skip(trailing);
    let hex = components.next()?.as_str();
    let mut algorithm = components.next()?.as_str();

    // Blob data sits below a two character fan-out directory.
    if algorithm.len() == 2 && hex.starts_with(algorithm) {
        algorithm = components.next()?.as_str();
    }

    let algorithm: Algorithm = algorithm.parse().ok()?;
    format!("{algorithm}:{hex}").parse().ok()
}
