//! Error types for the registry

use camino::Utf8PathBuf;
use storage::{StorageError, StorageErrorKind};

use crate::descriptor::Descriptor;
use crate::digest::Digest;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found in this repository (or in the namespace, for global stores)
    #[error("blob unknown: {0}")]
    BlobUnknown(Digest),

    /// Manifest revision not found
    #[error("manifest unknown: {0}")]
    ManifestUnknown(Digest),

    /// Tag not found
    #[error("tag unknown: {0}")]
    TagUnknown(String),

    /// Repository has nothing stored for the requested data
    #[error("repository unknown: {0}")]
    RepositoryUnknown(String),

    /// Upload session not found
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// Tag resolved, but its association is not trusted
    #[error("tag {tag} is not trusted (points at {})", descriptor.digest)]
    TagUntrusted {
        /// Tag name
        tag: String,
        /// The descriptor the tag points at
        descriptor: Descriptor,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Reading caller supplied content failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A link file could not be decoded
    #[error("invalid link at {path}: {source}")]
    InvalidLink {
        /// Path of the link file
        path: Utf8PathBuf,
        /// Decoding error
        #[source]
        source: serde_json::Error,
    },

    /// Enumeration is exhausted
    #[error("end of sequence after {filled} entries")]
    EndOfSequence {
        /// How many entries were written before the sequence ended
        filled: usize,
    },

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Repository name is outside the namespace scope
    #[error("repository name out of scope: {0}")]
    NameOutOfScope(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Stored manifest media type was not among those accepted by the caller
    #[error("manifest media type not acceptable: {0}")]
    ManifestNotAcceptable(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation disabled by configuration
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl RegistryError {
    /// Whether this error means the requested object is absent.
    ///
    /// Storage errors count when the driver reported a missing path.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::TagUnknown(_)
            | RegistryError::RepositoryUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => true,
            RegistryError::Storage(error) => error.is_not_found(),
            _ => false,
        }
    }

    /// Whether stored content failed verification. Such content must not be served.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            RegistryError::DigestMismatch { .. } | RegistryError::InvalidLink { .. }
        )
    }

    /// Whether this is the end-of-sequence signal from a paginated listing.
    pub fn is_end_of_sequence(&self) -> bool {
        matches!(self, RegistryError::EndOfSequence { .. })
    }

    /// Whether this is a use of a writer after it was committed or cancelled.
    pub fn is_already_finished(&self) -> bool {
        matches!(
            self,
            RegistryError::Storage(error) if error.kind() == StorageErrorKind::AlreadyFinished
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let digest = Digest::from_bytes(b"hello");
        assert!(RegistryError::BlobUnknown(digest.clone()).is_not_found());
        assert!(RegistryError::Storage(StorageError::not_found("memory", "a/b")).is_not_found());

        let mismatch = RegistryError::DigestMismatch {
            expected: digest.clone(),
            actual: Digest::from_bytes(b"world"),
        };
        assert!(mismatch.is_integrity_error());
        assert!(!mismatch.is_not_found());

        let finished = RegistryError::Storage(StorageError::new(
            "memory",
            StorageErrorKind::AlreadyFinished,
            "writer already committed",
        ));
        assert!(finished.is_already_finished());
        assert!(!finished.is_not_found());
    }
}
