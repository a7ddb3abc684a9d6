use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Media type recorded for blobs whose type the caller did not state.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Identifies a piece of content: its digest, media type and size.
///
/// The digest is the identity; descriptors are only ever built from content
/// that was hashed, or read back from a link written that way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Content address.
    pub digest: Digest,

    /// Media type of the content.
    pub media_type: String,

    /// Size of the content in bytes.
    pub size: u64,
}

impl Descriptor {
    /// Describe `content` by hashing it with the canonical algorithm.
    pub fn from_content(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self {
            digest: Digest::from_bytes(content),
            media_type: media_type.into(),
            size: content.len() as u64,
        }
    }
}
