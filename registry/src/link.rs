use camino::Utf8Path;
use storage::Storage;

use crate::descriptor::Descriptor;
use crate::error::{RegistryError, RegistryResult};

/// Read the descriptor stored in a link file, or `None` if there is no link.
pub(crate) async fn read_link(
    storage: &Storage,
    path: &Utf8Path,
) -> RegistryResult<Option<Descriptor>> {
    let content = match storage.get_content(path).await {
        Ok(content) => content,
        Err(error) if error.is_not_found() => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| RegistryError::InvalidLink {
            path: path.to_owned(),
            source,
        })
}

/// Point a link file at a descriptor, replacing any previous target.
pub(crate) async fn write_link(
    storage: &Storage,
    path: &Utf8Path,
    descriptor: &Descriptor,
) -> RegistryResult<()> {
    let content = serde_json::to_vec(descriptor).map_err(|source| RegistryError::InvalidLink {
        path: path.to_owned(),
        source,
    })?;
    tracing::trace!(%path, digest = %descriptor.digest, "Writing link");
    storage.put_content(path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    #[tokio::test]
    async fn links_hold_descriptors() {
        let storage = Storage::new(MemoryStorage::new());
        let path = Utf8Path::new("v2/repositories/r/_layers/sha256/ab/link");
        assert!(read_link(&storage, path).await.unwrap().is_none());

        let descriptor = Descriptor::from_content("application/octet-stream", b"hello");
        write_link(&storage, path, &descriptor).await.unwrap();
        assert_eq!(read_link(&storage, path).await.unwrap(), Some(descriptor));
    }

    #[tokio::test]
    async fn corrupt_link_is_an_integrity_error() {
        let storage = Storage::new(MemoryStorage::new());
        let path = Utf8Path::new("link");
        storage.put_content(path, &b"sha256:not-json"[..]).await.unwrap();

        let err = read_link(&storage, path).await.unwrap_err();
        assert!(err.is_integrity_error());
    }
}
