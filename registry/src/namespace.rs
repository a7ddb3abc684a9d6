//! Namespaces: collections of repositories under a common scope

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use storage::{Storage, WalkControl};

use crate::blob::{BlobEnumerator, BlobStatter, GlobalBlobStore};
use crate::error::{RegistryError, RegistryResult};
use crate::paths::{LAYERS, Layout, MANIFESTS, UPLOADS};
use crate::reference::RepositoryName;
use crate::repository::{Repository, StoredRepository};
use crate::tag::TrustPolicy;
use crate::upload::parse_started_at;

/// A predicate over repository names.
pub trait Scope: fmt::Debug + Send + Sync {
    /// Whether `name` belongs to this scope.
    fn contains(&self, name: &RepositoryName) -> bool;
}

/// The scope containing every repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalScope;

impl Scope for GlobalScope {
    fn contains(&self, _name: &RepositoryName) -> bool {
        true
    }
}

/// Repositories named `prefix` or nested below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixScope {
    prefix: RepositoryName,
}

impl PrefixScope {
    /// The scope of everything at or below `prefix`.
    pub fn new(prefix: RepositoryName) -> Self {
        Self { prefix }
    }

    /// The prefix.
    pub fn prefix(&self) -> &RepositoryName {
        &self.prefix
    }
}

impl Scope for PrefixScope {
    fn contains(&self, name: &RepositoryName) -> bool {
        name.starts_with(&self.prefix)
    }
}

/// A collection of repositories.
#[async_trait::async_trait]
pub trait Namespace: Send + Sync {
    /// Repository handle type.
    type Repository: Repository;

    /// The scope of this namespace, fixed for its lifetime.
    fn scope(&self) -> &dyn Scope;

    /// A handle for the named repository. Nothing is read from storage, so a
    /// handle is returned for every valid name in scope.
    fn repository(&self, name: &str) -> RegistryResult<Self::Repository>;

    /// Fill `buffer` with repository names sorting after `last`, in lexicographic
    /// order, returning how many were written.
    ///
    /// When no names remain after those written, this fails with
    /// [`RegistryError::EndOfSequence`] carrying the count instead.
    async fn repositories(
        &self,
        buffer: &mut [String],
        last: Option<&str>,
    ) -> RegistryResult<usize>;

    /// Enumerates every blob in the namespace.
    fn blobs(&self) -> &dyn BlobEnumerator;

    /// Describes any blob in the namespace.
    fn blob_statter(&self) -> &dyn BlobStatter;
}

/// Visitor for [`RepositoryEnumerator::enumerate`]. Returning an error stops the enumeration.
pub type RepositoryVisitor<'a> = dyn FnMut(&RepositoryName) -> RegistryResult<()> + Send + 'a;

/// Visits every repository of a namespace.
#[async_trait::async_trait]
pub trait RepositoryEnumerator: Send + Sync {
    /// Visit each repository holding manifests, in storage walk order.
    async fn enumerate(&self, visit: &mut RepositoryVisitor<'_>) -> RegistryResult<()>;
}

/// Removes whole repositories.
#[async_trait::async_trait]
pub trait RepositoryRemover: Send + Sync {
    /// Remove the layers, manifests, tags and uploads of a repository.
    /// Repositories nested below it are left alone.
    async fn remove(&self, name: &str) -> RegistryResult<()>;
}

/// The registry namespace, backed by a [`Storage`].
#[derive(Debug, Clone)]
pub struct Registry {
    storage: Storage,
    layout: Arc<Layout>,
    scope: Arc<dyn Scope>,
    delete_enabled: bool,
    trust: TrustPolicy,
    blobs: GlobalBlobStore,
}

impl Registry {
    pub(crate) fn new(
        storage: Storage,
        layout: Layout,
        scope: Arc<dyn Scope>,
        delete_enabled: bool,
        trust: TrustPolicy,
    ) -> Self {
        let layout = Arc::new(layout);
        let blobs = GlobalBlobStore::new(storage.clone(), layout.clone());
        Self {
            storage,
            layout,
            scope,
            delete_enabled,
            trust,
            blobs,
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Whether deletes are allowed.
    pub fn delete_enabled(&self) -> bool {
        self.delete_enabled
    }

    /// How tag lookups decide trust.
    pub fn trust(&self) -> TrustPolicy {
        self.trust
    }

    /// Remove upload sessions started before `older_than`, returning how many
    /// were removed.
    ///
    /// A session whose start time is missing or unreadable can never be
    /// resumed, so it is removed regardless of age.
    #[tracing::instrument(skip(self))]
    pub async fn purge_uploads(&self, older_than: DateTime<Utc>) -> RegistryResult<usize> {
        let root = self.layout.repositories();
        if !self.storage.exists(&root).await? {
            return Ok(0);
        }

        let mut repositories = Vec::new();
        self.storage
            .walk(&root, |metadata| {
                if !metadata.is_dir {
                    return Ok(WalkControl::Continue);
                }
                match metadata.path.file_name() {
                    Some(UPLOADS) => {
                        let name = metadata
                            .path
                            .parent()
                            .and_then(|repository| repository.strip_prefix(&root).ok())
                            .and_then(|repository| RepositoryName::new(repository.as_str()).ok());
                        if let Some(name) = name.filter(|name| self.scope.contains(name)) {
                            repositories.push((name, metadata.path.clone()));
                        }
                        Ok(WalkControl::SkipDir)
                    }
                    Some(name) if name.starts_with('_') => Ok(WalkControl::SkipDir),
                    _ => Ok::<_, RegistryError>(WalkControl::Continue),
                }
            })
            .await?;

        let mut purged = 0;
        for (name, uploads) in repositories {
            for session in self.list_or_empty(&uploads).await? {
                let Some(id) = session.file_name() else {
                    continue;
                };

                let started_at = match self
                    .storage
                    .get_content(&self.layout.upload_started_at(&name, id))
                    .await
                {
                    Ok(content) => parse_started_at(&content),
                    Err(error) if error.is_not_found() => None,
                    Err(error) => return Err(error.into()),
                };
                if started_at.is_some_and(|started_at| started_at >= older_than) {
                    continue;
                }

                match self.storage.delete(&self.layout.upload(&name, id)).await {
                    Ok(()) => {
                        tracing::debug!(%name, %id, ?started_at, "Purged upload");
                        purged += 1;
                    }
                    Err(error) if error.is_not_found() => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(purged)
    }

    async fn list_or_empty(&self, path: &Utf8Path) -> RegistryResult<Vec<Utf8PathBuf>> {
        match self.storage.list(path).await {
            Ok(children) => Ok(children),
            Err(error) if error.is_not_found() => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn in_scope(&self, name: &str) -> RegistryResult<RepositoryName> {
        let name = RepositoryName::new(name)?;
        if !self.scope.contains(&name) {
            return Err(RegistryError::NameOutOfScope(name.to_string()));
        }
        Ok(name)
    }
}

#[async_trait::async_trait]
impl Namespace for Registry {
    type Repository = StoredRepository;

    fn scope(&self) -> &dyn Scope {
        self.scope.as_ref()
    }

    fn repository(&self, name: &str) -> RegistryResult<StoredRepository> {
        let name = self.in_scope(name)?;
        Ok(StoredRepository::new(
            name,
            self.storage.clone(),
            self.layout.clone(),
            self.delete_enabled,
            self.trust,
        ))
    }

    #[tracing::instrument(skip(self, buffer), fields(len = buffer.len()))]
    async fn repositories(
        &self,
        buffer: &mut [String],
        last: Option<&str>,
    ) -> RegistryResult<usize> {
        if buffer.is_empty() {
            return Err(RegistryError::InvalidRequest(
                "repository listing needs a non-empty buffer".into(),
            ));
        }

        // The walk visits `a/b` before `a-b`, so names are sorted afterwards.
        let mut names = Vec::new();
        self.enumerate(&mut |name| {
            if last.is_none_or(|last| name.as_str() > last) {
                names.push(name.to_string());
            }
            Ok(())
        })
        .await?;
        names.sort();

        let filled = names.len().min(buffer.len());
        for (slot, name) in buffer.iter_mut().zip(names.drain(..filled)) {
            *slot = name;
        }

        if names.is_empty() {
            Err(RegistryError::EndOfSequence { filled })
        } else {
            Ok(filled)
        }
    }

    fn blobs(&self) -> &dyn BlobEnumerator {
        &self.blobs
    }

    fn blob_statter(&self) -> &dyn BlobStatter {
        &self.blobs
    }
}

#[async_trait::async_trait]
impl RepositoryEnumerator for Registry {
    async fn enumerate(&self, visit: &mut RepositoryVisitor<'_>) -> RegistryResult<()> {
        let root = self.layout.repositories();
        if !self.storage.exists(&root).await? {
            return Ok(());
        }

        self.storage
            .walk(&root, |metadata| {
                let Some(file_name) = metadata.path.file_name() else {
                    return Ok(WalkControl::SkipDir);
                };
                if !metadata.is_dir || !file_name.starts_with('_') {
                    return Ok(WalkControl::Continue);
                }

                if file_name == MANIFESTS {
                    let name = metadata
                        .path
                        .parent()
                        .and_then(|repository| repository.strip_prefix(&root).ok())
                        .and_then(|repository| RepositoryName::new(repository.as_str()).ok());
                    match name {
                        Some(name) if self.scope.contains(&name) => visit(&name)?,
                        Some(_) => {}
                        None => {
                            let path = &metadata.path;
                            tracing::debug!(%path, "Skipping unrecognized repository");
                        }
                    }
                }
                Ok::<_, RegistryError>(WalkControl::SkipDir)
            })
            .await
    }
}

#[async_trait::async_trait]
impl RepositoryRemover for Registry {
    #[tracing::instrument(skip(self))]
    async fn remove(&self, name: &str) -> RegistryResult<()> {
        if !self.delete_enabled {
            return Err(RegistryError::Unsupported("delete is disabled"));
        }
        let name = self.in_scope(name)?;
        let repository = self.layout.repository(&name);

        let mut removed = false;
        for directory in [LAYERS, MANIFESTS, UPLOADS] {
            match self.storage.delete(&repository.join(directory)).await {
                Ok(()) => removed = true,
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        if !removed {
            return Err(RegistryError::RepositoryUnknown(name.to_string()));
        }
        tracing::debug!(%name, "Removed repository");
        Ok(())
    }
}
