//! Registry configuration and construction

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;
use storage::{Storage, StorageConfig};

use crate::error::{RegistryError, RegistryResult};
use crate::namespace::{GlobalScope, PrefixScope, Registry, Scope};
use crate::paths::{DEFAULT_ROOT, Layout};
use crate::reference::RepositoryName;
use crate::tag::TrustPolicy;

fn default_root() -> Utf8PathBuf {
    DEFAULT_ROOT.into()
}

/// Registry configuration, usually deserialized from the service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Storage backend.
    pub storage: StorageConfig,

    /// Directory, within the storage, holding the registry.
    #[serde(default = "default_root")]
    pub root: Utf8PathBuf,

    /// Allow deleting blobs, manifests and repositories.
    #[serde(default)]
    pub delete_enabled: bool,

    /// How tag lookups decide trust.
    #[serde(default)]
    pub trust: TrustPolicy,

    /// Restrict the namespace to repositories at or below this name.
    #[serde(default)]
    pub scope: Option<String>,
}

impl RegistryConfig {
    /// Construct the configured registry.
    pub fn build(self) -> RegistryResult<Registry> {
        let mut builder = RegistryBuilder::new()
            .storage(self.storage.build()?)
            .root(self.root)
            .delete_enabled(self.delete_enabled)
            .trust(self.trust);

        if let Some(prefix) = self.scope {
            builder = builder.scope(PrefixScope::new(RepositoryName::new(prefix)?));
        }

        builder.build()
    }
}

/// Registry builder for configuring and creating a [`Registry`]
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    root: Option<Utf8PathBuf>,
    delete_enabled: bool,
    trust: TrustPolicy,
    scope: Option<Arc<dyn Scope>>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the root directory within the storage. Defaults to `v2`.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Allow deletes
    pub fn delete_enabled(mut self, enabled: bool) -> Self {
        self.delete_enabled = enabled;
        self
    }

    /// Set the tag trust policy
    pub fn trust(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// Restrict the namespace to a scope. Defaults to [`GlobalScope`].
    pub fn scope(mut self, scope: impl Scope + 'static) -> Self {
        self.scope = Some(Arc::new(scope));
        self
    }

    /// Build the registry
    pub fn build(self) -> RegistryResult<Registry> {
        let storage = self.storage.ok_or_else(|| {
            RegistryError::InvalidRequest("storage backend must be configured".into())
        })?;
        let root = self.root.unwrap_or_else(default_root);
        storage::check_path(storage.name(), &root)?;

        tracing::debug!(driver = storage.name(), %root, "Building registry");
        Ok(Registry::new(
            storage,
            Layout::new(root),
            self.scope.unwrap_or_else(|| Arc::new(GlobalScope)),
            self.delete_enabled,
            self.trust,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;

    #[test]
    fn deserialize_defaults() {
        let config: RegistryConfig = serde_json::from_str(r#"{"storage": "memory"}"#).unwrap();
        assert_eq!(config.root, "v2");
        assert!(!config.delete_enabled);
        assert_eq!(config.trust, TrustPolicy::All);
        assert!(config.scope.is_none());
    }

    #[test]
    fn deserialize_everything() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{
                "storage": {"local": {"path": "/var/lib/registry"}},
                "root": "docker/registry/v2",
                "delete-enabled": true,
                "trust": "verified-revisions",
                "scope": "library"
            }"#,
        )
        .unwrap();
        assert_eq!(config.root, "docker/registry/v2");
        assert!(config.delete_enabled);
        assert_eq!(config.trust, TrustPolicy::VerifiedRevisions);
        assert_eq!(config.scope.as_deref(), Some("library"));
    }

    #[test]
    fn build_from_config() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{"storage": "memory", "scope": "library", "delete-enabled": true}"#,
        )
        .unwrap();
        let registry = config.build().unwrap();
        assert!(registry.delete_enabled());
        assert!(registry.repository("library/ubuntu").is_ok());
        assert!(matches!(
            registry.repository("ubuntu").unwrap_err(),
            RegistryError::NameOutOfScope(_)
        ));

        let config: RegistryConfig =
            serde_json::from_str(r#"{"storage": "memory", "scope": "Not/Valid"}"#).unwrap();
        assert!(matches!(
            config.build().unwrap_err(),
            RegistryError::InvalidRepository(_)
        ));
    }

    #[test]
    fn builder_requires_storage_and_a_valid_root() {
        assert!(matches!(
            RegistryBuilder::new().build().unwrap_err(),
            RegistryError::InvalidRequest(_)
        ));

        let err = RegistryBuilder::new()
            .storage(Storage::new(storage::MemoryStorage::new()))
            .root("/absolute")
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
    }
}
