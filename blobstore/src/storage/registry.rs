use std::sync::Arc;

use crate::error::StorageError;
use crate::storage::blob_store::BlobStore;
use crate::storage::driver::StorageDriver;
use crate::storage::linked_blob_store::{LinkKind, LinkedBlobStore};
use crate::utils::validation::is_valid_name;

#[derive(Clone, Copy, Debug, Default)]
pub struct RegistryOptions {
    /// Allows `LinkedBlobStore::delete`; otherwise it fails as unsupported.
    pub delete_enabled: bool,
    /// Persist digest checkpoints so resumed uploads can be validated.
    pub resumable_digest: bool,
}

/// Resolves repository names to repository handles over one shared blob store.
#[derive(Clone)]
pub struct Registry {
    blob_store: BlobStore,
    options: RegistryOptions,
}

impl Registry {
    pub fn new(driver: Arc<dyn StorageDriver>, options: RegistryOptions) -> Self {
        Registry {
            blob_store: BlobStore::new(driver),
            options,
        }
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        self.blob_store.driver()
    }

    pub fn options(&self) -> RegistryOptions {
        self.options
    }

    pub fn repository(&self, name: &str) -> Result<Repository, StorageError> {
        if !is_valid_name(name) {
            return Err(StorageError::NameInvalid(name.to_string()));
        }
        Ok(Repository {
            name: name.to_string(),
            registry: self.clone(),
        })
    }
}

#[derive(Clone)]
pub struct Repository {
    name: String,
    registry: Registry,
}

impl Repository {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Layer blobs, linked under `_layers`.
    pub fn blobs(&self) -> LinkedBlobStore {
        LinkedBlobStore::new(self.clone(), LinkKind::Layer)
    }

    /// Manifest payloads, linked under `_manifests/revisions`.
    pub fn manifest_blobs(&self) -> LinkedBlobStore {
        LinkedBlobStore::new(self.clone(), LinkKind::ManifestRevision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::driver::inmemory::InMemoryDriver;

    #[test]
    fn test_repository_name_is_validated() {
        let registry = Registry::new(Arc::new(InMemoryDriver::new()), RegistryOptions::default());
        assert_eq!(registry.repository("library/ubuntu").unwrap().name(), "library/ubuntu");
        assert!(matches!(
            registry.repository("Library"),
            Err(StorageError::NameInvalid(_))
        ));
        assert!(matches!(registry.repository(""), Err(StorageError::NameInvalid(_))));
    }
}
