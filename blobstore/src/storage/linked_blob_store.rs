use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Response};
use chrono::Utc;
use oci_spec::image::Digest;
use tracing::{debug, error, warn};

use crate::error::StorageError;
use crate::storage::blob_store::BlobStore;
use crate::storage::blob_writer::{BlobWriter, format_started_at, parse_started_at};
use crate::storage::descriptor::{DEFAULT_MEDIA_TYPE, Descriptor};
use crate::storage::driver::{BlobReader, DriverError, StorageDriver};
use crate::storage::paths::{LINK_FILE, PathSpec, path_for};
use crate::storage::registry::Repository;
use crate::utils::validation::is_valid_name;

/// Selects which of a repository's link sets a linked store dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Layer,
    ManifestRevision,
}

impl LinkKind {
    fn link_path(self, name: &str, digest: &Digest) -> Result<String, StorageError> {
        match self {
            LinkKind::Layer => path_for(&PathSpec::LayerLink { name, digest }),
            LinkKind::ManifestRevision => path_for(&PathSpec::ManifestRevisionLink {
                name,
                revision: digest,
            }),
        }
    }

    fn root_path(self, name: &str) -> Result<String, StorageError> {
        match self {
            LinkKind::Layer => path_for(&PathSpec::LayersRoot { name }),
            LinkKind::ManifestRevision => path_for(&PathSpec::ManifestRevisionsRoot { name }),
        }
    }
}

/// Per-repository descriptor lookup and invalidation.
#[async_trait::async_trait]
pub trait BlobDescriptorService: Send + Sync {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, StorageError>;

    async fn clear(&self, digest: &Digest) -> Result<(), StorageError>;

    async fn set_descriptor(&self, digest: &Digest, desc: &Descriptor) -> Result<(), StorageError>;
}

/// Resolves a repository's digests through its link files.
#[derive(Clone)]
pub struct LinkedBlobStatter {
    blob_store: BlobStore,
    repository: String,
    link_kind: LinkKind,
}

impl LinkedBlobStatter {
    pub fn new(blob_store: BlobStore, repository: impl Into<String>, link_kind: LinkKind) -> Self {
        LinkedBlobStatter {
            blob_store,
            repository: repository.into(),
            link_kind,
        }
    }
}

#[async_trait::async_trait]
impl BlobDescriptorService for LinkedBlobStatter {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, StorageError> {
        let link_path = self.link_kind.link_path(&self.repository, digest)?;
        let target = match self.blob_store.readlink(&link_path).await {
            Ok(target) => target,
            Err(StorageError::Driver(DriverError::PathNotFound(_))) => {
                return Err(StorageError::BlobUnknown(digest.to_string()));
            }
            Err(e) => return Err(e),
        };

        if &target != digest {
            // Cross-digest domain lookup, e.g. sha512 -> sha256.
            warn!("looking up blob with canonical target: {digest} -> {target}");
        }

        self.blob_store.statter().stat(&target).await
    }

    async fn clear(&self, digest: &Digest) -> Result<(), StorageError> {
        let link_path = self.link_kind.link_path(&self.repository, digest)?;
        match self.blob_store.driver().delete(&link_path).await {
            Ok(()) => Ok(()),
            Err(DriverError::PathNotFound(_)) => Err(StorageError::BlobUnknown(digest.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_descriptor(&self, _digest: &Digest, _desc: &Descriptor) -> Result<(), StorageError> {
        // The canonical descriptor is fixed when the blob is committed.
        Ok(())
    }
}

/// Mount request for [`LinkedBlobStore::create`].
#[derive(Clone, Debug)]
pub struct MountOptions {
    from: String,
    digest: Digest,
    stat: Option<Descriptor>,
}

impl MountOptions {
    pub fn new(from: impl Into<String>, digest: Digest) -> Result<Self, StorageError> {
        let from = from.into();
        if !is_valid_name(&from) {
            return Err(StorageError::NameInvalid(from));
        }
        Ok(MountOptions {
            from,
            digest,
            stat: None,
        })
    }

    /// Skips the lookup in the source repository.
    pub fn with_stat(mut self, stat: Descriptor) -> Self {
        self.stat = Some(stat);
        self
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub mount: Option<MountOptions>,
}

impl CreateOptions {
    pub fn mount_from(mount: MountOptions) -> Self {
        CreateOptions { mount: Some(mount) }
    }
}

/// A blob made visible by mounting instead of uploading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountedBlob {
    pub from: String,
    pub descriptor: Descriptor,
}

pub enum BlobCreation {
    Upload(BlobWriter),
    Mounted(MountedBlob),
}

/// Repository-scoped view of the global blob store. A digest is only visible
/// through this store when the repository holds a link to it.
#[derive(Clone)]
pub struct LinkedBlobStore {
    blob_store: BlobStore,
    repository: Repository,
    access: Arc<dyn BlobDescriptorService>,
    link_kind: LinkKind,
    delete_enabled: bool,
    resumable_digest: bool,
}

impl LinkedBlobStore {
    pub fn new(repository: Repository, link_kind: LinkKind) -> Self {
        let registry = repository.registry();
        let blob_store = registry.blob_store().clone();
        let options = registry.options();
        LinkedBlobStore {
            access: Arc::new(LinkedBlobStatter::new(
                blob_store.clone(),
                repository.name(),
                link_kind,
            )),
            blob_store,
            repository,
            link_kind,
            delete_enabled: options.delete_enabled,
            resumable_digest: options.resumable_digest,
        }
    }

    pub fn repository_name(&self) -> &str {
        self.repository.name()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn StorageDriver> {
        self.blob_store.driver()
    }

    pub(crate) fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    pub(crate) fn access(&self) -> &Arc<dyn BlobDescriptorService> {
        &self.access
    }

    pub(crate) fn resumable_digest(&self) -> bool {
        self.resumable_digest
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor, StorageError> {
        self.access.stat(digest).await
    }

    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>, StorageError> {
        let canonical = self.stat(digest).await?; // access check
        self.blob_store.get(&canonical.digest).await
    }

    pub async fn open(&self, digest: &Digest) -> Result<BlobReader, StorageError> {
        let canonical = self.stat(digest).await?; // access check
        self.blob_store.open(&canonical.digest).await
    }

    pub async fn serve_blob(
        &self,
        digest: &Digest,
        request_headers: &HeaderMap,
    ) -> Result<Response<Body>, StorageError> {
        let canonical = self.stat(digest).await?; // access check
        let media_type = if canonical.media_type.is_empty() {
            DEFAULT_MEDIA_TYPE
        } else {
            canonical.media_type.as_str()
        };
        self.blob_store
            .serve_blob(&canonical.digest, request_headers, media_type)
            .await
    }

    /// Stores `content` globally, then links it into this repository. When
    /// linking fails the bytes stay valid for everyone; retrying is safe.
    pub async fn put(&self, media_type: &str, content: &[u8]) -> Result<Descriptor, StorageError> {
        let desc = match self.blob_store.put(media_type, content).await {
            Ok(desc) => desc,
            Err(e) => {
                error!("error putting into main store: {e}");
                return Err(e);
            }
        };

        self.access.set_descriptor(&desc.digest, &desc).await?;
        self.link_blob(&desc, &[]).await?;
        Ok(desc)
    }

    /// Begins an upload session, or mounts the blob when asked to and able to.
    pub async fn create(&self, options: CreateOptions) -> Result<BlobCreation, StorageError> {
        debug!(repository = self.repository_name(), "linked blob store create");

        if let Some(mount) = options.mount {
            match self
                .mount(&mount.from, &mount.digest, mount.stat.as_ref())
                .await
            {
                Ok(descriptor) => {
                    return Ok(BlobCreation::Mounted(MountedBlob {
                        from: mount.from,
                        descriptor,
                    }));
                }
                Err(e) => debug!(
                    "mounting {} from {} failed, starting an upload instead: {e}",
                    mount.digest, mount.from
                ),
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started_at_path = path_for(&PathSpec::UploadStartedAt {
            name: self.repository_name(),
            id: &id,
        })?;
        self.driver()
            .put_content(&started_at_path, format_started_at(&started_at).as_bytes())
            .await?;

        BlobWriter::open(self.clone(), id, started_at, false)
            .await
            .map(BlobCreation::Upload)
    }

    pub async fn resume(&self, id: &str) -> Result<BlobWriter, StorageError> {
        debug!(repository = self.repository_name(), id, "linked blob store resume");

        let started_at_path = path_for(&PathSpec::UploadStartedAt {
            name: self.repository_name(),
            id,
        })?;
        let content = match self.driver().get_content(&started_at_path).await {
            Ok(content) => content,
            Err(DriverError::PathNotFound(_)) => {
                return Err(StorageError::BlobUploadUnknown(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let started_at = parse_started_at(&started_at_path, &content)?;

        BlobWriter::open(self.clone(), id.to_string(), started_at, true).await
    }

    pub async fn delete(&self, digest: &Digest) -> Result<(), StorageError> {
        if !self.delete_enabled {
            return Err(StorageError::Unsupported);
        }

        // Ensure the blob is available for deletion
        self.access.stat(digest).await?;
        self.access.clear(digest).await
    }

    /// Feeds every digest this repository links to `ingest`. Links whose blob
    /// is gone from the global store are skipped; any other error stops the walk.
    pub async fn enumerate<F>(&self, mut ingest: F) -> Result<(), StorageError>
    where
        F: FnMut(Digest) -> Result<(), StorageError>,
    {
        let root = self.link_kind.root_path(self.repository_name())?;
        let entries = match self.driver().walk(&root).await {
            Ok(entries) => entries,
            Err(DriverError::PathNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            if entry.is_dir || entry.file_name() != LINK_FILE {
                continue;
            }

            let digest = match self.blob_store.readlink(&entry.path).await {
                Ok(digest) => digest,
                // Removed since the walk listed it.
                Err(StorageError::Driver(DriverError::PathNotFound(_))) => continue,
                Err(e) => return Err(e),
            };
            match self.stat(&digest).await {
                Ok(_) => {}
                Err(StorageError::BlobUnknown(_)) => continue,
                Err(e) => return Err(e),
            }

            ingest(digest)?;
        }
        Ok(())
    }

    async fn mount(
        &self,
        source_repo: &str,
        digest: &Digest,
        source_stat: Option<&Descriptor>,
    ) -> Result<Descriptor, StorageError> {
        let stat = match source_stat {
            Some(stat) => stat.clone(),
            None => {
                let source = self.repository.registry().repository(source_repo)?;
                source.blobs().stat(digest).await?
            }
        };

        // Media types are repository-local; the source's is not carried over.
        let desc = Descriptor::new(stat.digest, stat.size, DEFAULT_MEDIA_TYPE);
        let aliases: &[Digest] = if desc.digest != *digest {
            std::slice::from_ref(digest)
        } else {
            &[]
        };
        self.link_blob(&desc, aliases).await?;
        Ok(desc)
    }

    /// Links `canonical` and its aliases into this repository, each pointing at
    /// the canonical digest.
    pub(crate) async fn link_blob(
        &self,
        canonical: &Descriptor,
        aliases: &[Digest],
    ) -> Result<(), StorageError> {
        let mut seen = HashSet::new();
        for digest in std::iter::once(&canonical.digest).chain(aliases) {
            if !seen.insert(digest.to_string()) {
                continue;
            }
            let link_path = self.link_kind.link_path(self.repository_name(), digest)?;
            self.blob_store.link(&link_path, &canonical.digest).await?;
        }
        Ok(())
    }
}
