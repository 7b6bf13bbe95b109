use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use oci_spec::image::{Digest, DigestAlgorithm};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::descriptor::{DEFAULT_MEDIA_TYPE, Descriptor, Digester};
use crate::storage::driver::{DriverError, FileWriter};
use crate::storage::linked_blob_store::LinkedBlobStore;
use crate::storage::paths::{PathSpec, path_for};

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) fn format_started_at(started_at: &DateTime<Utc>) -> String {
    started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_started_at(path: &str, content: &[u8]) -> Result<DateTime<Utc>, StorageError> {
    let value = String::from_utf8_lossy(content);
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| StorageError::TimestampInvalid {
            path: path.to_string(),
            value: value.to_string(),
            source,
        })
}

/// What the client claims about the blob it is committing.
#[derive(Clone, Debug)]
pub struct ProvisionalDescriptor {
    pub digest: Digest,
    pub size: Option<u64>,
    pub media_type: Option<String>,
}

impl ProvisionalDescriptor {
    pub fn new(digest: Digest) -> Self {
        ProvisionalDescriptor {
            digest,
            size: None,
            media_type: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// An in-flight upload. Chunks are appended in call order and hashed as they
/// are written; `commit` and `cancel` end the session, `close` suspends it.
pub struct BlobWriter {
    store: LinkedBlobStore,
    id: String,
    started_at: DateTime<Utc>,
    digester: Digester,
    writer: Box<dyn FileWriter>,
    path: String,
}

impl BlobWriter {
    pub(crate) async fn open(
        store: LinkedBlobStore,
        id: String,
        started_at: DateTime<Utc>,
        resume: bool,
    ) -> Result<Self, StorageError> {
        let path = path_for(&PathSpec::UploadData {
            name: store.repository_name(),
            id: &id,
        })?;
        let writer = store.driver().writer(&path, resume).await?;

        let mut bw = BlobWriter {
            store,
            id,
            started_at,
            digester: Digester::canonical(),
            writer,
            path,
        };
        if resume {
            bw.restore_digester().await?;
        }
        Ok(bw)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repository(&self) -> &str {
        self.store.repository_name()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Bytes written so far, including those from before a resume.
    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError> {
        self.writer.write_all(chunk).await?;
        self.digester.update(chunk);
        Ok(chunk.len())
    }

    /// Appends a request body chunk by chunk.
    pub async fn write_stream<S, E>(&mut self, mut stream: S) -> Result<u64, StorageError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut written = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
            written += self.write(&chunk).await? as u64;
        }
        Ok(written)
    }

    /// Flushes and suspends the session; it can be picked up again with `resume`.
    pub async fn close(mut self) -> Result<(), StorageError> {
        self.writer.commit().await?;
        self.store_hash_state().await
    }

    /// Drops the session and everything it wrote.
    pub async fn cancel(mut self) -> Result<(), StorageError> {
        debug!(repository = self.repository(), id = %self.id, "blob writer cancel");
        self.writer.cancel().await?;
        self.remove_resources().await
    }

    /// Verifies the upload against `provisional` and promotes it into the
    /// global store. On a verification failure the session is left in place.
    pub async fn commit(mut self, provisional: ProvisionalDescriptor) -> Result<Descriptor, StorageError> {
        debug!(repository = self.repository(), id = %self.id, "blob writer commit");

        self.writer.commit().await?;
        self.store_hash_state().await?;

        let canonical = self.validate_blob(&provisional).await?;
        self.move_blob(&canonical).await?;

        let aliases: &[Digest] = if provisional.digest != canonical.digest {
            std::slice::from_ref(&provisional.digest)
        } else {
            &[]
        };
        self.store.link_blob(&canonical, aliases).await?;
        self.remove_resources().await?;

        self.store
            .access()
            .set_descriptor(&canonical.digest, &canonical)
            .await?;
        Ok(canonical)
    }

    async fn validate_blob(&self, provisional: &ProvisionalDescriptor) -> Result<Descriptor, StorageError> {
        let size = self.size();
        if let Some(expected) = provisional.size {
            if expected != size {
                return Err(StorageError::BlobInvalidLength {
                    expected,
                    actual: size,
                });
            }
        }

        let canonical = self.digester.digest()?;
        let verified = if provisional.digest.algorithm() == &DigestAlgorithm::Sha256 {
            canonical.clone()
        } else {
            let mut verifier = Digester::for_algorithm(provisional.digest.algorithm())?;
            self.hash_data(&mut verifier).await?;
            verifier.digest()?
        };
        if verified != provisional.digest {
            return Err(StorageError::BlobInvalidDigest {
                expected: provisional.digest.to_string(),
                actual: verified.to_string(),
            });
        }

        let media_type = provisional
            .media_type
            .clone()
            .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());
        Ok(Descriptor::new(canonical, size, media_type))
    }

    async fn move_blob(&self, canonical: &Descriptor) -> Result<(), StorageError> {
        let blob_path = path_for(&PathSpec::BlobData {
            digest: &canonical.digest,
        })?;

        match self.store.driver().stat(&blob_path).await {
            // Someone else committed this content already.
            Ok(_) => return Ok(()),
            Err(DriverError::PathNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if canonical.size == 0 {
            self.store.driver().put_content(&blob_path, &[]).await?;
            return Ok(());
        }
        self.store.driver().move_path(&self.path, &blob_path).await?;
        Ok(())
    }

    async fn remove_resources(&self) -> Result<(), StorageError> {
        let upload_path = path_for(&PathSpec::Upload {
            name: self.repository(),
            id: &self.id,
        })?;
        match self.store.driver().delete(&upload_path).await {
            Ok(()) | Err(DriverError::PathNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Feeds the bytes currently at the data path into `digester`.
    async fn hash_data(&self, digester: &mut Digester) -> Result<u64, StorageError> {
        let mut reader = match self.store.driver().reader(&self.path, 0).await {
            Ok(reader) => reader,
            Err(DriverError::PathNotFound(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut hashed = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            hashed += n as u64;
        }
        Ok(hashed)
    }

    /// Rebuilds the running digest from the bytes on disk. A length mismatch or
    /// a checkpoint that disagrees with the data fails the resume.
    async fn restore_digester(&mut self) -> Result<(), StorageError> {
        let mut digester = Digester::canonical();
        let hashed = self.hash_data(&mut digester).await?;
        let size = self.size();
        if hashed != size {
            return Err(StorageError::BlobUploadInvalid(format!(
                "upload {}: read {hashed} bytes but writer reports {size}",
                self.id
            )));
        }

        if self.store.resumable_digest() {
            let state_path = self.hash_state_path(size)?;
            match self.store.driver().get_content(&state_path).await {
                Ok(checkpoint) => {
                    let recomputed = digester.digest()?.to_string();
                    if String::from_utf8_lossy(&checkpoint).trim() != recomputed {
                        return Err(StorageError::BlobUploadInvalid(format!(
                            "upload {}: data does not match digest checkpoint at offset {size}",
                            self.id
                        )));
                    }
                }
                Err(DriverError::PathNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.digester = digester;
        Ok(())
    }

    async fn store_hash_state(&self) -> Result<(), StorageError> {
        if !self.store.resumable_digest() {
            return Ok(());
        }
        let state_path = self.hash_state_path(self.size())?;
        let digest = self.digester.digest()?;
        self.store
            .driver()
            .put_content(&state_path, digest.to_string().as_bytes())
            .await?;
        Ok(())
    }

    fn hash_state_path(&self, offset: u64) -> Result<String, StorageError> {
        path_for(&PathSpec::UploadHashState {
            name: self.repository(),
            id: &self.id,
            algorithm: &DigestAlgorithm::Sha256,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::storage::blob_store::BlobStore;
    use crate::storage::descriptor::{digest_of, parse_digest};
    use crate::storage::driver::StorageDriver;
    use crate::storage::driver::filesystem::FilesystemDriver;
    use crate::storage::driver::inmemory::InMemoryDriver;
    use crate::storage::linked_blob_store::{BlobCreation, CreateOptions};
    use crate::storage::registry::{Registry, RegistryOptions};
    use sha2::{Digest as _, Sha512};

    fn registry_with(driver: Arc<dyn StorageDriver>, resumable_digest: bool) -> Registry {
        Registry::new(
            driver,
            RegistryOptions {
                delete_enabled: true,
                resumable_digest,
            },
        )
    }

    async fn start(store: &LinkedBlobStore) -> anyhow::Result<BlobWriter> {
        match store.create(CreateOptions::default()).await? {
            BlobCreation::Upload(writer) => Ok(writer),
            BlobCreation::Mounted(_) => anyhow::bail!("unexpected mount"),
        }
    }

    #[tokio::test]
    async fn test_chunked_upload_commit() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), false);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        let id = writer.id().to_string();
        assert_eq!(writer.repository(), "foo");
        writer.write(b"hello ").await?;
        writer.write(b"world").await?;
        assert_eq!(writer.size(), 11);

        let digest = digest_of(b"hello world")?;
        let desc = writer
            .commit(
                ProvisionalDescriptor::new(digest.clone())
                    .with_size(11)
                    .with_media_type("text/plain"),
            )
            .await?;
        assert_eq!(desc.digest, digest);
        assert_eq!(desc.size, 11);
        assert_eq!(desc.media_type, "text/plain");

        assert_eq!(foo.get(&digest).await?, b"hello world");
        assert!(matches!(foo.resume(&id).await, Err(StorageError::BlobUploadUnknown(_))));
        let upload_dir = path_for(&PathSpec::Upload { name: "foo", id: &id })?;
        assert!(registry.driver().stat(&upload_dir).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_stream() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), false);
        let foo = registry.repository("foo")?.blobs();
        let mut writer = start(&foo).await?;

        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let written = writer.write_stream(futures::stream::iter(chunks)).await?;
        assert_eq!(written, 4);

        let desc = writer.commit(ProvisionalDescriptor::new(digest_of(b"abcd")?)).await?;
        assert_eq!(foo.get(&desc.digest).await?, b"abcd");
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_continues_digest() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let registry = registry_with(Arc::new(FilesystemDriver::new(temp_dir.path())), true);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        let id = writer.id().to_string();
        let started_at = writer.started_at();
        writer.write(b"first,").await?;
        writer.close().await?;

        let mut writer = foo.resume(&id).await?;
        assert_eq!(writer.size(), 6);
        assert_eq!(writer.started_at().timestamp(), started_at.timestamp());
        writer.write(b"second").await?;

        let desc = writer
            .commit(ProvisionalDescriptor::new(digest_of(b"first,second")?))
            .await?;
        assert_eq!(foo.get(&desc.digest).await?, b"first,second");
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_rejects_mismatched_checkpoint() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), true);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        let id = writer.id().to_string();
        writer.write(b"abc").await?;
        writer.close().await?;

        // Same length, different bytes.
        let data_path = path_for(&PathSpec::UploadData { name: "foo", id: &id })?;
        registry.driver().put_content(&data_path, b"xyz").await?;

        assert!(matches!(
            foo.resume(&id).await,
            Err(StorageError::BlobUploadInvalid(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_rejects_wrong_digest_and_size() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), false);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        let id = writer.id().to_string();
        writer.write(b"payload").await?;
        let result = writer
            .commit(ProvisionalDescriptor::new(digest_of(b"other")?))
            .await;
        assert!(matches!(result, Err(StorageError::BlobInvalidDigest { .. })));

        // The session survives a failed verification.
        let writer = foo.resume(&id).await?;
        let result = writer
            .commit(ProvisionalDescriptor::new(digest_of(b"payload")?).with_size(3))
            .await;
        assert!(matches!(
            result,
            Err(StorageError::BlobInvalidLength { expected: 3, actual: 7 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_with_sha512_links_alias() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), false);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        writer.write(b"cross-algorithm").await?;
        let sha512 = parse_digest(&format!(
            "sha512:{}",
            hex::encode(Sha512::digest(b"cross-algorithm"))
        ))?;
        let desc = writer.commit(ProvisionalDescriptor::new(sha512.clone())).await?;

        assert_eq!(desc.digest, digest_of(b"cross-algorithm")?);
        assert_eq!(foo.stat(&sha512).await?.digest, desc.digest);
        assert_eq!(foo.get(&sha512).await?, b"cross-algorithm");
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_of_existing_content_and_empty_blob() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), false);
        let foo = registry.repository("foo")?.blobs();
        let bar = registry.repository("bar")?.blobs();
        foo.put(DEFAULT_MEDIA_TYPE, b"dup").await?;

        let mut writer = start(&bar).await?;
        writer.write(b"dup").await?;
        let desc = writer.commit(ProvisionalDescriptor::new(digest_of(b"dup")?)).await?;
        assert_eq!(bar.get(&desc.digest).await?, b"dup");

        let writer = start(&bar).await?;
        let empty = writer.commit(ProvisionalDescriptor::new(digest_of(b"")?)).await?;
        assert_eq!(empty.size, 0);
        assert_eq!(BlobStore::new(registry.driver().clone()).get(&empty.digest).await?, b"");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_removes_session() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), false);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        let id = writer.id().to_string();
        writer.write(b"discard").await?;
        writer.cancel().await?;

        assert!(matches!(foo.resume(&id).await, Err(StorageError::BlobUploadUnknown(_))));
        assert!(registry.driver().walk("/v2/repositories").await.is_err());
        Ok(())
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_session_futures_are_send() -> anyhow::Result<()> {
        let registry = registry_with(Arc::new(InMemoryDriver::new()), true);
        let foo = registry.repository("foo")?.blobs();

        let mut writer = start(&foo).await?;
        let id = writer.id().to_string();
        let write = writer.write(b"abc");
        assert_send(&write);
        write.await?;
        let close = writer.close();
        assert_send(&close);
        close.await?;

        let writer = foo.resume(&id).await?;
        let commit = writer.commit(ProvisionalDescriptor::new(digest_of(b"abc")?));
        assert_send(&commit);
        commit.await?;

        let writer = start(&foo).await?;
        let cancel = writer.cancel();
        assert_send(&cancel);
        cancel.await?;

        // Sessions can be driven from spawned tasks.
        let spawned = tokio::spawn(async move {
            let mut writer = start(&foo).await?;
            writer.write(b"spawned").await?;
            let desc = writer
                .commit(ProvisionalDescriptor::new(digest_of(b"spawned")?))
                .await?;
            anyhow::Ok(desc)
        });
        assert_eq!(spawned.await??.size, 7);
        Ok(())
    }

    #[test]
    fn test_started_at_format() {
        let t = DateTime::parse_from_rfc3339("2024-05-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_started_at(&t), "2024-05-01T10:20:30Z");
        assert_eq!(parse_started_at("/p", b"2024-05-01T10:20:30Z\n").unwrap(), t);
        assert!(matches!(
            parse_started_at("/p", b"yesterday"),
            Err(StorageError::TimestampInvalid { .. })
        ));
    }
}
