use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, RANGE,
};
use axum::http::{HeaderMap, Response, StatusCode};
use oci_spec::image::Digest;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::StorageError;
use crate::storage::descriptor::{DEFAULT_MEDIA_TYPE, Descriptor, digest_of, parse_digest};
use crate::storage::driver::{BlobReader, DriverError, StorageDriver};
use crate::storage::paths::{PathSpec, path_for};

/// Global, repository-agnostic descriptor lookup keyed by digest.
#[derive(Clone)]
pub struct BlobStatter {
    driver: Arc<dyn StorageDriver>,
}

impl BlobStatter {
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor, StorageError> {
        let path = path_for(&PathSpec::BlobData { digest })?;
        let info = match self.driver.stat(&path).await {
            Ok(info) => info,
            Err(DriverError::PathNotFound(_)) => {
                return Err(StorageError::BlobUnknown(digest.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if info.is_dir {
            // Corrupt layout; err on the side of not knowing the blob.
            tracing::warn!("blob path should not be a directory: {path}");
            return Err(StorageError::BlobUnknown(digest.to_string()));
        }
        Ok(Descriptor::new(digest.clone(), info.size, DEFAULT_MEDIA_TYPE))
    }
}

/// Content-addressable store: every blob lives once under its sha256 digest.
#[derive(Clone)]
pub struct BlobStore {
    driver: Arc<dyn StorageDriver>,
    statter: BlobStatter,
}

impl BlobStore {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        BlobStore {
            statter: BlobStatter {
                driver: driver.clone(),
            },
            driver,
        }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn statter(&self) -> &BlobStatter {
        &self.statter
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor, StorageError> {
        self.statter.stat(digest).await
    }

    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>, StorageError> {
        let path = path_for(&PathSpec::BlobData { digest })?;
        self.driver
            .get_content(&path)
            .await
            .map_err(|e| blob_unknown_on_missing(e, digest))
    }

    pub async fn open(&self, digest: &Digest) -> Result<BlobReader, StorageError> {
        let path = path_for(&PathSpec::BlobData { digest })?;
        self.driver
            .reader(&path, 0)
            .await
            .map_err(|e| blob_unknown_on_missing(e, digest))
    }

    /// Streams the blob, honoring a single `Range: bytes=` request.
    pub async fn serve_blob(
        &self,
        digest: &Digest,
        request_headers: &HeaderMap,
        media_type: &str,
    ) -> Result<Response<Body>, StorageError> {
        let desc = self.stat(digest).await?;
        let len = desc.size;

        let builder = Response::builder()
            .header(CONTENT_TYPE, media_type)
            .header("Docker-Content-Digest", digest.to_string())
            .header(ETAG, format!("\"{digest}\""))
            .header(CACHE_CONTROL, "max-age=31536000")
            .header(ACCEPT_RANGES, "bytes");

        let response = match requested_range(request_headers, len) {
            RangeRequest::Full => {
                let reader = self.open(digest).await?;
                builder
                    .status(StatusCode::OK)
                    .header(CONTENT_LENGTH, len)
                    .body(Body::from_stream(ReaderStream::new(reader)))
            }
            RangeRequest::Partial { start, end } => {
                let mut reader = self.open(digest).await?;
                reader.seek(SeekFrom::Start(start)).await?;
                let count = end - start + 1;
                builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(CONTENT_LENGTH, count)
                    .header(CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
                    .body(Body::from_stream(ReaderStream::new(reader.take(count))))
            }
            RangeRequest::Unsatisfiable => builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{len}"))
                .body(Body::empty()),
        };
        response.map_err(|e| StorageError::Io(std::io::Error::other(e)))
    }

    /// Stores `content` under its digest. Content already present is not rewritten.
    ///
    /// The global store always records the generic media type; the media type is
    /// repository-local metadata.
    pub async fn put(&self, _media_type: &str, content: &[u8]) -> Result<Descriptor, StorageError> {
        let digest = digest_of(content)?;
        match self.statter.stat(&digest).await {
            Ok(desc) => return Ok(desc),
            Err(StorageError::BlobUnknown(_)) => {}
            Err(e) => return Err(e),
        }

        let path = path_for(&PathSpec::BlobData { digest: &digest })?;
        self.driver.put_content(&path, content).await?;
        Ok(Descriptor::new(digest, content.len() as u64, DEFAULT_MEDIA_TYPE))
    }

    /// Writes a link file at `path` whose content is `target`.
    pub(crate) async fn link(&self, path: &str, target: &Digest) -> Result<(), StorageError> {
        self.driver
            .put_content(path, target.to_string().as_bytes())
            .await?;
        Ok(())
    }

    /// Reads the target digest of the link at `path`.
    pub(crate) async fn readlink(&self, path: &str) -> Result<Digest, StorageError> {
        let content = self.driver.get_content(path).await?;
        let target = String::from_utf8_lossy(&content);
        parse_digest(target.trim())
    }
}

fn blob_unknown_on_missing(err: DriverError, digest: &Digest) -> StorageError {
    match err {
        DriverError::PathNotFound(_) => StorageError::BlobUnknown(digest.to_string()),
        e => e.into(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangeRequest {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

fn requested_range(headers: &HeaderMap, len: u64) -> RangeRequest {
    let Some(value) = headers.get(RANGE).and_then(|v| v.to_str().ok()) else {
        return RangeRequest::Full;
    };
    // Anything but a single well-formed byte range gets the whole blob.
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    match (first.is_empty(), last.is_empty()) {
        (false, _) => {
            let Ok(start) = first.parse::<u64>() else {
                return RangeRequest::Full;
            };
            let end = if last.is_empty() {
                u64::MAX
            } else {
                match last.parse::<u64>() {
                    Ok(end) if end >= start => end,
                    _ => return RangeRequest::Full,
                }
            };
            if start >= len {
                return RangeRequest::Unsatisfiable;
            }
            RangeRequest::Partial {
                start,
                end: end.min(len - 1),
            }
        }
        (true, false) => {
            let Ok(suffix) = last.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if suffix == 0 || len == 0 {
                return RangeRequest::Unsatisfiable;
            }
            RangeRequest::Partial {
                start: len - suffix.min(len),
                end: len - 1,
            }
        }
        (true, true) => RangeRequest::Full,
    }
}
