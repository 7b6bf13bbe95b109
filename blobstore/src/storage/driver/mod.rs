use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

pub mod filesystem;
pub mod inmemory;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl DriverError {
    /// Maps an I/O error for `path`, keeping "not found" distinguishable.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            DriverError::PathNotFound(path.to_string())
        } else {
            DriverError::Io {
                path: path.to_string(),
                source: err,
            }
        }
    }
}

/// Metadata for a single entry in the driver namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

impl FileInfo {
    /// Last path component, e.g. `link` for `/v2/repositories/foo/_layers/sha256/ab/link`.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ReadSeek for T {}

pub type BlobReader = Box<dyn ReadSeek>;

/// Sequential writer handed out by [`StorageDriver::writer`].
///
/// Bytes are appended in the order of the `write_all` calls. Nothing written
/// is guaranteed durable until `commit` returns.
#[async_trait::async_trait]
pub trait FileWriter: Send + Sync {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), DriverError>;

    /// Total length of the file, including content present before an append open.
    fn size(&self) -> u64;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn cancel(&mut self) -> Result<(), DriverError>;
}

/// Object storage over a flat, `/`-separated path namespace.
///
/// Every operation is atomic per path; nothing is atomic across paths.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError>;

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), DriverError>;

    async fn reader(&self, path: &str, offset: u64) -> Result<BlobReader, DriverError>;

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, DriverError>;

    async fn stat(&self, path: &str) -> Result<FileInfo, DriverError>;

    /// Recursively lists everything below `root`, sorted by path.
    async fn walk(&self, root: &str) -> Result<Vec<FileInfo>, DriverError>;

    async fn move_path(&self, source: &str, dest: &str) -> Result<(), DriverError>;

    /// Removes `path` and, for directories, everything below it.
    async fn delete(&self, path: &str) -> Result<(), DriverError>;
}

pub(crate) fn check_path(path: &str) -> Result<(), DriverError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.split('/').skip(1).any(|c| c.is_empty() || c == "..") {
        return Err(DriverError::InvalidPath(path.to_string()));
    }
    Ok(())
}
