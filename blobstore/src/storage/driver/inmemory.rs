use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;

use crate::storage::driver::{BlobReader, DriverError, FileInfo, FileWriter, StorageDriver, check_path};

use tokio::sync::RwLock;

type Files = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

/// Process-local driver. Directories are implied by the files below them.
#[derive(Clone, Default)]
pub struct InMemoryDriver {
    files: Files,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn dir_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn keys_under<'a>(
    files: &'a BTreeMap<String, Vec<u8>>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a String> + 'a {
    files
        .range(prefix.to_string()..)
        .map(|(k, _)| k)
        .take_while(move |k| k.starts_with(prefix))
}

#[async_trait::async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        check_path(path)?;
        let files = self.files.read().await;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| DriverError::PathNotFound(path.to_string()))
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), DriverError> {
        check_path(path)?;
        let mut files = self.files.write().await;
        files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BlobReader, DriverError> {
        let content = self.get_content(path).await?;
        let mut cursor = Cursor::new(content);
        cursor.set_position(offset);
        Ok(Box::new(cursor))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, DriverError> {
        check_path(path)?;
        let mut files = self.files.write().await;
        let content = files.entry(path.to_string()).or_default();
        if !append {
            content.clear();
        }
        let size = content.len() as u64;
        Ok(Box::new(InMemoryFileWriter {
            files: self.files.clone(),
            path: path.to_string(),
            size,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, DriverError> {
        check_path(path)?;
        let files = self.files.read().await;
        if let Some(content) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: content.len() as u64,
                is_dir: false,
            });
        }
        let prefix = dir_prefix(path);
        if path == "/" || keys_under(&files, &prefix).next().is_some() {
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                is_dir: true,
            });
        }
        Err(DriverError::PathNotFound(path.to_string()))
    }

    async fn walk(&self, root: &str) -> Result<Vec<FileInfo>, DriverError> {
        let root_info = self.stat(root).await?;
        if !root_info.is_dir {
            return Err(DriverError::InvalidPath(format!("{root} is not a directory")));
        }

        let files = self.files.read().await;
        let prefix = dir_prefix(root);
        let mut dirs = BTreeSet::new();
        let mut entries = vec![];
        for key in keys_under(&files, &prefix) {
            let relative = &key[prefix.len()..];
            let mut end = 0;
            while let Some(pos) = relative[end..].find('/') {
                end += pos;
                dirs.insert(format!("{prefix}{}", &relative[..end]));
                end += 1;
            }
            entries.push(FileInfo {
                path: key.clone(),
                size: files[key].len() as u64,
                is_dir: false,
            });
        }
        entries.extend(dirs.into_iter().map(|path| FileInfo {
            path,
            size: 0,
            is_dir: true,
        }));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        check_path(source)?;
        check_path(dest)?;
        let mut files = self.files.write().await;
        if let Some(content) = files.remove(source) {
            files.insert(dest.to_string(), content);
            return Ok(());
        }
        let prefix = dir_prefix(source);
        let moved: Vec<String> = keys_under(&files, &prefix).cloned().collect();
        if moved.is_empty() {
            return Err(DriverError::PathNotFound(source.to_string()));
        }
        for key in moved {
            if let Some(content) = files.remove(&key) {
                files.insert(format!("{dest}/{}", &key[prefix.len()..]), content);
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        check_path(path)?;
        let mut files = self.files.write().await;
        if files.remove(path).is_some() {
            return Ok(());
        }
        let prefix = dir_prefix(path);
        let doomed: Vec<String> = keys_under(&files, &prefix).cloned().collect();
        if doomed.is_empty() {
            return Err(DriverError::PathNotFound(path.to_string()));
        }
        for key in doomed {
            files.remove(&key);
        }
        Ok(())
    }
}

struct InMemoryFileWriter {
    files: Files,
    path: String,
    size: u64,
}

#[async_trait::async_trait]
impl FileWriter for InMemoryFileWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), DriverError> {
        let mut files = self.files.write().await;
        let content = files
            .get_mut(&self.path)
            .ok_or_else(|| DriverError::PathNotFound(self.path.clone()))?;
        content.extend_from_slice(buf);
        self.size = content.len() as u64;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), DriverError> {
        let mut files = self.files.write().await;
        files.remove(&self.path);
        Ok(())
    }
}
