use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use crate::storage::driver::{BlobReader, DriverError, FileInfo, FileWriter, StorageDriver, check_path};

use tokio::{
    fs::{
        File, OpenOptions, create_dir_all, metadata, read, read_dir, remove_dir_all, remove_file,
        rename, symlink_metadata, write,
    },
    io::{AsyncSeekExt, AsyncWriteExt, BufWriter},
};

/// Driver backed by a local directory; driver path `/a/b` lives at `<root>/a/b`.
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        FilesystemDriver {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, DriverError> {
        check_path(path)?;
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    async fn create_path(&self, path: &str) -> Result<PathBuf, DriverError> {
        let file_path = self.full_path(path)?;
        if let Some(parent) = file_path.parent() {
            create_dir_all(parent)
                .await
                .map_err(|e| DriverError::from_io(path, e))?;
        }
        Ok(file_path)
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[async_trait::async_trait]
impl StorageDriver for FilesystemDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        read(self.full_path(path)?)
            .await
            .map_err(|e| DriverError::from_io(path, e))
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), DriverError> {
        let file_path = self.create_path(path).await?;
        // Write aside and rename so readers never observe a partial file.
        let tmp_path = file_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        write(&tmp_path, content)
            .await
            .map_err(|e| DriverError::from_io(path, e))?;
        if let Err(e) = rename(&tmp_path, &file_path).await {
            let _ = remove_file(&tmp_path).await;
            return Err(DriverError::from_io(path, e));
        }
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BlobReader, DriverError> {
        let mut file = File::open(self.full_path(path)?)
            .await
            .map_err(|e| DriverError::from_io(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| DriverError::from_io(path, e))?;
        }
        Ok(Box::new(file))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, DriverError> {
        let file_path = self.create_path(path).await?;
        let opened = if append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await
        } else {
            File::create(&file_path).await
        };
        let file = opened.map_err(|e| DriverError::from_io(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| DriverError::from_io(path, e))?
            .len();

        Ok(Box::new(FilesystemFileWriter {
            path: path.to_string(),
            file_path,
            file: BufWriter::new(file),
            size,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, DriverError> {
        let meta = metadata(self.full_path(path)?)
            .await
            .map_err(|e| DriverError::from_io(path, e))?;
        Ok(FileInfo {
            path: path.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
        })
    }

    async fn walk(&self, root: &str) -> Result<Vec<FileInfo>, DriverError> {
        let root_info = self.stat(root).await?;
        if !root_info.is_dir {
            return Err(DriverError::InvalidPath(format!("{root} is not a directory")));
        }

        let mut entries = vec![];
        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            // Below the root, anything may be removed between listing and reading.
            let mut read_dir = match read_dir(self.full_path(&dir)?).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == ErrorKind::NotFound && dir != root => continue,
                Err(e) => return Err(DriverError::from_io(&dir, e)),
            };
            loop {
                let entry = match read_dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) if e.kind() == ErrorKind::NotFound => break,
                    Err(e) => return Err(DriverError::from_io(&dir, e)),
                };
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let path = child_path(&dir, &name);
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(DriverError::from_io(&path, e)),
                };
                if meta.is_dir() {
                    pending.push(path.clone());
                }
                entries.push(FileInfo {
                    path,
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    is_dir: meta.is_dir(),
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        let source_path = self.full_path(source)?;
        let dest_path = self.create_path(dest).await?;
        rename(source_path, dest_path)
            .await
            .map_err(|e| DriverError::from_io(source, e))
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        let file_path = self.full_path(path)?;
        let meta = symlink_metadata(&file_path)
            .await
            .map_err(|e| DriverError::from_io(path, e))?;
        let result = if meta.is_dir() {
            remove_dir_all(file_path).await
        } else {
            remove_file(file_path).await
        };
        result.map_err(|e| DriverError::from_io(path, e))
    }
}

struct FilesystemFileWriter {
    path: String,
    file_path: PathBuf,
    file: BufWriter<File>,
    size: u64,
}

#[async_trait::async_trait]
impl FileWriter for FilesystemFileWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), DriverError> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| DriverError::from_io(&self.path, e))?;
        self.size += buf.len() as u64;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.file
            .flush()
            .await
            .map_err(|e| DriverError::from_io(&self.path, e))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| DriverError::from_io(&self.path, e))
    }

    async fn cancel(&mut self) -> Result<(), DriverError> {
        match remove_file(&self.file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::from_io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_get_and_not_found() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let driver = FilesystemDriver::new(temp_dir.path());

        driver.put_content("/v2/a/b/data", b"hello").await?;
        assert_eq!(driver.get_content("/v2/a/b/data").await?, b"hello");
        assert_eq!(driver.stat("/v2/a/b/data").await?.size, 5);

        let err = driver.get_content("/v2/missing").await.unwrap_err();
        assert!(matches!(err, DriverError::PathNotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_append_and_reader_offset() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let driver = FilesystemDriver::new(temp_dir.path());

        let mut writer = driver.writer("/uploads/1/data", false).await?;
        writer.write_all(b"abc").await?;
        writer.commit().await?;
        drop(writer);

        let mut writer = driver.writer("/uploads/1/data", true).await?;
        assert_eq!(writer.size(), 3);
        writer.write_all(b"def").await?;
        assert_eq!(writer.size(), 6);
        writer.commit().await?;

        let mut reader = driver.reader("/uploads/1/data", 2).await?;
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await?;
        assert_eq!(buf, "cdef");
        Ok(())
    }

    #[tokio::test]
    async fn test_walk_move_delete() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let driver = FilesystemDriver::new(temp_dir.path());

        driver.put_content("/r/x/link", b"1").await?;
        driver.put_content("/r/y/z/link", b"2").await?;

        let paths: Vec<String> = driver.walk("/r").await?.into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["/r/x", "/r/x/link", "/r/y", "/r/y/z", "/r/y/z/link"]);

        driver.move_path("/r/x/link", "/s/link").await?;
        assert_eq!(driver.get_content("/s/link").await?, b"1");

        driver.delete("/r/y").await?;
        assert!(matches!(driver.stat("/r/y/z/link").await, Err(DriverError::PathNotFound(_))));
        assert!(matches!(driver.delete("/r/y").await, Err(DriverError::PathNotFound(_))));
        assert!(matches!(driver.walk("/nope").await, Err(DriverError::PathNotFound(_))));
        Ok(())
    }
}
