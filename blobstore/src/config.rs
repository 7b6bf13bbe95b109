use std::time::Duration;

/// Backend selected with `OCI_REGISTRY_STORAGE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageType {
    Filesystem,
    InMemory,
}

impl StorageType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "FILESYSTEM" => Some(StorageType::Filesystem),
            "INMEMORY" => Some(StorageType::InMemory),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub storage_type: StorageType,
    pub root_dir: String,
    pub delete_enabled: bool,
    pub resumable_digest: bool,
    pub purge: PurgeConfig,
}

#[derive(Clone, Copy, Debug)]
pub struct PurgeConfig {
    pub enabled: bool,
    /// Sessions started longer ago than this are removed.
    pub age: Duration,
    pub interval: Duration,
    pub dry_run: bool,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        PurgeConfig {
            enabled: true,
            age: Duration::from_secs(7 * 24 * 60 * 60),
            interval: Duration::from_secs(24 * 60 * 60),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_parse() {
        assert_eq!(StorageType::parse("FILESYSTEM"), Some(StorageType::Filesystem));
        assert_eq!(StorageType::parse("inmemory"), Some(StorageType::InMemory));
        assert_eq!(StorageType::parse("S3"), None);
    }
}
