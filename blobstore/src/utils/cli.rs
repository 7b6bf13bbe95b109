use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Storage backend type; the binary only runs against FILESYSTEM
    #[arg(
        short,
        long,
        env = "OCI_REGISTRY_STORAGE",
        default_value = "FILESYSTEM"
    )]
    pub storage: String,

    /// Registry root path
    #[arg(
        long,
        env = "OCI_REGISTRY_ROOTDIR",
        default_value = "/var/lib/oci-registry"
    )]
    pub root: String,

    /// Allow blob deletion
    #[arg(long, env = "OCI_REGISTRY_DELETE_ENABLED", default_value_t = false)]
    pub delete_enabled: bool,

    /// Persist digest checkpoints for resumed uploads
    #[arg(long, env = "OCI_REGISTRY_RESUMABLE_DIGEST", default_value_t = false)]
    pub resumable_digest: bool,

    /// Run the periodic upload purger
    #[arg(long, env = "OCI_REGISTRY_PURGE_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub purge_enabled: bool,

    /// Age in seconds after which an upload session is purged
    #[arg(long, env = "OCI_REGISTRY_PURGE_AGE_SECS", default_value_t = 604800)]
    pub purge_age_secs: u64,

    /// Seconds between purge sweeps
    #[arg(long, env = "OCI_REGISTRY_PURGE_INTERVAL_SECS", default_value_t = 86400)]
    pub purge_interval_secs: u64,

    /// Report what a purge would delete without deleting it
    #[arg(long, env = "OCI_REGISTRY_PURGE_DRY_RUN", default_value_t = false)]
    pub purge_dry_run: bool,

    /// Run a single purge sweep, print the result and exit
    #[arg(long)]
    pub once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["blobstore"]).unwrap();
        assert_eq!(args.purge_age_secs, 604800);
        assert_eq!(args.purge_interval_secs, 86400);
        assert!(!args.once);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "blobstore",
            "--storage",
            "INMEMORY",
            "--purge-enabled",
            "false",
            "--purge-age-secs",
            "60",
            "--purge-dry-run",
            "--once",
        ])
        .unwrap();
        assert_eq!(args.storage, "INMEMORY");
        assert!(!args.purge_enabled);
        assert_eq!(args.purge_age_secs, 60);
        assert!(args.purge_dry_run);
        assert!(args.once);
    }
}
