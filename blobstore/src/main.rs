use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use blobstore::config::{Config, PurgeConfig, StorageType};
use blobstore::storage::driver::StorageDriver;
use blobstore::storage::driver::filesystem::FilesystemDriver;
use blobstore::utils::cli::Args;
use blobstore::{Registry, RegistryOptions, UploadPurger};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match validate_config(&args).await {
        Ok(config) => config,
        Err(validation_errors) => {
            eprintln!("{}", validation_errors.join("\n"));
            std::process::exit(1);
        }
    };

    let driver: Arc<dyn StorageDriver> = Arc::new(FilesystemDriver::new(&config.root_dir));
    let registry = Registry::new(
        driver,
        RegistryOptions {
            delete_enabled: config.delete_enabled,
            resumable_digest: config.resumable_digest,
        },
    );
    info!(
        "blob storage ready: {} driver at {}, delete enabled {}, resumable digest {}",
        registry.driver().name(),
        config.root_dir,
        config.delete_enabled,
        config.resumable_digest
    );

    let purger = UploadPurger::new(registry.driver().clone(), config.purge);
    if args.once {
        let report = purger.sweep().await;
        for path in &report.deleted {
            println!("{path}");
        }
        for e in &report.errors {
            error!("{e}");
        }
        println!(
            "{} upload(s) {}, {} error(s)",
            report.deleted.len(),
            if config.purge.dry_run { "would be purged" } else { "purged" },
            report.errors.len()
        );
        return Ok(());
    }

    if !config.purge.enabled {
        info!("upload purging disabled");
        shutdown_signal().await;
        return Ok(());
    }
    purger.run(shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}

async fn validate_config(args: &Args) -> Result<Config, Vec<String>> {
    let mut validation_errors = Vec::new();

    let storage_type = StorageType::parse(&args.storage);
    match storage_type {
        None => validation_errors.push(format!(
            "OCI_REGISTRY_STORAGE `{}` is not one of FILESYSTEM, INMEMORY",
            args.storage,
        )),
        // Nothing else can reach a process-local store, so there is nothing to purge.
        Some(StorageType::InMemory) => validation_errors.push(
            "OCI_REGISTRY_STORAGE `INMEMORY` is only usable from the library; the purger needs FILESYSTEM"
                .to_string(),
        ),
        Some(StorageType::Filesystem) => {}
    }

    if storage_type == Some(StorageType::Filesystem) {
        let root_dir = Path::new(&args.root);
        match tokio::fs::metadata(root_dir).await {
            Ok(meta) => {
                if !meta.is_dir() {
                    validation_errors.push(format!(
                        "OCI_REGISTRY_ROOTDIR `{}` exists but is not a directory",
                        args.root,
                    ));
                }
            }
            Err(_) => validation_errors.push(format!(
                "OCI_REGISTRY_ROOTDIR `{}` does not exist.",
                args.root,
            )),
        }
    }

    if args.purge_age_secs == 0 {
        validation_errors.push("OCI_REGISTRY_PURGE_AGE_SECS must be positive".to_string());
    }
    if args.purge_interval_secs == 0 {
        validation_errors.push("OCI_REGISTRY_PURGE_INTERVAL_SECS must be positive".to_string());
    }

    let storage_type = match storage_type {
        Some(storage_type) if validation_errors.is_empty() => storage_type,
        _ => return Err(validation_errors),
    };

    Ok(Config {
        storage_type,
        root_dir: args.root.clone(),
        delete_enabled: args.delete_enabled,
        resumable_digest: args.resumable_digest,
        purge: PurgeConfig {
            enabled: args.purge_enabled,
            age: Duration::from_secs(args.purge_age_secs),
            interval: Duration::from_secs(args.purge_interval_secs),
            dry_run: args.purge_dry_run,
        },
    })
}
