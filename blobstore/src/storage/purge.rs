use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::PurgeConfig;
use crate::error::StorageError;
use crate::storage::blob_writer::parse_started_at;
use crate::storage::driver::{DriverError, StorageDriver};
use crate::storage::paths::{
    PathSpec, UPLOAD_DATA_FILE, UPLOAD_STARTED_AT_FILE, UPLOADS_SEGMENT, path_for,
};

const MAX_START_JITTER_SECS: u64 = 60 * 60;

/// Outcome of one sweep. Partial success is normal: `deleted` lists every
/// session directory removed (or that would be, in a dry run) and `errors`
/// every session that could not be handled.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub deleted: Vec<String>,
    pub errors: Vec<StorageError>,
}

/// Removes upload sessions across all repositories whose `startedat` is
/// before `older_than`. With `actually_delete` unset nothing is mutated.
pub async fn purge_uploads(
    driver: &dyn StorageDriver,
    older_than: DateTime<Utc>,
    actually_delete: bool,
) -> PurgeReport {
    let mut report = PurgeReport::default();

    let root = match path_for(&PathSpec::Repositories) {
        Ok(root) => root,
        Err(e) => {
            report.errors.push(e);
            return report;
        }
    };
    let entries = match driver.walk(&root).await {
        Ok(entries) => entries,
        Err(DriverError::PathNotFound(missing)) if missing == root => return report,
        Err(e) => {
            report.errors.push(e.into());
            return report;
        }
    };

    let sessions: BTreeSet<(&str, &str)> = entries
        .iter()
        .filter(|info| !info.is_dir)
        .filter_map(|info| upload_session(&root, &info.path))
        .collect();

    for (name, id) in sessions {
        let paths = path_for(&PathSpec::Upload { name, id }).and_then(|upload_dir| {
            let started_at = path_for(&PathSpec::UploadStartedAt { name, id })?;
            Ok((upload_dir, started_at))
        });
        let (upload_dir, started_at_path) = match paths {
            Ok(paths) => paths,
            Err(e) => {
                error!("skipping upload {id} in {name:?}: {e}");
                report.errors.push(e);
                continue;
            }
        };

        let content = match driver.get_content(&started_at_path).await {
            Ok(content) => content,
            Err(DriverError::PathNotFound(_)) => continue,
            Err(e) => {
                error!("reading {started_at_path}: {e}");
                report.errors.push(e.into());
                continue;
            }
        };
        let started_at = match parse_started_at(&started_at_path, &content) {
            Ok(t) => t,
            Err(e) => {
                error!("{e}");
                report.errors.push(e);
                continue;
            }
        };
        if started_at >= older_than {
            continue;
        }

        if actually_delete {
            match driver.delete(&upload_dir).await {
                Ok(()) | Err(DriverError::PathNotFound(_)) => {}
                Err(e) => {
                    error!("deleting {upload_dir}: {e}");
                    report.errors.push(e.into());
                    continue;
                }
            }
        }
        report.deleted.push(upload_dir);
    }

    info!(
        deleted = report.deleted.len(),
        errors = report.errors.len(),
        dry_run = !actually_delete,
        "purged uploads older than {older_than}"
    );
    report
}

/// Splits `<root>/<name>/_uploads/<uuid>/(data|startedat)` into the repository
/// name and upload id. Anything else under `root` is not an upload artifact.
fn upload_session<'a>(root: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    let (session, file) = rest.rsplit_once('/')?;
    if file != UPLOAD_DATA_FILE && file != UPLOAD_STARTED_AT_FILE {
        return None;
    }
    let (uploads, id) = session.rsplit_once('/')?;
    Uuid::parse_str(id).ok()?;
    let name = uploads.strip_suffix(UPLOADS_SEGMENT)?.strip_suffix('/')?;
    Some((name, id))
}

/// Periodic driver of `purge_uploads`.
pub struct UploadPurger {
    driver: Arc<dyn StorageDriver>,
    config: PurgeConfig,
}

impl UploadPurger {
    pub fn new(driver: Arc<dyn StorageDriver>, config: PurgeConfig) -> Self {
        UploadPurger { driver, config }
    }

    pub async fn sweep(&self) -> PurgeReport {
        let age = chrono::Duration::from_std(self.config.age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        purge_uploads(self.driver.as_ref(), cutoff, !self.config.dry_run).await
    }

    /// Sweeps every `interval` after a random start delay, until `shutdown`
    /// resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let jitter = Duration::from_secs(rand::rng().random_range(0..=MAX_START_JITTER_SECS));
        info!(
            "starting upload purger in {}s, age {:?}, interval {:?}, dry run {}",
            jitter.as_secs(),
            self.config.age,
            self.config.interval,
            self.config.dry_run
        );

        tokio::pin!(shutdown);
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = &mut shutdown => return,
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = &mut shutdown => break,
            }
        }
        info!("upload purger stopped");
    }
}
