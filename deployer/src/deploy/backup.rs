//! Live directory backups

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::deploy::extract::{extract_archive, swap_into_place};
use crate::errors::DeployError;
use crate::filesys::dir::{is_empty_dir, sorted_entries};

const BACKUP_EXTENSION: &str = ".tar.gz";

fn backup_name(site: &str, label: &str) -> String {
    format!(
        "{}-{}-{}{}",
        site,
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        label,
        BACKUP_EXTENSION
    )
}

fn create_backup_sync(
    live_dir: &Path,
    backups_dir: &Path,
    site: &str,
    label: &str,
) -> Result<Option<PathBuf>, DeployError> {
    if is_empty_dir(live_dir) {
        debug!("Nothing live at {}, skipping backup", live_dir.display());
        return Ok(None);
    }

    fs::create_dir_all(backups_dir)?;
    let path = backups_dir.join(backup_name(site, label));

    let write = || -> std::io::Result<()> {
        let file = fs::File::create(&path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        builder.append_dir_all(".", live_dir)?;
        builder.into_inner()?.finish()?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = fs::remove_file(&path);
        return Err(DeployError::BackupError(format!(
            "archiving {}: {}",
            live_dir.display(),
            e
        )));
    }

    info!("Backed up {} to {}", live_dir.display(), path.display());
    Ok(Some(path))
}

/// Archive the live directory into `backups_dir`. Returns `None` when there
/// is nothing live to back up.
pub async fn create_backup(
    live_dir: &Path,
    backups_dir: &Path,
    site: &str,
    label: &str,
) -> Result<Option<PathBuf>, DeployError> {
    let live_dir = live_dir.to_owned();
    let backups_dir = backups_dir.to_owned();
    let site = site.to_owned();
    let label = label.to_owned();
    spawn_blocking(move || create_backup_sync(&live_dir, &backups_dir, &site, &label)).await?
}

fn restore_backup_sync(
    backup: &Path,
    work_dir: &Path,
    live_dir: &Path,
) -> Result<Vec<String>, DeployError> {
    if !backup.is_file() {
        return Err(DeployError::BackupError(format!(
            "backup {} does not exist",
            backup.display()
        )));
    }

    let staging = work_dir.join("restore");
    extract_archive(backup, &staging)?;
    let files = swap_into_place(&staging, live_dir)?;

    if let Err(e) = fs::remove_dir_all(work_dir) {
        warn!("Could not remove {}: {}", work_dir.display(), e);
    }

    info!("Restored {} from {}", live_dir.display(), backup.display());
    Ok(files)
}

/// Restore a backup over the live directory, staging it under `work_dir`
/// and swapping it into place
pub async fn restore_backup(
    backup: &Path,
    work_dir: &Path,
    live_dir: &Path,
) -> Result<Vec<String>, DeployError> {
    let backup = backup.to_owned();
    let work_dir = work_dir.to_owned();
    let live_dir = live_dir.to_owned();
    spawn_blocking(move || restore_backup_sync(&backup, &work_dir, &live_dir)).await?
}

fn prune_backups_sync(backups_dir: &Path, site: &str, keep: usize) -> Result<usize, DeployError> {
    if !backups_dir.exists() {
        return Ok(0);
    }

    let prefix = format!("{}-", site);
    let mut backups: Vec<PathBuf> = sorted_entries(backups_dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(BACKUP_EXTENSION))
                .unwrap_or(false)
        })
        .collect();

    // names embed the creation time, newest last
    if backups.len() <= keep {
        return Ok(0);
    }
    let excess = backups.len() - keep;
    let mut removed = 0;
    for path in backups.drain(..excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Pruned backup {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Could not prune backup {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Delete the oldest backups for `site`, keeping `keep`
pub async fn prune_backups(backups_dir: &Path, site: &str, keep: usize) -> Result<usize, DeployError> {
    let backups_dir = backups_dir.to_owned();
    let site = site.to_owned();
    spawn_blocking(move || prune_backups_sync(&backups_dir, &site, keep)).await?
}
