//! Failure diagnostics reported upstream

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::models::deployment::{
    ArtifactDescriptor, CommitInfo, DeploymentMethod, DeploymentRecord, FailurePoint, TriggerType,
};
use crate::utils::{version_info, VersionInfo};

/// Disk usage of the filesystem holding a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub path: String,
    pub mount_point: String,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

/// Existence and size of a file involved in a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    pub exists: bool,
    pub is_dir: bool,

    /// Length of a regular file
    pub size_bytes: Option<u64>,
}

impl FileState {
    pub fn inspect(path: &Path) -> Self {
        let metadata = std::fs::metadata(path).ok();
        Self {
            path: path.display().to_string(),
            exists: metadata.is_some(),
            is_dir: metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false),
            size_bytes: metadata.filter(|m| m.is_file()).map(|m| m.len()),
        }
    }
}

/// Host state captured when a deployment fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDiagnostics {
    pub hostname: String,
    pub disks: Vec<DiskUsage>,
    pub files: Vec<FileState>,
}

/// Absolute form of `path` for mount point matching. Missing paths resolve
/// through their nearest existing ancestor.
fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut missing = Vec::new();
    let mut current = absolute.as_path();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return absolute,
        }
    }
}

/// Disk usage for each of `disk_paths` and the state of each of
/// `file_paths`
pub fn collect_diagnostics(disk_paths: &[PathBuf], file_paths: &[PathBuf]) -> HostDiagnostics {
    let disks = Disks::new_with_refreshed_list();

    let usage = disk_paths
        .iter()
        .filter_map(|path| {
            let resolved = resolve(path);
            disks
                .iter()
                .filter(|disk| resolved.starts_with(disk.mount_point()))
                .max_by_key(|disk| disk.mount_point().as_os_str().len())
                .map(|disk| DiskUsage {
                    path: path.display().to_string(),
                    mount_point: disk.mount_point().display().to_string(),
                    available_bytes: disk.available_space(),
                    total_bytes: disk.total_space(),
                })
        })
        .collect();

    HostDiagnostics {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        disks: usage,
        files: file_paths.iter().map(|p| FileState::inspect(p)).collect(),
    }
}

/// Context attached to an upstream failure report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub method: DeploymentMethod,
    pub trigger: TriggerType,
    pub run_id: Option<String>,
    pub run_url: Option<String>,
    pub artifact: Option<ArtifactDescriptor>,
    pub commit: CommitInfo,
    pub version: VersionInfo,
    pub failure_point: Option<FailurePoint>,
    pub diagnostics: HostDiagnostics,
}

impl FailureContext {
    pub fn from_record(record: &DeploymentRecord, diagnostics: HostDiagnostics) -> Self {
        Self {
            method: record.method,
            trigger: record.trigger,
            run_id: record.correlation_id.clone(),
            run_url: record.build_url.clone(),
            artifact: record.artifact.clone(),
            commit: record.commit.clone(),
            version: version_info(),
            failure_point: record.failure_point,
            diagnostics,
        }
    }
}
