//! Directory operations

use std::fs as std_fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DeployError;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }
}

// Blocking tree helpers, called from `spawn_blocking`.

/// Sorted entries of a directory
pub fn sorted_entries(path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = std_fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Recursively copy `src` into `dest`, returning the copied files relative
/// to `src`. Symlinks are skipped.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<Vec<String>> {
    let mut copied = Vec::new();
    copy_tree_inner(src, src, dest, &mut copied)?;
    Ok(copied)
}

fn copy_tree_inner(
    root: &Path,
    current: &Path,
    dest: &Path,
    copied: &mut Vec<String>,
) -> io::Result<()> {
    std_fs::create_dir_all(dest)?;

    for path in sorted_entries(current)? {
        let file_type = std_fs::symlink_metadata(&path)?.file_type();
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = dest.join(name);

        if file_type.is_dir() {
            copy_tree_inner(root, &path, &target, copied)?;
        } else if file_type.is_file() {
            std_fs::copy(&path, &target)?;
            if let Ok(relative) = path.strip_prefix(root) {
                copied.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    Ok(())
}

/// Remove everything inside `path`, keeping the directory itself
pub fn remove_contents(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in sorted_entries(path)? {
        if std_fs::symlink_metadata(&entry)?.is_dir() {
            std_fs::remove_dir_all(&entry)?;
        } else {
            std_fs::remove_file(&entry)?;
        }
    }
    Ok(())
}

/// Whether `path` is missing or has no entries
pub fn is_empty_dir(path: &Path) -> bool {
    match std_fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}
