//! Archive extraction and placement.
//!
//! An archive is unpacked into a private work directory, unwrapped if it
//! turns out to contain a single nested archive, searched for the directory
//! that actually holds the deployable tree, and that tree is then placed
//! over the live directory. Everything here is blocking and runs on the
//! blocking pool.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::{copy_tree, remove_contents, sorted_entries};
use crate::storage::settings::PlacementMode;

/// Entries ignored when looking at an archive's top level
const IGNORED_ENTRIES: &[&str] = &["__MACOSX", ".DS_Store"];

/// Maximum directory depth searched for marker files
const MARKER_SEARCH_DEPTH: usize = 3;

/// Archive container format, detected from content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

/// Extraction and placement options
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Name of the deployment unit directory
    pub unit_name: String,

    /// Files that mark the root of a deployable tree
    pub marker_files: Vec<String>,

    pub placement: PlacementMode,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            unit_name: String::new(),
            marker_files: vec!["style.css".to_string()],
            placement: PlacementMode::Swap,
        }
    }
}

/// Detect the archive kind from its magic bytes
pub fn detect_kind(path: &Path) -> Result<ArchiveKind, DeployError> {
    let mut file = fs::File::open(path)
        .map_err(|e| DeployError::ArchiveOpen(format!("{}: {}", path.display(), e)))?;

    let mut header = [0u8; 512];
    let mut read = 0;
    while read < header.len() {
        match file.read(&mut header[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => return Err(DeployError::ArchiveOpen(format!("{}: {}", path.display(), e))),
        }
    }
    let header = &header[..read];

    if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        return Ok(ArchiveKind::Zip);
    }
    if header.starts_with(&[0x1f, 0x8b]) {
        return Ok(ArchiveKind::TarGz);
    }
    if header.len() >= 262 && &header[257..262] == b"ustar" {
        return Ok(ArchiveKind::Tar);
    }

    Err(DeployError::ArchiveOpen(format!(
        "{} is not a zip or tar archive",
        path.display()
    )))
}

/// Whether a file name looks like an archive
fn has_archive_extension(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    [".zip", ".tar.gz", ".tgz", ".tar"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Unpack `archive` into `dest`
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ArchiveKind, DeployError> {
    let kind = detect_kind(archive)?;
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive)
        .map_err(|e| DeployError::ArchiveOpen(format!("{}: {}", archive.display(), e)))?;

    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| DeployError::ArchiveOpen(format!("{}: {}", archive.display(), e)))?;
            zip.extract(dest)?;
        }
        ArchiveKind::TarGz => {
            tar::Archive::new(GzDecoder::new(file))
                .unpack(dest)
                .map_err(|e| DeployError::ArchiveExtract(format!("{}: {}", archive.display(), e)))?;
        }
        ArchiveKind::Tar => {
            tar::Archive::new(file)
                .unpack(dest)
                .map_err(|e| DeployError::ArchiveExtract(format!("{}: {}", archive.display(), e)))?;
        }
    }

    debug!("Extracted {:?} archive {} into {}", kind, archive.display(), dest.display());
    Ok(kind)
}

/// Top-level entries, minus platform junk
fn visible_entries(dir: &Path) -> Result<Vec<PathBuf>, DeployError> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !IGNORED_ENTRIES.contains(&n))
                .unwrap_or(true)
        })
        .collect())
}

/// If `root` holds exactly one entry and it is an archive, extract it next to
/// `root` and return the new root. Otherwise return `root` unchanged.
pub fn unwrap_nested_archive(root: &Path) -> Result<PathBuf, DeployError> {
    let entries = visible_entries(root)?;
    let [only] = entries.as_slice() else {
        return Ok(root.to_path_buf());
    };

    let is_archive = only.is_file()
        && only
            .file_name()
            .and_then(|n| n.to_str())
            .map(has_archive_extension)
            .unwrap_or(false);
    if !is_archive {
        return Ok(root.to_path_buf());
    }

    let nested_root = root.with_file_name(format!(
        "{}-nested",
        root.file_name().and_then(|n| n.to_str()).unwrap_or("extract")
    ));
    info!("Found nested archive {}, extracting", only.display());
    extract_archive(only, &nested_root)?;
    Ok(nested_root)
}

/// Breadth-first search for a directory holding one of `markers`
fn find_marker_dir(root: &Path, markers: &[String]) -> Result<Option<PathBuf>, DeployError> {
    let mut level = vec![root.to_path_buf()];

    for _depth in 0..=MARKER_SEARCH_DEPTH {
        let mut next = Vec::new();
        for dir in &level {
            if markers.iter().any(|m| dir.join(m).is_file()) {
                return Ok(Some(dir.clone()));
            }
            next.extend(visible_entries(dir)?.into_iter().filter(|p| p.is_dir()));
        }
        if next.is_empty() {
            break;
        }
        level = next;
    }

    Ok(None)
}

/// Pick the directory to deploy from an extraction root.
///
/// First match wins: a top-level directory named after the unit, the
/// shallowest directory holding a marker file, the first top-level
/// directory, the root itself.
pub fn discover_target(root: &Path, options: &ExtractOptions) -> Result<PathBuf, DeployError> {
    let entries = visible_entries(root)?;
    let dirs: Vec<&PathBuf> = entries.iter().filter(|p| p.is_dir()).collect();

    if !options.unit_name.is_empty() {
        let named = dirs.iter().find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.eq_ignore_ascii_case(&options.unit_name))
                .unwrap_or(false)
        });
        if let Some(dir) = named {
            debug!("Deploying unit directory {}", dir.display());
            return Ok((*dir).clone());
        }
    }

    if let Some(dir) = find_marker_dir(root, &options.marker_files)? {
        debug!("Deploying marker directory {}", dir.display());
        return Ok(dir);
    }

    if let Some(dir) = dirs.first() {
        debug!("Deploying first directory {}", dir.display());
        return Ok((*dir).clone());
    }

    Ok(root.to_path_buf())
}

fn sibling(live_dir: &Path, tag: &str) -> Result<PathBuf, DeployError> {
    let parent = live_dir
        .parent()
        .ok_or_else(|| DeployError::CopyError(format!("{} has no parent", live_dir.display())))?;
    let name = live_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("live");
    Ok(parent.join(format!(".{}.{}-{}", name, tag, uuid::Uuid::new_v4().simple())))
}

/// Copy `source` into a staging sibling of `live_dir`, then swap it in by
/// rename. The live directory is never observed half-written.
pub fn swap_into_place(source: &Path, live_dir: &Path) -> Result<Vec<String>, DeployError> {
    let staging = sibling(live_dir, "staging")?;
    let files = copy_tree(source, &staging).map_err(|e| {
        let _ = fs::remove_dir_all(&staging);
        DeployError::CopyError(format!("staging {}: {}", staging.display(), e))
    })?;

    let retired = if live_dir.exists() {
        let retired = sibling(live_dir, "old")?;
        fs::rename(live_dir, &retired).map_err(|e| {
            let _ = fs::remove_dir_all(&staging);
            DeployError::CopyError(format!("retiring {}: {}", live_dir.display(), e))
        })?;
        Some(retired)
    } else {
        None
    };

    if let Err(e) = fs::rename(&staging, live_dir) {
        if let Some(retired) = &retired {
            if let Err(restore) = fs::rename(retired, live_dir) {
                warn!("Could not restore {}: {}", live_dir.display(), restore);
            }
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(DeployError::CopyError(format!(
            "swapping into {}: {}",
            live_dir.display(),
            e
        )));
    }

    if let Some(retired) = retired {
        if let Err(e) = fs::remove_dir_all(&retired) {
            warn!("Could not remove retired tree {}: {}", retired.display(), e);
        }
    }

    Ok(files)
}

/// Empty `live_dir` and copy `source` into it. Not transactional: a failure
/// mid-copy leaves a partial tree.
pub fn replace_in_place(source: &Path, live_dir: &Path) -> Result<Vec<String>, DeployError> {
    fs::create_dir_all(live_dir)?;
    remove_contents(live_dir)
        .map_err(|e| DeployError::CopyError(format!("clearing {}: {}", live_dir.display(), e)))?;
    copy_tree(source, live_dir)
        .map_err(|e| DeployError::CopyError(format!("copying into {}: {}", live_dir.display(), e)))
}

/// Place `source` over `live_dir` using `mode`, returning the file manifest
pub fn place(source: &Path, live_dir: &Path, mode: PlacementMode) -> Result<Vec<String>, DeployError> {
    match mode {
        PlacementMode::Swap => swap_into_place(source, live_dir),
        PlacementMode::InPlace => replace_in_place(source, live_dir),
    }
}

fn extract_and_place_sync(
    archive: &Path,
    work_dir: &Path,
    live_dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<String>, DeployError> {
    let root = work_dir.join("extract");
    extract_archive(archive, &root)?;

    let root = unwrap_nested_archive(&root)?;
    let target = discover_target(&root, options)?;
    let files = place(&target, live_dir, options.placement)?;

    info!("Placed {} files into {}", files.len(), live_dir.display());
    Ok(files)
}

/// Extract `archive` under `work_dir` and place the discovered tree over
/// `live_dir`
pub async fn extract_and_place(
    archive: &Path,
    work_dir: &Path,
    live_dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<String>, DeployError> {
    let archive = archive.to_owned();
    let work_dir = work_dir.to_owned();
    let live_dir = live_dir.to_owned();
    let options = options.clone();
    spawn_blocking(move || extract_and_place_sync(&archive, &work_dir, &live_dir, &options)).await?
}
