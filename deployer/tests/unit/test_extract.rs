//! Extraction pipeline tests

use std::fs;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use deployer::deploy::extract::{
    detect_kind, discover_target, extract_and_place, ArchiveKind, ExtractOptions,
};
use deployer::storage::settings::PlacementMode;

use crate::common::zip_bytes;

fn options(unit: &str) -> ExtractOptions {
    ExtractOptions {
        unit_name: unit.to_string(),
        marker_files: vec!["style.css".to_string(), "theme.json".to_string()],
        placement: PlacementMode::Swap,
    }
}

fn tar_gz(path: &Path, files: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn touch(root: &Path, relative: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, relative).unwrap();
}

#[tokio::test]
async fn test_double_archive_is_unwrapped() {
    let dir = tempfile::tempdir().unwrap();
    let inner = zip_bytes(&[("mytheme/style.css", "inner"), ("mytheme/functions.php", "<?php")]);

    // outer archive holds the real one plus platform junk
    let mut outer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let zip_options = zip::write::SimpleFileOptions::default();
    outer.start_file("theme.zip", zip_options).unwrap();
    std::io::Write::write_all(&mut outer, &inner).unwrap();
    outer
        .start_file("__MACOSX/._theme.zip", zip_options)
        .unwrap();
    std::io::Write::write_all(&mut outer, b"junk").unwrap();
    let outer = outer.finish().unwrap().into_inner();

    let archive = dir.path().join("download");
    fs::write(&archive, outer).unwrap();
    let live = dir.path().join("live");

    let files = extract_and_place(&archive, &dir.path().join("work"), &live, &options("mytheme"))
        .await
        .unwrap();
    assert_eq!(files, vec!["functions.php", "style.css"]);
    assert_eq!(fs::read_to_string(live.join("style.css")).unwrap(), "inner");
}

#[tokio::test]
async fn test_source_snapshot_tarball() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("download");
    tar_gz(
        &archive,
        &[
            ("acme-storefront-abc123/README.md", "readme"),
            ("acme-storefront-abc123/theme/style.css", "css"),
            ("acme-storefront-abc123/theme/parts/header.html", "<header>"),
        ],
    );
    assert_eq!(detect_kind(&archive).unwrap(), ArchiveKind::TarGz);

    let live = dir.path().join("live");
    let files = extract_and_place(&archive, &dir.path().join("work"), &live, &options(""))
        .await
        .unwrap();
    assert_eq!(files, vec!["parts/header.html", "style.css"]);
    assert!(!live.join("README.md").exists());
}

#[test]
fn test_unit_name_beats_markers() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "other/style.css");
    touch(dir.path(), "MyTheme/index.php");

    let target = discover_target(dir.path(), &options("mytheme")).unwrap();
    assert_eq!(target, dir.path().join("MyTheme"));
}

#[test]
fn test_markers_found_breadth_first() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "a/notes.txt");
    touch(dir.path(), "b/c/d/e/style.css");
    touch(dir.path(), "z/y/theme.json");

    let target = discover_target(dir.path(), &options("")).unwrap();
    assert_eq!(target, dir.path().join("z/y"));
}

#[test]
fn test_markers_beyond_depth_fall_back_to_first_dir() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "b/c/d/e/style.css");
    touch(dir.path(), "a/notes.txt");

    let target = discover_target(dir.path(), &options("")).unwrap();
    assert_eq!(target, dir.path().join("a"));
}

#[tokio::test]
async fn test_in_place_placement() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("download");
    fs::write(&archive, zip_bytes(&[("style.css", "fresh")])).unwrap();

    let live = dir.path().join("live");
    touch(&live, "stale.php");

    let mut in_place = options("");
    in_place.placement = PlacementMode::InPlace;
    let files = extract_and_place(&archive, &dir.path().join("work"), &live, &in_place)
        .await
        .unwrap();
    assert_eq!(files, vec!["style.css"]);
    assert!(!live.join("stale.php").exists());
}
