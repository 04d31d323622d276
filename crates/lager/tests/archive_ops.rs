//! Diff, apply and change-list operations through the driver.

mod common;

use std::fs;

use common::driver_in;
use lager::ChangeKind;
use lager_common::paths;

#[test]
fn diff_streams_layer_content_without_bookkeeping() {
    let temp = tempfile::tempdir().unwrap();
    let (driver, _) = driver_in(temp.path());
    let image_root = temp.path().join("image-layers");

    driver.create("A", "", true).unwrap();
    let diff_dir = paths::diff_dir(&image_root, "A");
    fs::create_dir_all(diff_dir.join("etc")).unwrap();
    fs::write(diff_dir.join("etc/hostname"), "box\n").unwrap();
    fs::write(diff_dir.join(".wh..wh.aufs"), "").unwrap();

    let mut archive = tar::Archive::new(driver.diff("A", "").unwrap());
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|entry| {
            entry
                .unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["etc", "etc/hostname"]);
}

#[test]
fn apply_diff_extracts_and_reports_size() {
    let temp = tempfile::tempdir().unwrap();
    let (driver, _) = driver_in(temp.path());
    let image_root = temp.path().join("image-layers");

    driver.create("src", "", true).unwrap();
    let src_diff = paths::diff_dir(&image_root, "src");
    fs::write(src_diff.join("payload"), [7u8; 256]).unwrap();

    driver.create("dst", "", true).unwrap();
    let stream = driver.diff("src", "").unwrap();
    let size = driver.apply_diff("dst", "", stream).unwrap();

    assert_eq!(size, 256);
    assert_eq!(driver.diff_size("dst", "").unwrap(), 256);
    assert_eq!(
        fs::read(paths::diff_dir(&image_root, "dst").join("payload")).unwrap(),
        vec![7u8; 256]
    );
}

#[test]
fn changes_compare_against_the_parent_chain() {
    let temp = tempfile::tempdir().unwrap();
    let (driver, _) = driver_in(temp.path());
    let image_root = temp.path().join("image-layers");

    driver.create("A", "", true).unwrap();
    let parent_diff = paths::diff_dir(&image_root, "A");
    fs::write(parent_diff.join("config"), "v1").unwrap();
    fs::write(parent_diff.join("obsolete"), "v1").unwrap();

    driver.create("B", "A", true).unwrap();
    let child_diff = paths::diff_dir(&image_root, "B");
    fs::write(child_diff.join("config"), "v2").unwrap();
    fs::write(child_diff.join(".wh.obsolete"), "").unwrap();
    fs::write(child_diff.join("brand-new"), "x").unwrap();

    let changes = driver.changes("B", "A").unwrap();
    let summary: Vec<(String, ChangeKind)> = changes
        .iter()
        .map(|change| (change.path.display().to_string(), change.kind))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("brand-new".to_string(), ChangeKind::Added),
            ("config".to_string(), ChangeKind::Modified),
            ("obsolete".to_string(), ChangeKind::Deleted),
        ]
    );
}

#[test]
fn empty_layer_has_zero_diff_size() {
    let temp = tempfile::tempdir().unwrap();
    let (driver, _) = driver_in(temp.path());

    driver.create("empty", "", true).unwrap();
    assert_eq!(driver.diff_size("empty", "").unwrap(), 0);
}
