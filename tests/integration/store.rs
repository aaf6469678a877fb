//! Content-Addressed Link Store integration coverage (spec §4.2, §8
//! testable properties 5-7): link counts, GC idempotence/safety-file
//! retention, and a `versions.rs` `create`/`delete` round trip.
use angeld::store;
use angeld::versions;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::time::Duration;
use tempfile::tempdir;

fn seed_source(dir: &std::path::Path) {
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("bin").join("app"), b"#!/bin/sh\necho hi\n").unwrap();
    fs::write(dir.join("readme.txt"), b"hello world").unwrap();
}

#[test]
fn installed_tree_shares_inode_with_store() {
    let root = tempdir().unwrap();
    let versions_dir = root.path().join("versions");
    let source = root.path().join("src");
    fs::create_dir_all(&source).unwrap();
    seed_source(&source);

    versions::create(&versions_dir, "stable", "1.0.0", &source, 0.0, None).expect("create");

    let installed = versions_dir.join("stable").join("1.0.0").join("bin").join("app");
    let store_dir = versions_dir.join(".angel_version_data").join("dedup_hardlinks");
    let installed_meta = fs::metadata(&installed).expect("installed file");
    assert!(installed_meta.nlink() >= 2, "installed file must be hardlinked into the store");

    let mut found_match = false;
    for entry in fs::read_dir(&store_dir).expect("store dir") {
        let entry = entry.unwrap();
        if entry.file_name() == ".dedup_safety_check" || entry.file_name() == ".dedup_safety_check-2" {
            continue;
        }
        let meta = entry.metadata().unwrap();
        if meta.ino() == installed_meta.ino() {
            found_match = true;
        }
    }
    assert!(found_match, "installed file must share an inode with exactly one store entry");
}

#[test]
fn gc_is_idempotent_and_keeps_safety_file() {
    let root = tempdir().unwrap();
    let store_dir = root.path().join("store");
    store::ensure_init(&store_dir).expect("init");

    let removed_first = store::gc(&store_dir).expect("first gc");
    let removed_second = store::gc(&store_dir).expect("second gc");
    assert_eq!(removed_first, removed_second, "gc on an unchanged store must remove the same count (zero)");
    assert!(store_dir.join(".dedup_safety_check").exists(), "gc must never remove the safety file");
}

#[test]
fn delete_then_recreate_yields_same_tree_contents() {
    let root = tempdir().unwrap();
    let versions_dir = root.path().join("versions");
    let source = root.path().join("src");
    fs::create_dir_all(&source).unwrap();
    seed_source(&source);

    versions::create(&versions_dir, "stable", "1.0.0", &source, 0.0, None).expect("create");
    let tree = versions_dir.join("stable").join("1.0.0");
    let before = fs::read(tree.join("bin").join("app")).unwrap();

    versions::delete(&versions_dir, "stable", "1.0.0", true).expect("delete");
    assert!(!tree.exists());

    versions::create(&versions_dir, "stable", "1.0.0", &source, 0.0, None).expect("recreate");
    let after = fs::read(tree.join("bin").join("app")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn gc_stale_respects_keep_and_limit() {
    let root = tempdir().unwrap();
    let versions_dir = root.path().join("versions");
    let source = root.path().join("src");
    fs::create_dir_all(&source).unwrap();
    seed_source(&source);

    for v in ["1.0.0", "1.1.0", "1.2.0", "1.3.0"] {
        versions::create(&versions_dir, "stable", v, &source, 0.0, None).expect("create");
    }
    versions::activate(&versions_dir, "stable", "1.3.0", true, Duration::ZERO, false).expect("activate");

    let deleted = versions::gc_stale(&versions_dir, "stable", 1, 1).expect("gc_stale");
    assert_eq!(deleted.len(), 1, "limit caps deletions at one per call");
    assert!(!deleted.contains(&"1.3.0".to_string()), "the active default is never a gc candidate");

    let remaining = versions::list_versions(&versions_dir, "stable").expect("list");
    assert_eq!(remaining.len(), 3);
}
