//! Versioned Installer end-to-end scenarios (spec §8 scenario 4: upgrade
//! forward then rollback) plus pinning gating unforced default changes.
use angeld::error::VersionError;
use angeld::versions;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn seed_source(dir: &std::path::Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("app"), b"payload").unwrap();
}

#[test]
fn upgrade_forward_then_rollback_then_second_rollback_fails() {
    let root = tempdir().unwrap();
    let versions_dir = root.path().join("versions");
    let source = root.path().join("src");
    seed_source(&source);

    versions::create(&versions_dir, "main", "100", &source, 0.0, None).expect("add 100");
    versions::activate(&versions_dir, "main", "100", false, Duration::ZERO, false).expect("activate 100");

    versions::create(&versions_dir, "main", "101", &source, 0.0, None).expect("add 101");
    versions::activate(&versions_dir, "main", "101", false, Duration::ZERO, false).expect("activate 101");
    assert_eq!(versions::branch_default_version(&versions_dir, "main"), Some("101".to_string()));

    versions::rollback(&versions_dir, "main", "101").expect("rollback from 101");
    assert_eq!(versions::branch_default_version(&versions_dir, "main"), Some("100".to_string()));

    let second = versions::rollback(&versions_dir, "main", "101");
    assert!(matches!(second, Err(VersionError::NoRollbackPointer { .. })), "101 is no longer the default, its rollback pointer was not re-recorded by the first rollback");
}

#[test]
fn pinning_blocks_activation_without_force() {
    let root = tempdir().unwrap();
    let versions_dir = root.path().join("versions");
    let source = root.path().join("src");
    seed_source(&source);

    versions::create(&versions_dir, "main", "1.0", &source, 0.0, None).expect("create 1.0");
    versions::create(&versions_dir, "main", "2.0", &source, 0.0, None).expect("create 2.0");
    versions::activate(&versions_dir, "main", "1.0", false, Duration::ZERO, false).expect("activate 1.0");

    versions::set_pinned(&versions_dir, true, Some("frozen for maintenance")).expect("pin");
    assert!(versions::is_pinned(&versions_dir));

    let blocked = versions::activate(&versions_dir, "main", "2.0", false, Duration::ZERO, false);
    assert!(matches!(blocked, Err(VersionError::Pinned)));

    versions::activate(&versions_dir, "main", "2.0", false, Duration::ZERO, true).expect("forced activate");
    assert_eq!(versions::branch_default_version(&versions_dir, "main"), Some("2.0".to_string()));

    versions::set_pinned(&versions_dir, false, None).expect("unpin");
    assert!(!versions::is_pinned(&versions_dir));
}

#[test]
fn set_default_branch_switches_global_default_without_installing() {
    let root = tempdir().unwrap();
    let versions_dir = root.path().join("versions");
    let source = root.path().join("src");
    seed_source(&source);

    versions::create(&versions_dir, "main", "1.0", &source, 0.0, None).expect("create main");
    versions::create(&versions_dir, "canary", "1.0", &source, 0.0, None).expect("create canary");

    assert_eq!(versions::global_default_branch(&versions_dir), Some("main".to_string()));

    versions::set_default_branch(&versions_dir, "canary", false).expect("switch branch");
    assert_eq!(versions::global_default_branch(&versions_dir), Some("canary".to_string()));

    let unknown = versions::set_default_branch(&versions_dir, "nightly", false);
    assert!(matches!(unknown, Err(VersionError::NotInstalled { .. })));
}
