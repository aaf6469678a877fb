//! Cross-module pidfile coverage: the orchestrator's supervisor pidfile
//! paths, stale-pid detection, and the extras map surviving a write/read
//! round trip the way `supervisor.rs` relies on it.
use angeld::orchestrator::supervisor_pidfile_path;
use angeld::pidfile;
use angeld::runtime::{self as rt, RuntimeMode};
use angeld::test_utils::env_lock;
use std::collections::BTreeMap;
use tempfile::tempdir;

#[test]
fn round_trip_preserves_extras() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("web.lock");

    let mut extras = BTreeMap::new();
    extras.insert("child_pid".to_string(), "4242".to_string());
    extras.insert("start_count".to_string(), "1".to_string());

    pidfile::write(&path, Some(std::process::id() as i32), &extras).expect("write");
    let record = pidfile::read(&path).expect("read");

    assert_eq!(record.pid, Some(std::process::id() as i32));
    assert_eq!(record.extras, extras);
}

#[test]
fn stale_pid_is_not_reported_as_running() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("web.lock");

    // pid 1 always exists on a real system but is never owned by us; use an
    // implausibly large pid instead to model "process no longer exists".
    let stale_pid = 999_999_999;
    std::fs::write(&path, format!("{stale_pid}\n")).unwrap();

    let record = pidfile::read(&path).expect("read");
    assert_eq!(record.pid, None, "a dead pid must not be reported as live");
}

#[test]
fn missing_pidfile_reads_as_empty_record() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let path = supervisor_pidfile_path("never-started");
    let record = pidfile::read(&path).expect("read on missing file");
    assert_eq!(record.pid, None);
    assert!(record.extras.is_empty());
}
