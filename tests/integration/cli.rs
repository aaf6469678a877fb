//! Black-box CLI coverage via the compiled `angelctl` binary: read-only and
//! side-effect-light subcommands only, nothing that forks a real
//! supervised daemon.
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn cmd(home: &std::path::Path, config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("angelctl").unwrap();
    cmd.env("HOME", home).arg("--config").arg(config);
    cmd
}

fn empty_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("angel.yaml");
    fs::write(&path, "version: \"1\"\nservices: {}\n").unwrap();
    path
}

#[test]
fn status_silent_reports_stopped_exit_code_with_no_services() {
    let home = tempdir().unwrap();
    let config = empty_config(home.path());

    // An empty service manifest is never "running", so the node rolls up to
    // STOPPED (exit 1) rather than OK - silent mode just suppresses output.
    cmd(home.path(), &config)
        .args(["status", "--format", "silent"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn status_default_reports_stopped_with_no_services_enabled() {
    let home = tempdir().unwrap();
    let config = empty_config(home.path());

    cmd(home.path(), &config)
        .arg("status")
        .assert()
        .stdout(predicate::str::contains("State:").and(predicate::str::contains("stopped")));
}

#[test]
fn package_versions_on_a_fresh_branch_prints_nothing_and_succeeds() {
    let home = tempdir().unwrap();
    let config = empty_config(home.path());

    cmd(home.path(), &config)
        .args(["package", "versions", "--branch", "main"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn package_check_version_reports_not_installed_for_unknown_version() {
    let home = tempdir().unwrap();
    let config = empty_config(home.path());

    cmd(home.path(), &config)
        .args(["package", "check-version", "--branch", "main", "--version", "9.9.9"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not installed"));
}

#[test]
fn missing_config_file_is_a_configuration_error() {
    let home = tempdir().unwrap();
    let missing = home.path().join("does-not-exist.yaml");

    cmd(home.path(), &missing)
        .arg("status")
        .assert()
        .failure()
        .code(3);
}

#[test]
fn sys_flag_without_root_is_rejected() {
    let home = tempdir().unwrap();
    let config = empty_config(home.path());

    if nix::unistd::Uid::effective().is_root() {
        return;
    }

    cmd(home.path(), &config)
        .args(["--sys", "status"])
        .assert()
        .failure()
        .code(4);
}
