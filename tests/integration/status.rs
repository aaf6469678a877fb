//! Status Aggregator roll-up (spec §4.8): drives `aggregate()` against a mix
//! of running/not-running services and checks the merge rules that produce
//! WARN for an unexpected extra service and ERROR for a missing enabled one.
use angeld::config::{Classification, Config, ServiceConfig};
use angeld::orchestrator::{Orchestrator, supervisor_pidfile_path};
use angeld::pidfile;
use angeld::runtime::{self as rt, RuntimeMode};
use angeld::status::{self, Severity};
use angeld::test_utils::env_lock;
use std::collections::HashMap;
use tempfile::tempdir;

fn service(command: &str, classification: Classification) -> ServiceConfig {
    ServiceConfig { command: command.to_string(), classification, ..ServiceConfig::default() }
}

fn mark_running(name: &str) {
    let path = supervisor_pidfile_path(name);
    pidfile::write(&path, Some(std::process::id() as i32), &Default::default()).unwrap();
}

#[test]
fn all_enabled_services_running_is_ok() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let mut services = HashMap::new();
    services.insert("web".to_string(), service("true", Classification::On));
    let config = Config { version: "1".into(), services, project_dir: None, env: None };
    mark_running("web");

    let orchestrator = Orchestrator::new(config.clone());
    let node = status::aggregate(&orchestrator, &config, false, false, None, false);
    assert_eq!(node.overall, Severity::RunningOk);
    assert!(node.missing.is_empty());
    assert!(node.running_unexpectedly.is_empty());
}

#[test]
fn unexpected_running_service_is_warn() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let mut services = HashMap::new();
    services.insert("web".to_string(), service("true", Classification::On));
    services.insert("db".to_string(), service("true", Classification::Off));
    let config = Config { version: "1".into(), services, project_dir: None, env: None };
    mark_running("web");
    mark_running("db");

    let orchestrator = Orchestrator::new(config.clone());
    let node = status::aggregate(&orchestrator, &config, false, false, None, false);
    assert_eq!(node.overall, Severity::Warn);
    assert_eq!(node.running_unexpectedly, vec!["db".to_string()]);
}

#[test]
fn missing_enabled_service_while_others_run_is_error() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let mut services = HashMap::new();
    services.insert("web".to_string(), service("true", Classification::On));
    services.insert("worker".to_string(), service("true", Classification::On));
    let config = Config { version: "1".into(), services, project_dir: None, env: None };
    mark_running("web");

    let orchestrator = Orchestrator::new(config.clone());
    let node = status::aggregate(&orchestrator, &config, false, false, None, false);
    assert_eq!(node.overall, Severity::Error);
    assert_eq!(node.missing, vec!["worker".to_string()]);
}

#[test]
fn decommissioned_flag_overrides_everything() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let mut services = HashMap::new();
    services.insert("web".to_string(), service("true", Classification::On));
    let config = Config { version: "1".into(), services, project_dir: None, env: None };
    mark_running("web");

    let orchestrator = Orchestrator::new(config.clone());
    let node = status::aggregate(&orchestrator, &config, true, false, None, false);
    assert_eq!(node.overall, Severity::Decommissioned);
}

#[test]
fn subset_filters_reported_services() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let mut services = HashMap::new();
    services.insert("web".to_string(), service("true", Classification::On));
    services.insert("worker".to_string(), service("true", Classification::On));
    let config = Config { version: "1".into(), services, project_dir: None, env: None };
    mark_running("web");
    mark_running("worker");

    let orchestrator = Orchestrator::new(config.clone());
    let subset = vec!["web".to_string()];
    let node = status::aggregate(&orchestrator, &config, false, false, Some(&subset), false);
    assert_eq!(node.services.len(), 1);
    assert_eq!(node.services[0].service_name, "web");
}
