//! End-to-end orchestrator lifecycle (spec §8 scenario 1, "cold start"):
//! `start()` forks a real supervised process and leaves a live pidfile
//! behind; `stop()` tears it down again. Exercises the real double-fork
//! path through `launcher::fork_daemon`, not a mock.
use angeld::config::{Classification, Config, ServiceConfig};
use angeld::orchestrator::{Orchestrator, VerbOutcome, supervisor_pidfile_path};
use angeld::pidfile;
use angeld::runtime::{self as rt, RuntimeMode};
use angeld::test_utils::env_lock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn config_with(name: &str, command: &str) -> Config {
    let mut services = HashMap::new();
    services.insert(
        name.to_string(),
        ServiceConfig {
            command: command.to_string(),
            classification: Classification::On,
            ..ServiceConfig::default()
        },
    );
    Config { version: "1".into(), services, project_dir: None, env: None }
}

fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn start_leaves_a_live_pidfile_and_stop_clears_it() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let config = config_with("napper", "/bin/sleep 30");
    let orchestrator = Orchestrator::new(config);

    let outcomes = orchestrator.start(Some(Duration::from_secs(5))).expect("start");
    assert!(outcomes.iter().all(|(_, o)| matches!(o, VerbOutcome::Ok)), "{outcomes:?}");

    let pidfile_path = supervisor_pidfile_path("napper");
    let live = wait_until(
        || pidfile::read(&pidfile_path).map(|r| r.pid.is_some()).unwrap_or(false),
        Duration::from_secs(5),
    );
    assert!(live, "supervisor must record a live pid after start");

    let outcomes = orchestrator.stop(false).expect("stop");
    assert!(outcomes.iter().all(|(_, o)| matches!(o, VerbOutcome::Ok)), "{outcomes:?}");

    let gone = wait_until(
        || !pidfile::read(&pidfile_path).map(|r| r.pid.is_some()).unwrap_or(false),
        Duration::from_secs(5),
    );
    assert!(gone, "pidfile must no longer report a live pid after stop");
}

#[test]
fn starting_an_already_running_service_is_a_noop_ok() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let config = config_with("napper2", "/bin/sleep 30");
    let orchestrator = Orchestrator::new(config.clone());

    orchestrator.start(Some(Duration::from_secs(5))).expect("first start");
    let pidfile_path = supervisor_pidfile_path("napper2");
    wait_until(
        || pidfile::read(&pidfile_path).map(|r| r.pid.is_some()).unwrap_or(false),
        Duration::from_secs(5),
    );

    let second = Orchestrator::new(config);
    let outcomes = second.start(Some(Duration::from_secs(5))).expect("second start");
    assert!(outcomes.iter().all(|(_, o)| matches!(o, VerbOutcome::Ok)));

    second.stop(false).expect("cleanup stop");
}
