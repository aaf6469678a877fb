//! Restart-on-crash lifecycle (spec §8 scenario 3): killing the supervised
//! child out from under the supervisor must produce a new child and bump
//! the pidfile's `start_count` extra, driven through a real fork via
//! `Orchestrator::start` rather than calling `supervisor::run` in-process
//! (it never returns and would tear down the test binary).
use angeld::config::{Classification, Config, ServiceConfig};
use angeld::orchestrator::{Orchestrator, supervisor_pidfile_path};
use angeld::pidfile;
use angeld::runtime::{self as rt, RuntimeMode};
use angeld::test_utils::env_lock;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
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

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = probe() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn killed_child_is_respawned_with_incremented_start_count() {
    let _guard = env_lock();
    let dir = tempdir().unwrap();
    rt::init_with_test_home(dir.path());
    rt::init(RuntimeMode::User);

    let config = config_with("crasher", "/bin/sleep 60");
    let orchestrator = Orchestrator::new(config);
    orchestrator.start(Some(Duration::from_secs(5))).expect("start");

    let pidfile_path = supervisor_pidfile_path("crasher");
    let first = wait_for(
        || {
            let record = pidfile::read(&pidfile_path).ok()?;
            let child_pid: i32 = record.extras.get("child_pid")?.parse().ok()?;
            Some(child_pid)
        },
        Duration::from_secs(5),
    )
    .expect("initial child_pid recorded");

    signal::kill(Pid::from_raw(first), Signal::SIGKILL).expect("kill child");

    // Backoff before the first respawn is at least BACKOFF_MIN_SECS (5s); give
    // it generous headroom rather than pinning the exact constant here.
    let respawned = wait_for(
        || {
            let record = pidfile::read(&pidfile_path).ok()?;
            let child_pid: i32 = record.extras.get("child_pid")?.parse().ok()?;
            let start_count: u64 = record.extras.get("start_count")?.parse().ok()?;
            (child_pid != first && start_count >= 2).then_some(child_pid)
        },
        Duration::from_secs(15),
    );
    assert!(respawned.is_some(), "supervisor must respawn a crashed child with a bumped start_count");

    orchestrator.stop(false).expect("cleanup stop");
}
