//! Node lock and named locks (spec §5): pidfiles under `LOCK_DIR` whose
//! owning pid must be alive for the lock to be held. A lock whose owner has
//! died is stale and self-heals for the next acquirer.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::constants::{DEFAULT_NODE_LOCK_NAME, LOCK_DEFAULT_DEADLINE, LOCK_POLL};
use crate::error::OrchestratorError;
use crate::pidfile;
use crate::runtime;

/// A held named lock; releases on drop.
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Releases the lock early. Also happens automatically on drop.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = pidfile::release(&self.path) {
            warn!("failed to release lock '{}': {err}", self.path.display());
        }
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

fn lock_path(name: &str) -> PathBuf {
    runtime::lock_dir().join(format!("angel-lock-{name}.lock"))
}

/// Attempts to acquire named lock `name` once, without polling. Returns
/// `Ok(None)` if another live pid holds it.
pub fn try_acquire(name: &str) -> Result<Option<LockGuard>, OrchestratorError> {
    let path = lock_path(name);
    let existing = pidfile::read(&path)?;
    if let Some(owner) = existing.pid {
        let my_pid = std::process::id() as i32;
        if owner != my_pid {
            return Ok(None);
        }
    }

    let my_pid = std::process::id() as i32;
    match pidfile::write(&path, Some(my_pid), &BTreeMap::new()) {
        Ok(()) => Ok(Some(LockGuard {
            path,
            released: false,
        })),
        Err(crate::error::PidFileError::OwnedByOther { owner, .. }) => {
            info!("lock '{name}' contested by live pid {owner}");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Acquires named lock `name`, polling every [`LOCK_POLL`] until `deadline`
/// elapses.
pub fn acquire(name: &str, deadline: Duration) -> Result<LockGuard, OrchestratorError> {
    let start = Instant::now();
    loop {
        if let Some(guard) = try_acquire(name)? {
            return Ok(guard);
        }

        if start.elapsed() >= deadline {
            let path = lock_path(name);
            let holder = pidfile::read(&path)?.pid.unwrap_or(-1);
            return Err(OrchestratorError::LockContention {
                name: name.to_string(),
                holder,
            });
        }

        thread::sleep(LOCK_POLL);
    }
}

/// Acquires the node lock (default name `angel-service`) with the default
/// deadline. Required before `start`/`stop`/`restart`/`reload`/`repair`/
/// `rotate-logs`/`mode`/`conf`.
pub fn acquire_node_lock() -> Result<LockGuard, OrchestratorError> {
    acquire(DEFAULT_NODE_LOCK_NAME, LOCK_DEFAULT_DEADLINE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{self as rt, RuntimeMode};
    use crate::test_utils::env_lock;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        let lock = try_acquire("test-lock").expect("acquire").expect("free");
        lock.release();

        assert!(try_acquire("test-lock").expect("acquire").is_some());
    }

    #[test]
    fn stale_lock_self_heals() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        let path = lock_path("stale-lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "999999\n").unwrap();

        assert!(try_acquire("stale-lock").expect("acquire").is_some());
    }

    #[test]
    fn contested_lock_reports_holder() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        let path = lock_path("busy-lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "1\n").unwrap();

        let err = acquire("busy-lock", Duration::from_millis(10))
            .expect_err("pid 1 should be alive and contest the lock");
        match err {
            OrchestratorError::LockContention { holder, .. } => assert_eq!(holder, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
