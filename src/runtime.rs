//! Resolves the node runtime layout (spec §6: `LOCK_DIR`, `LOG_DIR`, `DATA_DIR`,
//! `RUN_DIR`, `versions_dir`) based on the current privilege mode.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

/// Runtime mode that determines where state and logs should be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Standard userspace mode; state lives under the invoking user's home directory.
    User,
    /// System mode; state is stored in system directories that require elevated privileges.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    lock_dir: PathBuf,
    log_dir: PathBuf,
    data_dir: PathBuf,
    run_dir: PathBuf,
    versions_dir: PathBuf,
    deploy_user: Option<String>,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let base = home.join(".local/share/angel");
        Self {
            mode: RuntimeMode::User,
            lock_dir: base.join("lock"),
            log_dir: base.join("logs"),
            data_dir: base.join("data"),
            run_dir: base.join("run"),
            versions_dir: base.join("versions"),
            deploy_user: None,
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            lock_dir: PathBuf::from("/var/lock/angel"),
            log_dir: PathBuf::from("/var/log/angel"),
            data_dir: PathBuf::from("/var/lib/angel"),
            run_dir: PathBuf::from("/var/run/angel"),
            versions_dir: PathBuf::from("/opt/angel/versions"),
            deploy_user: None,
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent calls
/// overwrite the active configuration, allowing different invocations within the
/// same process (e.g. supervisor forks) to operate with the correct context.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    let deploy_user = guard.deploy_user.clone();
    let mut context = RuntimeContext::from_mode(mode);
    context.deploy_user = deploy_user;
    *guard = context;
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    let deploy_user = guard.deploy_user.clone();
    let mut context = RuntimeContext::from_user_home(home.to_path_buf());
    context.deploy_user = deploy_user;
    *guard = context;
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock().read().expect("runtime context poisoned").mode
}

/// Returns `LOCK_DIR`: home of named locks, per-service supervisor pidfiles, and
/// the node lifecycle state file.
pub fn lock_dir() -> PathBuf {
    context_lock().read().expect("runtime context poisoned").lock_dir.clone()
}

/// Returns `LOG_DIR`: home of rotatable service stdout/stderr logs.
pub fn log_dir() -> PathBuf {
    context_lock().read().expect("runtime context poisoned").log_dir.clone()
}

/// Returns `DATA_DIR`: home of per-service data directories, maintenance marker,
/// and the decommissioned marker.
pub fn data_dir() -> PathBuf {
    context_lock().read().expect("runtime context poisoned").data_dir.clone()
}

/// Returns `RUN_DIR`: scratch directory cleared on `stop`.
pub fn run_dir() -> PathBuf {
    context_lock().read().expect("runtime context poisoned").run_dir.clone()
}

/// Returns `versions_dir`: root of the versioned installer's branch/version tree.
pub fn versions_dir() -> PathBuf {
    context_lock().read().expect("runtime context poisoned").versions_dir.clone()
}

/// Overrides `versions_dir` directly (used by `package` subcommands that take an
/// explicit `--versions-dir`, and by tests).
pub fn set_versions_dir(path: PathBuf) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.versions_dir = path;
}

/// Records the `LC_DEPLOY_USER` value observed at startup (spec §6), so every
/// subsequent state-transition log line can carry it as a field. The caller is
/// responsible for then stripping the variable from the process environment.
pub fn set_deploy_user(user: Option<String>) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.deploy_user = user;
}

/// Returns the recorded deploy user, if any.
pub fn deploy_user() -> Option<String> {
    context_lock().read().expect("runtime context poisoned").deploy_user.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn user_mode_uses_home_scoped_paths() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        let home = temp.path();
        let original_home = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }

        init(RuntimeMode::User);

        let base = home.join(".local/share/angel");
        assert_eq!(lock_dir(), base.join("lock"));
        assert_eq!(log_dir(), base.join("logs"));
        assert_eq!(data_dir(), base.join("data"));
        assert_eq!(run_dir(), base.join("run"));
        assert_eq!(versions_dir(), base.join("versions"));

        if let Some(previous) = original_home {
            unsafe { env::set_var("HOME", previous) };
        } else {
            unsafe { env::remove_var("HOME") };
        }
    }

    #[test]
    fn system_mode_uses_var_directories() {
        let _guard = env_lock();
        init(RuntimeMode::System);

        assert_eq!(lock_dir(), PathBuf::from("/var/lock/angel"));
        assert_eq!(log_dir(), PathBuf::from("/var/log/angel"));
        assert_eq!(data_dir(), PathBuf::from("/var/lib/angel"));
    }

    #[test]
    fn deploy_user_round_trips() {
        let _guard = env_lock();
        set_deploy_user(Some("alice".into()));
        assert_eq!(deploy_user(), Some("alice".into()));
        set_deploy_user(None);
        assert_eq!(deploy_user(), None);
    }
}
