//! Supervisor (spec §4.6): the state engine for one supervised child
//! process. Owns a single pidfile that is simultaneously its own liveness
//! record and the child's tracking record (`child_pid`, `child_start_time`,
//! `start_count` extras).
use libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::constants::{
    BACKOFF_JITTER_SECS, BACKOFF_MAX_SECS, BACKOFF_MIN_SECS, BACKOFF_RESET_SECS,
    BACKOFF_STEP_SECS, LOW_SPACE_RETRY, MIN_FREE_SPACE_BYTES,
};
use crate::error::SupervisorError;
use crate::launcher::{self, LaunchRequest};
use crate::pidfile;
use crate::privilege::PrivilegeContext;
use crate::runtime;

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);
static ROTATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static FORWARD_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(raw: c_int) {
    if raw == Signal::SIGTERM as c_int {
        TERM_REQUESTED.store(true, Ordering::SeqCst);
    } else if raw == Signal::SIGWINCH as c_int {
        ROTATE_REQUESTED.store(true, Ordering::SeqCst);
    } else {
        FORWARD_SIGNAL.store(raw, Ordering::SeqCst);
    }
}

const FORWARDED_SIGNALS: [Signal; 4] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGUSR1, Signal::SIGUSR2];

fn install_signal_handlers() -> Result<(), SupervisorError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGTERM, &action).map_err(SupervisorError::Signal)?;
        signal::sigaction(Signal::SIGWINCH, &action).map_err(SupervisorError::Signal)?;
        signal::sigaction(Signal::SIGQUIT, &action).map_err(SupervisorError::Signal)?;
        for sig in FORWARDED_SIGNALS {
            signal::sigaction(sig, &action).map_err(SupervisorError::Signal)?;
        }
    }
    Ok(())
}

fn reset_signal_handlers_to_default() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in [
        Signal::SIGTERM,
        Signal::SIGWINCH,
        Signal::SIGQUIT,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        unsafe {
            let _ = signal::sigaction(sig, &default);
        }
    }
}

/// Everything the Supervisor needs to run and respawn one service.
pub struct SupervisorSpec {
    pub service_name: String,
    pub pidfile_path: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub chdir: Option<PathBuf>,
    pub privilege: PrivilegeContext,
    pub oom_adj: Option<i32>,
    pub log_basepath: Option<PathBuf>,
    pub stop_signal: Signal,
}

struct BackoffState {
    continuous_failures: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self { continuous_failures: 0 }
    }

    /// Updates the counter given how long the last child run lasted, and
    /// returns the sleep duration before the next respawn.
    fn next_sleep(&mut self, last_run: Duration) -> Duration {
        if last_run.as_secs() >= BACKOFF_RESET_SECS {
            self.continuous_failures = 0;
            return Duration::ZERO;
        }

        self.continuous_failures += 1;
        let n = self.continuous_failures as u64;
        let scheduled = (BACKOFF_MIN_SECS + (n - 1) * BACKOFF_STEP_SECS).min(BACKOFF_MAX_SECS);
        let base = Duration::from_secs(scheduled).saturating_sub(last_run);
        let jitter_secs = rand::rng().random_range(0..=BACKOFF_JITTER_SECS);
        base + Duration::from_secs(jitter_secs)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn free_space_ok(path: &Path) -> bool {
    free_bytes(path).map(|free| free >= MIN_FREE_SPACE_BYTES).unwrap_or(true)
}

fn free_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let res = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if res != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

fn pidfile_extras(child_pid: Option<i32>, child_start_time: u64, start_count: u64) -> BTreeMap<String, String> {
    let mut extras = BTreeMap::new();
    if let Some(pid) = child_pid {
        extras.insert("child_pid".to_string(), pid.to_string());
    }
    extras.insert("child_start_time".to_string(), child_start_time.to_string());
    extras.insert("start_count".to_string(), start_count.to_string());
    extras
}

/// Runs the Supervisor main loop for `spec`, never returning: on exit it
/// removes the pidfile and calls `_exit` directly, bypassing any parent
/// interpreter cleanup.
pub fn run(spec: SupervisorSpec) -> ! {
    let my_pid = std::process::id() as i32;

    if let Err(err) = pidfile::write(&spec.pidfile_path, Some(my_pid), &pidfile_extras(None, 0, 0)) {
        warn!("supervisor failed to claim pidfile '{}': {err}", spec.pidfile_path.display());
        std::process::exit(1);
    }

    crate::privilege::harden_supervisor_oom_score();

    if let Err(err) = install_signal_handlers() {
        warn!("supervisor failed to install signal handlers: {err}");
    }

    let mut backoff = BackoffState::new();
    let mut start_count: u64 = 0;
    let mut child_pid: Option<Pid> = None;
    let mut last_spawn = Instant::now();

    'main: loop {
        if TERM_REQUESTED.load(Ordering::SeqCst) {
            break;
        }

        match pidfile::read(&spec.pidfile_path) {
            Ok(record) if record.pid == Some(my_pid) => {}
            _ => {
                warn!("pidfile for '{}' no longer names this supervisor; another supervisor took over", spec.service_name);
                break;
            }
        }

        if !all_partitions_have_space() {
            std::thread::sleep(LOW_SPACE_RETRY);
            continue;
        }

        if child_pid.is_none() {
            start_count += 1;
            last_spawn = Instant::now();
            match spawn_child(&spec) {
                Ok(pid) => {
                    child_pid = Some(pid);
                    let _ = pidfile::write(
                        &spec.pidfile_path,
                        Some(my_pid),
                        &pidfile_extras(Some(pid.as_raw()), now_unix(), start_count),
                    );
                }
                Err(err) => {
                    warn!("failed to spawn '{}': {err}", spec.service_name);
                    std::thread::sleep(Duration::from_secs(BACKOFF_MIN_SECS));
                    continue;
                }
            }
        }

        let pid = child_pid.expect("child_pid set above");
        let wait_result = waitpid(pid, None);

        if TERM_REQUESTED.load(Ordering::SeqCst) {
            request_cooperative_stop(&spec, pid);
        }
        if ROTATE_REQUESTED.swap(false, Ordering::SeqCst) {
            info!("log rotation requested for '{}'", spec.service_name);
        }
        let forwarded = FORWARD_SIGNAL.swap(0, Ordering::SeqCst);
        if forwarded != 0 {
            let _ = signal::kill(pid, Signal::try_from(forwarded).ok());
        }

        match wait_result {
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                child_pid = None;
                if TERM_REQUESTED.load(Ordering::SeqCst) {
                    break 'main;
                }
                let run_time = last_spawn.elapsed();
                let sleep_for = backoff.next_sleep(run_time);
                if !sleep_for.is_zero() {
                    interruptible_sleep(sleep_for);
                }
            }
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::EINTR) => {
                continue;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!("waitpid failed for '{}': {err}", spec.service_name);
                child_pid = None;
            }
        }
    }

    if let Some(pid) = child_pid {
        while waitpid(pid, Some(WaitPidFlag::WNOHANG)).map(|s| s == WaitStatus::StillAlive).unwrap_or(false) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    let _ = pidfile::release(&spec.pidfile_path);
    info!("supervisor for '{}' exiting", spec.service_name);
    std::process::exit(0);
}

fn all_partitions_have_space() -> bool {
    free_space_ok(&runtime::log_dir()) && free_space_ok(&runtime::data_dir()) && free_space_ok(&runtime::run_dir())
}

fn interruptible_sleep(total: Duration) {
    let step = Duration::from_millis(200);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if TERM_REQUESTED.load(Ordering::SeqCst) {
            return;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

fn request_cooperative_stop(spec: &SupervisorSpec, pid: Pid) {
    let _ = signal::kill(pid, spec.stop_signal);
}

fn spawn_child(spec: &SupervisorSpec) -> Result<Pid, SupervisorError> {
    match unsafe { nix::unistd::fork() }.map_err(|e| SupervisorError::from(crate::error::LaunchError::Fork(e)))? {
        nix::unistd::ForkResult::Child => {
            reset_signal_handlers_to_default();
            let req = LaunchRequest {
                command: &spec.command,
                args: &spec.args,
                env: &spec.env,
                chdir: spec.chdir.as_deref(),
                privilege: &spec.privilege,
                oom_adj: spec.oom_adj,
                log_basepath: spec.log_basepath.as_deref(),
            };
            if let Err(err) = launcher::launch_foreground_exec(&req) {
                warn!("exec failed for '{}': {err}", spec.service_name);
            }
            std::process::exit(127);
        }
        nix::unistd::ForkResult::Parent { child } => Ok(child),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_resets_after_long_run() {
        let mut backoff = BackoffState::new();
        backoff.continuous_failures = 3;
        let sleep = backoff.next_sleep(Duration::from_secs(BACKOFF_RESET_SECS + 5));
        assert_eq!(sleep, Duration::ZERO);
        assert_eq!(backoff.continuous_failures, 0);
    }

    #[test]
    fn backoff_grows_with_consecutive_failures() {
        let mut backoff = BackoffState::new();
        let first = backoff.next_sleep(Duration::from_secs(1));
        let second = backoff.next_sleep(Duration::from_secs(1));
        assert!(first >= Duration::from_secs(BACKOFF_MIN_SECS - 1));
        assert!(second >= first || second.as_secs() <= BACKOFF_MAX_SECS + BACKOFF_JITTER_SECS);
    }

    #[test]
    fn pidfile_extras_include_child_identity() {
        let extras = pidfile_extras(Some(42), 100, 3);
        assert_eq!(extras.get("child_pid"), Some(&"42".to_string()));
        assert_eq!(extras.get("start_count"), Some(&"3".to_string()));
    }
}
