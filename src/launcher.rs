//! Process Launcher (spec §4.4): the three observable ways a command ends up
//! running — foreground exec (replaces this image), foreground child (forked
//! and waited on), and daemon (forked and detached, running the Supervisor
//! loop).
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::constants::{DAEMON_PIDFILE_POLL, DAEMON_PIDFILE_WAIT_SECS};
use crate::error::LaunchError;
use crate::pidfile;
use crate::privilege::PrivilegeContext;
use crate::redirector;

/// Everything needed to turn a [`crate::config::ServiceConfig`] into a
/// running process.
pub struct LaunchRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub chdir: Option<&'a Path>,
    pub privilege: &'a PrivilegeContext,
    pub oom_adj: Option<i32>,
    pub log_basepath: Option<&'a Path>,
}

fn stdout_log_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}-out.log", base.display()))
}

fn error_log_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}-error.log", base.display()))
}

/// Creates the log directory (and files) with the privilege context's target
/// ownership. Failure here is fatal before exec, per spec §4.4.
fn prepare_log_dir(req: &LaunchRequest) -> Result<(), LaunchError> {
    let Some(base) = req.log_basepath else {
        return Ok(());
    };
    let dir = base.parent().unwrap_or_else(|| Path::new("."));

    (|| -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
        if let Some(uid) = req.privilege.user.target_uid() {
            let gid = req.privilege.user.target_gid();
            chown_path(dir, uid, gid)?;
        }
        Ok(())
    })()
    .map_err(|err| LaunchError::LogDirSetup(dir.display().to_string(), err))
}

fn chown_path(path: &Path, uid: libc::uid_t, gid: Option<libc::gid_t>) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let res = unsafe { libc::chown(c_path.as_ptr(), uid, gid.unwrap_or(libc::gid_t::MAX)) };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn redirect_stdin_devnull() -> std::io::Result<()> {
    let devnull = fs::OpenOptions::new().read(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    if unsafe { libc::dup2(fd, libc::STDIN_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn redirect_fd_to_file(target_fd: i32, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    if unsafe { libc::dup2(file.as_raw_fd(), target_fd) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn redirect_fd_to_pipe(target_fd: i32, write_end: &OwnedFd) -> std::io::Result<()> {
    if unsafe { libc::dup2(write_end.as_raw_fd(), target_fd) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn build_cstrings(command: &str, args: &[String]) -> Result<(CString, Vec<CString>), LaunchError> {
    let prog = CString::new(command)
        .map_err(|_| LaunchError::Exec(command.to_string(), nix::Error::EINVAL))?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(prog.clone());
    for arg in args {
        argv.push(
            CString::new(arg.as_str())
                .map_err(|_| LaunchError::Exec(command.to_string(), nix::Error::EINVAL))?,
        );
    }
    Ok((prog, argv))
}

fn build_envp(env: &HashMap<String, String>) -> Vec<CString> {
    env.iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect()
}

/// Applies all pre-exec setup (chdir, privilege drop) and execs `command`.
/// Never returns on success; the `Infallible` return type documents this.
///
/// # Safety
/// Must run in a process with no other purpose (either the main process in
/// foreground-exec mode, or freshly forked child with nothing else alive).
pub unsafe fn exec_in_place(req: &LaunchRequest) -> Result<Infallible, LaunchError> {
    if let Some(dir) = req.chdir {
        std::env::set_current_dir(dir)
            .map_err(|source| LaunchError::PrivilegeDrop {
                service: req.privilege.service_name.clone(),
                source,
            })?;
    }

    unsafe {
        req.privilege
            .apply_pre_exec(req.oom_adj)
            .map_err(|source| LaunchError::PrivilegeDrop {
                service: req.privilege.service_name.clone(),
                source,
            })?;
    }

    let mut full_env = req.privilege.user.env_overrides();
    for (k, v) in req.env {
        full_env.insert(k.clone(), v.clone());
    }

    let (prog, argv) = build_cstrings(req.command, req.args)?;
    let envp = build_envp(&full_env);

    let err = unistd::execvpe(&prog, &argv, &envp).unwrap_err();
    Err(LaunchError::Exec(req.command.to_string(), err))
}

/// Foreground exec: sets up logs, drops privileges, replaces this process
/// image with `command`. Never returns on success.
pub fn launch_foreground_exec(req: &LaunchRequest) -> Result<Infallible, LaunchError> {
    prepare_log_dir(req)?;

    redirect_stdin_devnull().map_err(|source| LaunchError::PrivilegeDrop {
        service: req.privilege.service_name.clone(),
        source,
    })?;

    if let Some(base) = req.log_basepath {
        redirect_fd_to_file(libc::STDOUT_FILENO, &stdout_log_path(base)).map_err(|source| {
            LaunchError::LogDirSetup(base.display().to_string(), source)
        })?;
        redirect_fd_to_file(libc::STDERR_FILENO, &error_log_path(base)).map_err(|source| {
            LaunchError::LogDirSetup(base.display().to_string(), source)
        })?;
    }

    unsafe { exec_in_place(req) }
}

/// The outcome of a forked foreground child: its exit status plus the
/// redirector handles the caller should `stop()` once the child has exited.
pub struct ForegroundChild {
    pub status: ExitStatus,
}

/// Forks, pipes the child's stdout/stderr through the Stream Redirector into
/// `<log_basepath>-{out,error}.log`, waits for the child, and returns its
/// exit status.
pub fn spawn_foreground_child(req: &LaunchRequest) -> Result<ForegroundChild, LaunchError> {
    prepare_log_dir(req)?;

    let (stdout_read, stdout_write) = unistd::pipe().map_err(LaunchError::Fork)?;
    let (stderr_read, stderr_write) = unistd::pipe().map_err(LaunchError::Fork)?;

    match unsafe { unistd::fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => {
            drop(stdout_read);
            drop(stderr_read);
            let _ = redirect_fd_to_pipe(libc::STDOUT_FILENO, &stdout_write);
            let _ = redirect_fd_to_pipe(libc::STDERR_FILENO, &stderr_write);
            drop(stdout_write);
            drop(stderr_write);
            let _ = redirect_stdin_devnull();

            let result = unsafe { exec_in_place(req) };
            if let Err(err) = result {
                eprintln!("exec failed: {err}");
            }
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            drop(stdout_write);
            drop(stderr_write);

            let redirectors = req.log_basepath.map(|base| {
                (
                    redirector::spawn(stdout_read, stdout_log_path(base), None),
                    redirector::spawn(stderr_read, error_log_path(base), None),
                )
            });
            if redirectors.is_none() {
                drop(stdout_read);
                drop(stderr_read);
            }

            let status = wait_for_exit(child)?;

            if let Some((out, err)) = redirectors {
                out.stop();
                err.stop();
            }

            Ok(ForegroundChild { status })
        }
    }
}

fn wait_for_exit(child: Pid) -> Result<ExitStatus, LaunchError> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus::from_raw(code << 8));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ExitStatus::from_raw(signal as i32));
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(LaunchError::Fork(err)),
        }
    }
}

/// Forks and detaches: the child runs `supervisor_entry` (expected never to
/// return - it calls `_exit` internally), the parent polls `pidfile_path`
/// for up to [`DAEMON_PIDFILE_WAIT_SECS`] and returns once it appears.
pub fn fork_daemon(
    pidfile_path: &Path,
    supervisor_entry: impl FnOnce() -> Infallible,
) -> Result<(), LaunchError> {
    match unsafe { unistd::fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => {
            let _ = unistd::setsid();
            match supervisor_entry() {}
        }
        ForkResult::Parent { .. } => {
            let deadline = Instant::now() + Duration::from_secs(DAEMON_PIDFILE_WAIT_SECS);
            loop {
                if let Ok(record) = pidfile::read(pidfile_path)
                    && record.pid.is_some()
                {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(LaunchError::PidfileTimeout(pidfile_path.display().to_string()));
                }
                thread::sleep(DAEMON_PIDFILE_POLL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use tempfile::tempdir;

    fn privilege_ctx() -> PrivilegeContext {
        let service = ServiceConfig {
            command: "true".into(),
            ..ServiceConfig::default()
        };
        PrivilegeContext::from_service("demo", &service).expect("no privilege change requested")
    }

    #[test]
    fn spawn_foreground_child_captures_stdout_to_log() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("demo");
        let privilege = privilege_ctx();
        let env = HashMap::new();

        let req = LaunchRequest {
            command: "/bin/echo",
            args: &["hello".to_string()],
            env: &env,
            chdir: None,
            privilege: &privilege,
            oom_adj: None,
            log_basepath: Some(&base),
        };

        let outcome = spawn_foreground_child(&req).expect("spawn");
        assert!(outcome.status.success());

        thread::sleep(Duration::from_millis(100));
        let log = fs::read_to_string(stdout_log_path(&base)).unwrap_or_default();
        assert!(log.contains("hello"));
    }

    #[test]
    fn spawn_foreground_child_reports_nonzero_exit() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("demo");
        let privilege = privilege_ctx();
        let env = HashMap::new();

        let req = LaunchRequest {
            command: "/bin/false",
            args: &[],
            env: &env,
            chdir: None,
            privilege: &privilege,
            oom_adj: None,
            log_basepath: Some(&base),
        };

        let outcome = spawn_foreground_child(&req).expect("spawn");
        assert!(!outcome.status.success());
    }
}
