//! Privilege and resource adjustments applied by the Process Launcher (§4.4)
//! between `fork` and `exec`.
use crate::config::{LimitsConfig, ServiceConfig};
use crate::runtime;
use libc::{RLIM_INFINITY, c_int, id_t, rlimit};
use nix::unistd::{Group, Uid, User, getgid, getuid};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tracing::warn;

/// Captures the target user, group, and home metadata that a service should
/// inherit once privilege adjustments have been applied.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    supplementary: Vec<libc::gid_t>,
    home: Option<PathBuf>,
    shell: Option<PathBuf>,
    username: Option<String>,
}

impl UserContext {
    fn new() -> Self {
        Self::default()
    }

    /// The target uid this service should be launched as, if a switch was
    /// requested.
    pub fn target_uid(&self) -> Option<libc::uid_t> {
        self.uid
    }

    /// The target gid this service should be launched as, if a switch was
    /// requested.
    pub fn target_gid(&self) -> Option<libc::gid_t> {
        self.gid
    }

    /// Builds the environment-variable overrides that align with the target
    /// account (e.g. `HOME`, `USER`, `LOGNAME`, `SHELL`).
    pub fn env_overrides(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(home) = &self.home {
            env.insert("HOME".to_string(), home.display().to_string());
        }
        if let Some(username) = &self.username {
            env.insert("USER".to_string(), username.clone());
            env.insert("LOGNAME".to_string(), username.clone());
        }
        if let Some(shell) = &self.shell {
            env.insert("SHELL".to_string(), shell.display().to_string());
        }
        env
    }
}

/// Normalised privilege plan derived from a `ServiceConfig` prior to spawn.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeContext {
    /// Name of the service this context applies to.
    pub service_name: String,
    /// Content hash of the service configuration (for log correlation).
    pub service_hash: String,
    /// User/group switch plan.
    pub user: UserContext,
    /// Resource limits to apply to the child before `exec`.
    pub limits: Option<LimitsConfig>,
}

impl PrivilegeContext {
    /// Analyses a service definition and records the privilege adjustments
    /// that should be applied before `exec` (UID/GID switch, rlimits,
    /// OOM-score, nice).
    pub fn from_service(service_name: &str, service: &ServiceConfig) -> io::Result<Self> {
        let mut context = PrivilegeContext {
            service_name: service_name.to_string(),
            service_hash: service.compute_hash(),
            limits: service.limits.clone(),
            ..PrivilegeContext::default()
        };

        let euid = getuid();
        let requested_user = service.user.clone();
        let requested_group = service.group.clone();
        let supplementary = service.supplementary_groups.clone().unwrap_or_default();

        if requested_user.is_none() && requested_group.is_none() && supplementary.is_empty() {
            return Ok(context);
        }

        if !euid.is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "service '{service_name}' requested user/group switching but angel is not running as root"
                ),
            ));
        }

        let mut user_ctx = UserContext::new();

        if let Some(user_name) = requested_user {
            let user = User::from_name(&user_name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("user '{user_name}' not found")))?;
            user_ctx.uid = Some(user.uid.as_raw());
            user_ctx.gid = Some(user.gid.as_raw());
            user_ctx.home = Some(user.dir);
            user_ctx.shell = Some(user.shell);
            user_ctx.username = Some(user.name);
        }

        if let Some(group_name) = requested_group {
            let group = Group::from_name(&group_name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("group '{group_name}' not found")))?;
            user_ctx.gid = Some(group.gid.as_raw());
        }

        for group_name in supplementary {
            let group = Group::from_name(&group_name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| {
                    io::Error::other(format!("supplementary group '{group_name}' not found"))
                })?;
            user_ctx.supplementary.push(group.gid.as_raw());
        }

        if user_ctx.gid.is_none()
            && let Some(uid) = user_ctx.uid
        {
            let user = User::from_uid(Uid::from_raw(uid))
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("failed to reload user by uid {uid}")))?;
            user_ctx.gid = Some(user.gid.as_raw());
            if user_ctx.home.is_none() {
                user_ctx.home = Some(user.dir);
            }
            if user_ctx.shell.is_none() {
                user_ctx.shell = Some(user.shell);
            }
            if user_ctx.username.is_none() {
                user_ctx.username = Some(user.name);
            }
        }

        context.user = user_ctx;
        Ok(context)
    }

    /// Executes privilege adjustments inside the child process before `exec`:
    /// rlimits, nice, OOM-score, then the uid/gid switch (must run last).
    ///
    /// # Safety
    /// Call this only between `fork` and `exec` in the child process.
    /// Invoking it in the supervisor context mutates the supervisor's own
    /// privileges.
    pub unsafe fn apply_pre_exec(&self, oom_adj: Option<i32>) -> io::Result<()> {
        self.apply_limits()?;
        self.apply_nice()?;
        if let Some(adj) = oom_adj.or_else(|| self.limits.as_ref().and_then(|l| l.oom_adj)) {
            apply_oom_adjustment(adj)?;
        }
        unsafe {
            self.apply_user_switch()?;
        }
        Ok(())
    }

    fn apply_limits(&self) -> io::Result<()> {
        let Some(limits) = &self.limits else {
            return Ok(());
        };

        if let Some(value) = limits.nofile {
            set_rlimit(libc::RLIMIT_NOFILE as c_int, value)?;
        }
        if let Some(value) = limits.nproc {
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            set_rlimit(libc::RLIMIT_NPROC as c_int, value)?;
            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            {
                let _ = value;
                warn!("nproc limit requested but unsupported on this platform");
            }
        }
        if let Some(value) = limits.memlock {
            set_rlimit(libc::RLIMIT_MEMLOCK as c_int, value)?;
        }
        Ok(())
    }

    fn apply_nice(&self) -> io::Result<()> {
        let Some(limits) = &self.limits else {
            return Ok(());
        };
        let Some(nice) = limits.nice else {
            return Ok(());
        };
        let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice as c_int) };
        if res != 0 {
            warn!("failed to set nice to {nice}: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    /// Applies the uid/gid/supplementary-group switch. Must run after every
    /// other privilege-narrowing step: once the uid drops, later steps that
    /// require root (rlimits on some platforms, OOM-score) would fail.
    unsafe fn apply_user_switch(&self) -> io::Result<()> {
        if self.user.uid.is_none() && self.user.gid.is_none() && self.user.supplementary.is_empty()
        {
            return Ok(());
        }

        if !self.user.supplementary.is_empty() {
            let mut buf = self.user.supplementary.clone();
            buf.insert(0, self.user.gid.unwrap_or_else(|| getgid().as_raw()));
            let group_len = buf.len();
            if unsafe { libc::setgroups(group_len as libc::size_t, buf.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(gid) = self.user.gid
            && unsafe { libc::setgid(gid as id_t) } != 0
        {
            return Err(io::Error::last_os_error());
        }

        if let Some(uid) = self.user.uid
            && unsafe { libc::setuid(uid as id_t) } != 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

fn set_rlimit(which: c_int, value: u64) -> io::Result<()> {
    let rlim = if value == u64::MAX {
        rlimit {
            rlim_cur: RLIM_INFINITY,
            rlim_max: RLIM_INFINITY,
        }
    } else {
        rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        }
    };

    #[cfg(target_os = "linux")]
    let res = unsafe { libc::setrlimit(which as libc::c_uint, &rlim as *const rlimit) };
    #[cfg(not(target_os = "linux"))]
    let res = unsafe { libc::setrlimit(which, &rlim as *const rlimit) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets `/proc/self/oom_score_adj` to `adj` (-1000..1000). A failure here is
/// a warning, not fatal (spec §4.4: "failure to set OOM or nice is a
/// warning").
fn apply_oom_adjustment(adj: i32) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Err(err) = std::fs::write("/proc/self/oom_score_adj", adj.to_string()) {
            warn!("failed to set oom_score_adj to {adj}: {err}");
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        warn!("OOM-score adjustment requested but unsupported on this platform");
        let _ = adj;
        Ok(())
    }
}

/// Sets the current process's own OOM-score adjustment very negative, so the
/// kernel's OOM killer avoids it (spec §4.6 invariant: "the supervisor's own
/// OOM adjustment stays very negative").
pub fn harden_supervisor_oom_score() {
    #[cfg(target_os = "linux")]
    {
        if let Err(err) = std::fs::write("/proc/self/oom_score_adj", "-900") {
            warn!("failed to harden supervisor oom_score_adj: {err}");
        }
    }
}

/// Returns true if the current process is running under the `System` runtime
/// mode and is effectively root, i.e. uid/gid switches are available.
pub fn can_switch_users() -> bool {
    matches!(runtime::mode(), runtime::RuntimeMode::System) && getuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    fn base_service() -> ServiceConfig {
        ServiceConfig {
            command: "sleep 1".into(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn from_service_succeeds_without_privilege_changes() {
        let service = base_service();
        let ctx = PrivilegeContext::from_service("demo", &service)
            .expect("context should build without privilege requests");
        assert!(ctx.user.uid.is_none());
    }

    #[test]
    fn from_service_rejects_user_switch_when_not_root() {
        if getuid().is_root() {
            return;
        }

        let mut service = base_service();
        service.user = Some("nobody".into());

        let err = PrivilegeContext::from_service("demo", &service)
            .expect_err("user switch should fail without root");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn env_overrides_populates_expected_fields() {
        let user = UserContext {
            home: Some(PathBuf::from("/home/example")),
            shell: Some(PathBuf::from("/bin/bash")),
            username: Some("example".into()),
            ..UserContext::default()
        };

        let vars = user.env_overrides();
        assert_eq!(vars.get("HOME"), Some(&"/home/example".to_string()));
        assert_eq!(vars.get("SHELL"), Some(&"/bin/bash".to_string()));
        assert_eq!(vars.get("USER"), Some(&"example".to_string()));
        assert_eq!(vars.get("LOGNAME"), Some(&"example".to_string()));
    }
}
