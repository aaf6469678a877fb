use nix::unistd::Uid;
use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::mpsc,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use angeld::{
    cli::{self, Cli, Commands, ConfVerb, MaintenanceMode, PackageVerb, PinningVerb, ServiceVerb, StatusFormat},
    config::{self, Config},
    constants::{DECOMMISSIONED_MARKER, DEFAULT_WAIT_SECS, MAINTENANCE_MODE_MARKER},
    error::AngelError,
    orchestrator::Orchestrator,
    runtime::{self, RuntimeMode},
    status, versions,
};

/// Collectd-format status is a long-running loop; this is the interval
/// between `PUTVAL` emissions. Not configurable at the CLI boundary.
const COLLECTD_INTERVAL_SECS: u64 = 10;

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("angelctl: {err}");
            process::exit(err.exit_code());
        }
    }
}

fn run() -> Result<i32, AngelError> {
    let args = cli::parse_args();

    let mode = if args.sys {
        if !Uid::effective().is_root() {
            return Err(AngelError::Privilege("--sys requires root".to_string()));
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };
    runtime::init(mode);
    init_logging(&args);
    adopt_deploy_user();

    let config = config::load_config(args.config.as_deref())?;
    let orchestrator = Orchestrator::new(config.clone());

    match args.command {
        Commands::Service { verb } => run_service(&orchestrator, &config, verb),
        Commands::Status { service, state, format, timeout, wait } => {
            run_status(&config, service, state, format, timeout, wait)
        }
        Commands::Package { verb } => run_package(&orchestrator, verb),
    }
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(false).try_init();
}

/// `LC_DEPLOY_USER`, if present, is logged once and then scrubbed from the
/// environment so it never leaks into a supervised child's env (spec §6).
fn adopt_deploy_user() {
    if let Ok(user) = std::env::var("LC_DEPLOY_USER") {
        info!("command invoked on behalf of deploy user '{user}'");
        runtime::set_deploy_user(Some(user));
        unsafe {
            std::env::remove_var("LC_DEPLOY_USER");
        }
    }
}

fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            return String::from_utf8_lossy(&buf[..len]).into_owned();
        }
    }
    "unknown".to_string()
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn stdout_log_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}-out.log", base.display()))
}

fn error_log_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}-error.log", base.display()))
}

fn default_branch(versions_dir: &Path) -> String {
    versions::global_default_branch(versions_dir).unwrap_or_else(|| "main".to_string())
}

fn run_service(orchestrator: &Orchestrator, config: &Config, verb: ServiceVerb) -> Result<i32, AngelError> {
    match verb {
        ServiceVerb::Start { wait } => {
            let timeout = wait.map(|w| w.to_duration(DEFAULT_WAIT_SECS));
            let outcomes = orchestrator.start(timeout)?;
            Ok(exit_for_outcomes(&outcomes))
        }
        ServiceVerb::Stop { hard } => {
            let outcomes = orchestrator.stop(hard)?;
            Ok(exit_for_outcomes(&outcomes))
        }
        ServiceVerb::Restart { wait, hard } => {
            let timeout = wait.map(|w| w.to_duration(DEFAULT_WAIT_SECS));
            let mut outcomes = orchestrator.stop(hard)?;
            outcomes.extend(orchestrator.start(timeout)?);
            Ok(exit_for_outcomes(&outcomes))
        }
        ServiceVerb::Reload { wait } => {
            let timeout = wait.map(|w| w.to_duration(DEFAULT_WAIT_SECS));
            let outcomes = orchestrator.reload("operator reload", timeout)?;
            Ok(exit_for_outcomes(&outcomes))
        }
        ServiceVerb::Repair => {
            let outcomes = orchestrator.repair()?;
            Ok(exit_for_outcomes(&outcomes))
        }
        ServiceVerb::RotateLogs => {
            rotate_logs(config)?;
            Ok(0)
        }
        ServiceVerb::Mode { mode } => {
            orchestrator.set_maintenance_mode(matches!(mode, MaintenanceMode::Maintenance))?;
            Ok(0)
        }
        ServiceVerb::Conf { verb } => {
            match verb {
                ConfVerb::Set { entry } => conf_set(&entry)?,
                ConfVerb::Unset { key } => conf_unset(&key)?,
            }
            Ok(0)
        }
    }
}

fn exit_for_outcomes(outcomes: &[(String, angeld::orchestrator::VerbOutcome)]) -> i32 {
    use angeld::orchestrator::VerbOutcome;
    for (name, outcome) in outcomes {
        match outcome {
            VerbOutcome::Ok => {}
            VerbOutcome::Failed(reason) => eprintln!("{name}: {reason}"),
            VerbOutcome::Timeout => eprintln!("{name}: timed out"),
        }
    }
    if outcomes.iter().all(|(_, o)| matches!(o, VerbOutcome::Ok)) { 0 } else { 1 }
}

/// Renames each service's log files aside; the redirector's inode-based
/// rotation check picks up the gap on its next write and reopens fresh
/// files at the original path, so no signal to the running supervisor is
/// needed.
fn rotate_logs(config: &Config) -> Result<(), AngelError> {
    for name in config.services.keys() {
        let base = runtime::log_dir().join(name);
        for path in [stdout_log_path(&base), error_log_path(&base)] {
            if path.exists() {
                let rotated = path.with_extension("log.1");
                let _ = fs::remove_file(&rotated);
                fs::rename(&path, &rotated)?;
            }
        }
    }
    Ok(())
}

fn conf_overrides_path() -> PathBuf {
    runtime::data_dir().join("conf.overrides")
}

fn read_overrides() -> Vec<String> {
    fs::read_to_string(conf_overrides_path())
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn write_overrides(lines: &[String]) -> Result<(), AngelError> {
    let path = conf_overrides_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", lines.join("\n")))?;
    Ok(())
}

fn conf_set(entry: &str) -> Result<(), AngelError> {
    let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
    let mut lines: Vec<String> = read_overrides().into_iter().filter(|l| !matches_key(l, key)).collect();
    lines.push(entry.to_string());
    write_overrides(&lines)
}

fn conf_unset(key: &str) -> Result<(), AngelError> {
    let lines: Vec<String> = read_overrides().into_iter().filter(|l| !matches_key(l, key)).collect();
    write_overrides(&lines)
}

fn matches_key(line: &str, key: &str) -> bool {
    line == key || line.starts_with(&format!("{key}="))
}

fn run_status(
    config: &Config,
    service: Vec<String>,
    state: bool,
    format: Option<StatusFormat>,
    timeout: u64,
    wait: Option<cli::WaitArg>,
) -> Result<i32, AngelError> {
    if let Some(w) = wait {
        thread::sleep(w.to_duration(DEFAULT_WAIT_SECS));
    }

    let decommissioned = runtime::data_dir().join(DECOMMISSIONED_MARKER).exists();
    let maintenance_mode = runtime::data_dir().join(MAINTENANCE_MODE_MARKER).exists();
    let subset: Option<Vec<String>> = if state {
        Some(Vec::new())
    } else if service.is_empty() {
        None
    } else {
        Some(service)
    };
    let include_self_check = !state && subset.is_none();
    let timeout = Duration::from_secs(timeout);
    let hostname = hostname();

    match format {
        None => {
            let node = aggregate_bounded(config.clone(), decommissioned, maintenance_mode, subset, include_self_check, timeout);
            println!("{}", status::render_default(&node));
            Ok(status::default_exit_code(&node))
        }
        Some(StatusFormat::Nagios) => {
            let node = aggregate_bounded(config.clone(), decommissioned, maintenance_mode, subset, include_self_check, timeout);
            println!("{}", status::render_nagios(&node));
            Ok(status::nagios_exit_code(&node))
        }
        Some(StatusFormat::ErrorsOnly) => {
            let node = aggregate_bounded(config.clone(), decommissioned, maintenance_mode, subset, include_self_check, timeout);
            if let Some(line) = status::render_errors_only(&node, &hostname) {
                println!("{line}");
            }
            Ok(status::errors_only_exit_code(&node))
        }
        Some(StatusFormat::Silent) => {
            let node = aggregate_bounded(config.clone(), decommissioned, maintenance_mode, subset, include_self_check, timeout);
            Ok(status::silent_exit_code(&node))
        }
        Some(StatusFormat::Collectd) => {
            loop {
                let node = aggregate_bounded(
                    config.clone(),
                    decommissioned,
                    maintenance_mode,
                    subset.clone(),
                    include_self_check,
                    timeout,
                );
                println!("{}", status::render_collectd(&node, &hostname, COLLECTD_INTERVAL_SECS, now_unix()));
                if !node.services_running {
                    break;
                }
                thread::sleep(Duration::from_secs(COLLECTD_INTERVAL_SECS));
            }
            Ok(0)
        }
    }
}

/// Runs `status::aggregate` on a throwaway thread, racing it against
/// `timeout` the same way the orchestrator's fan-out races each per-service
/// call; a blocked status probe surfaces as UNKNOWN rather than hanging the
/// whole report.
fn aggregate_bounded(
    config: Config,
    decommissioned: bool,
    maintenance_mode: bool,
    subset: Option<Vec<String>>,
    include_self_check: bool,
    timeout: Duration,
) -> status::NodeStatus {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let orchestrator = Orchestrator::new(config.clone());
        let node = status::aggregate(&orchestrator, &config, decommissioned, maintenance_mode, subset.as_deref(), include_self_check);
        let _ = tx.send(node);
    });
    rx.recv_timeout(timeout).unwrap_or_else(|_| status::NodeStatus {
        overall: status::Severity::Unknown,
        message: "status probes timed out".to_string(),
        services_running: false,
        running_unexpectedly: Vec::new(),
        missing: Vec::new(),
        services: Vec::new(),
    })
}

fn run_package(orchestrator: &Orchestrator, verb: PackageVerb) -> Result<i32, AngelError> {
    let versions_dir = runtime::versions_dir();

    match verb {
        PackageVerb::Branch { name, force } => {
            versions::set_default_branch(&versions_dir, &name, force)?;
            Ok(0)
        }
        PackageVerb::Upgrade {
            branch,
            version,
            downgrade_allowed,
            download_only,
            force,
            jitter,
            skip_reload,
            wait,
        } => {
            let branch = branch.unwrap_or_else(|| default_branch(&versions_dir));
            if download_only {
                warn!("--download-only: no artifact fetch collaborator is wired up here; nothing to do");
                return Ok(0);
            }
            let target = match version.as_deref() {
                None | Some("latest") | Some("highest-installed") => versions::list_versions(&versions_dir, &branch)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| AngelError::Configuration(format!("no installed versions for branch '{branch}'")))?,
                Some(v) => v.to_string(),
            };
            let jitter = jitter.map(|w| w.to_duration(30)).unwrap_or(Duration::ZERO);
            versions::activate(&versions_dir, &branch, &target, downgrade_allowed, jitter, force)?;
            if !skip_reload {
                let timeout = wait.map(|w| w.to_duration(DEFAULT_WAIT_SECS));
                orchestrator.reload("package upgrade", timeout)?;
            }
            Ok(0)
        }
        PackageVerb::Rollback { version } => {
            let branch = default_branch(&versions_dir);
            versions::rollback(&versions_dir, &branch, &version)?;
            Ok(0)
        }
        PackageVerb::Delete { version, branch } => {
            let branch = branch.unwrap_or_else(|| default_branch(&versions_dir));
            versions::delete(&versions_dir, &branch, &version, false)?;
            Ok(0)
        }
        PackageVerb::Pinning { verb } => {
            match verb {
                PinningVerb::On { reason } => versions::set_pinned(&versions_dir, true, reason.as_deref())?,
                PinningVerb::Off => versions::set_pinned(&versions_dir, false, None)?,
            }
            Ok(0)
        }
        PackageVerb::Versions { branch } => {
            let branch = branch.unwrap_or_else(|| default_branch(&versions_dir));
            for v in versions::list_versions(&versions_dir, &branch)? {
                println!("{v}");
            }
            Ok(0)
        }
        PackageVerb::CheckVersion { version, branch, silent } => {
            let branch = branch.unwrap_or_else(|| default_branch(&versions_dir));
            let installed = versions::list_versions(&versions_dir, &branch)?.contains(&version);
            let active = versions::branch_default_version(&versions_dir, &branch).as_deref() == Some(version.as_str());
            let code = if active {
                0
            } else if installed {
                1
            } else {
                2
            };
            if !silent {
                let state = if active { "active" } else if installed { "installed" } else { "not installed" };
                println!("{branch}/{version}: {state}");
            }
            Ok(code)
        }
        PackageVerb::AddVersion { dir, src, branch, version } => {
            versions::create(Path::new(&dir), &branch, &version, Path::new(&src), 0.0, None)?;
            Ok(0)
        }
    }
}
