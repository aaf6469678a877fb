//! Service Orchestrator (spec §4.7): computes the four membership sets
//! (Enabled, Running, Running-but-not-enabled, Enabled-but-not-running) and
//! fans verb operations out across services through a bounded worker pool.
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tracing::{info, warn};

use crate::config::Config;
use crate::constants::{
    DECOMMISSIONED_MARKER, DEFAULT_WAIT_SECS, HARD_KILL_GRACE, MAINTENANCE_MODE_MARKER,
    NODE_STATE_FILE, OKAY_STATUS_POLL,
};
use crate::error::OrchestratorError;
use crate::launcher;
use crate::lock;
use crate::pidfile;
use crate::privilege::PrivilegeContext;
use crate::runtime;
use crate::supervisor::{self, SupervisorSpec};

const MAX_WORKERS: usize = 16;

/// Node lifecycle state, totally ordered per spec §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    RunningOk,
    Stopping,
}

impl NodeState {
    fn as_str(&self) -> &'static str {
        match self {
            NodeState::Stopped => "STOPPED",
            NodeState::Starting => "STARTING",
            NodeState::RunningOk => "RUNNING_OK",
            NodeState::Stopping => "STOPPING",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(NodeState::Stopped),
            "STARTING" => Some(NodeState::Starting),
            "RUNNING_OK" => Some(NodeState::RunningOk),
            "STOPPING" => Some(NodeState::Stopping),
            _ => None,
        }
    }
}

fn node_state_path() -> PathBuf {
    runtime::lock_dir().join(NODE_STATE_FILE)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Reads the persisted node state, resetting to `STOPPED` if the recorded
/// transition predates the current boot (a transient STARTING/STOPPING state
/// left behind by a crash can never legally survive a reboot).
fn read_node_state() -> NodeState {
    let path = node_state_path();
    let Ok(contents) = fs::read_to_string(&path) else {
        return NodeState::Stopped;
    };
    let mut lines = contents.lines();
    let Some(state) = lines.next().and_then(NodeState::parse) else {
        return NodeState::Stopped;
    };
    let recorded_at: u64 = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);

    if matches!(state, NodeState::Starting | NodeState::Stopping) {
        let boot_time = System::boot_time();
        if recorded_at < boot_time {
            warn!("node state '{}' predates current boot; treating as crash recovery", state.as_str());
            return NodeState::Stopped;
        }
    }
    state
}

fn write_node_state(state: NodeState) -> std::io::Result<()> {
    let path = node_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, format!("{}\n{}\n", state.as_str(), now_unix()))
}

/// `LOCK_DIR/supervisor/<service>.lock`: the supervisor's pidfile (spec §6
/// "Node runtime layout").
pub fn supervisor_pidfile_path(service_name: &str) -> PathBuf {
    runtime::lock_dir().join("supervisor").join(format!("{service_name}.lock"))
}

/// `LOCK_DIR/supervisor/<service>.status`: free-form status message file.
pub fn supervisor_status_path(service_name: &str) -> PathBuf {
    runtime::lock_dir().join("supervisor").join(format!("{service_name}.status"))
}

/// Best-effort discovery of this node's own addresses, consulted when a
/// service's classification is `default` outside single-node mode.
fn local_addrs() -> Vec<String> {
    let mut addrs = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0")
        && socket.connect("8.8.8.8:80").is_ok()
        && let Ok(local) = socket.local_addr()
    {
        addrs.push(local.ip().to_string());
    }
    addrs
}

fn parse_signal(name: &str) -> Signal {
    match name.trim().to_uppercase().trim_start_matches("SIG") {
        "HUP" => Signal::SIGHUP,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        "KILL" => Signal::SIGKILL,
        _ => Signal::SIGTERM,
    }
}

/// Outcome of one verb invoked against one service, as surfaced by the
/// worker pool (spec §4.7's "per-service verb wrapper").
#[derive(Debug, Clone)]
pub enum VerbOutcome {
    Ok,
    Failed(String),
    Timeout,
}

/// What the orchestrator currently observes about one service: whether
/// configuration enables it here and whether a live supervisor pidfile
/// backs it. `status.rs` builds richer health on top of this.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub supervisor_pid: Option<i32>,
}

/// Computed membership sets for one pass (spec §4.7).
#[derive(Debug, Clone, Default)]
pub struct MembershipSets {
    pub enabled: Vec<String>,
    pub running: Vec<String>,
    pub running_but_not_enabled: Vec<String>,
    pub enabled_but_not_running: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn pidfile_pid(&self, service_name: &str) -> Option<i32> {
        pidfile::read(&supervisor_pidfile_path(service_name))
            .ok()
            .and_then(|r| r.pid)
    }

    /// Snapshots every declared service's enabled/running status.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let local = local_addrs();
        let enabled: HashSet<String> = self.config.enabled_services(&local).into_iter().collect();
        let mut names: Vec<&String> = self.config.services.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let supervisor_pid = self.pidfile_pid(name);
                ServiceSnapshot {
                    name: name.clone(),
                    enabled: enabled.contains(name),
                    running: supervisor_pid.is_some(),
                    supervisor_pid,
                }
            })
            .collect()
    }

    /// Computes the four membership sets (spec §4.7).
    pub fn membership(&self) -> MembershipSets {
        let snapshots = self.snapshot();
        let mut sets = MembershipSets::default();
        for snap in &snapshots {
            if snap.enabled {
                sets.enabled.push(snap.name.clone());
            }
            if snap.running {
                sets.running.push(snap.name.clone());
            }
            if snap.running && !snap.enabled {
                sets.running_but_not_enabled.push(snap.name.clone());
            }
            if snap.enabled && !snap.running {
                sets.enabled_but_not_running.push(snap.name.clone());
            }
        }
        sets
    }

    fn is_decommissioned(&self) -> bool {
        runtime::data_dir().join(DECOMMISSIONED_MARKER).exists()
    }

    fn require_not_decommissioned(&self) -> Result<(), OrchestratorError> {
        if self.is_decommissioned() {
            return Err(OrchestratorError::Decommissioned);
        }
        Ok(())
    }

    /// Starts every service in `Enabled \ Running` (spec §4.7 `start`).
    pub fn start(&self, timeout: Option<Duration>) -> Result<Vec<(String, VerbOutcome)>, OrchestratorError> {
        self.require_not_decommissioned()?;
        let _guard = lock::acquire_node_lock()?;

        write_node_state(NodeState::Starting).map_err(OrchestratorError::Io)?;
        let sets = self.membership();
        let outcomes = self.fan_out(&sets.enabled_but_not_running, timeout.unwrap_or(Duration::from_secs(DEFAULT_WAIT_SECS)), {
            let config = self.config.clone();
            move |name| trigger_start(&config, name)
        });
        write_node_state(NodeState::RunningOk).map_err(OrchestratorError::Io)?;

        if let Some(deadline) = timeout {
            self.wait_for_okay(&sets.enabled_but_not_running, deadline)?;
        }
        Ok(outcomes)
    }

    /// Stops every service in `Running` (spec §4.7 `stop`), optionally
    /// preceded by a hard brute-force kill of the whole process tree.
    pub fn stop(&self, hard: bool) -> Result<Vec<(String, VerbOutcome)>, OrchestratorError> {
        let _guard = lock::acquire_node_lock()?;

        write_node_state(NodeState::Stopping).map_err(OrchestratorError::Io)?;
        if hard {
            hard_kill()?;
        }

        let sets = self.membership();
        let outcomes = self.fan_out(&sets.running, Duration::from_secs(DEFAULT_WAIT_SECS), |name| {
            trigger_stop(name)
        });

        write_node_state(NodeState::Stopped).map_err(OrchestratorError::Io)?;
        clear_run_dir().map_err(OrchestratorError::Io)?;
        Ok(outcomes)
    }

    /// Stops then starts (spec §4.7 `restart`).
    pub fn restart(&self, timeout: Option<Duration>) -> Result<Vec<(String, VerbOutcome)>, OrchestratorError> {
        let mut outcomes = self.stop(false)?;
        outcomes.extend(self.start(timeout)?);
        Ok(outcomes)
    }

    /// Starts missing, stops unexpected, then reloads the remaining running
    /// set (spec §4.7 `reload`). `code`/`conf`/`flush` select what changed
    /// but do not alter the fan-out shape; they are forwarded to
    /// `trigger_reload` as a reason string for logging.
    pub fn reload(
        &self,
        reason: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<(String, VerbOutcome)>, OrchestratorError> {
        let _guard = lock::acquire_node_lock()?;
        let sets = self.membership();

        let mut outcomes = self.fan_out(&sets.enabled_but_not_running, timeout.unwrap_or(Duration::from_secs(DEFAULT_WAIT_SECS)), {
            let config = self.config.clone();
            move |name| trigger_start(&config, name)
        });
        outcomes.extend(self.fan_out(&sets.running_but_not_enabled, Duration::from_secs(DEFAULT_WAIT_SECS), |name| {
            trigger_stop(name)
        }));

        let remaining: Vec<String> = sets
            .running
            .iter()
            .filter(|n| !sets.running_but_not_enabled.contains(n))
            .cloned()
            .collect();
        for name in &remaining {
            let outcome = trigger_reload(name, reason);
            outcomes.push((name.clone(), outcome));
        }

        Ok(outcomes)
    }

    /// Stops unexpected, starts missing, then repairs whatever is left
    /// running (spec §4.7 `repair`).
    pub fn repair(&self) -> Result<Vec<(String, VerbOutcome)>, OrchestratorError> {
        let _guard = lock::acquire_node_lock()?;
        let sets = self.membership();

        let mut outcomes = self.fan_out(&sets.running_but_not_enabled, Duration::from_secs(DEFAULT_WAIT_SECS), |name| {
            trigger_stop(name)
        });
        outcomes.extend(self.fan_out(&sets.enabled_but_not_running, Duration::from_secs(DEFAULT_WAIT_SECS), {
            let config = self.config.clone();
            move |name| trigger_start(&config, name)
        }));

        let remaining: Vec<String> = sets
            .running
            .iter()
            .filter(|n| !sets.running_but_not_enabled.contains(n))
            .cloned()
            .collect();
        outcomes.extend(self.fan_out(&remaining, Duration::from_secs(DEFAULT_WAIT_SECS), |name| {
            trigger_repair(name)
        }));

        Ok(outcomes)
    }

    /// Runs `trigger_status` on `subset` (or every declared service) with a
    /// per-call timeout (spec §4.7 `status`). No node lock: read-only.
    pub fn status(&self, subset: Option<&[String]>, timeout: Duration) -> Vec<(String, VerbOutcome)> {
        let targets: Vec<String> = match subset {
            Some(names) => names.to_vec(),
            None => {
                let mut names: Vec<String> = self.config.services.keys().cloned().collect();
                names.sort();
                names
            }
        };
        self.fan_out(&targets, timeout, |name| trigger_status(name))
    }

    /// Preflights every service, refuses if any fails or the node is
    /// already decommissioned, then decommissions serially and verifies
    /// `DATA_DIR` ends up empty but for the marker (spec §4.7 `decommission`).
    pub fn decommission(&self) -> Result<(), OrchestratorError> {
        if self.is_decommissioned() {
            return Err(OrchestratorError::Decommissioned);
        }
        let _guard = lock::acquire_node_lock()?;

        let mut names: Vec<&String> = self.config.services.keys().collect();
        names.sort();

        let mut failed = Vec::new();
        for name in &names {
            if let Some(service) = self.config.services.get(*name)
                && let Some(probe) = &service.status_probe
                && !run_probe(probe)
            {
                failed.push((*name).clone());
            }
        }
        if !failed.is_empty() {
            return Err(OrchestratorError::PreflightFailed(failed));
        }

        for name in &names {
            let _ = trigger_stop(name);
        }

        let data_dir = runtime::data_dir();
        if data_dir.is_dir() {
            for entry in fs::read_dir(&data_dir).map_err(OrchestratorError::Io)? {
                let entry = entry.map_err(OrchestratorError::Io)?;
                if entry.file_name() == DECOMMISSIONED_MARKER {
                    continue;
                }
                if entry.file_type().map_err(OrchestratorError::Io)?.is_dir() {
                    fs::remove_dir_all(entry.path()).map_err(OrchestratorError::Io)?;
                } else {
                    fs::remove_file(entry.path()).map_err(OrchestratorError::Io)?;
                }
            }
        } else {
            fs::create_dir_all(&data_dir).map_err(OrchestratorError::Io)?;
        }
        fs::write(data_dir.join(DECOMMISSIONED_MARKER), now_unix().to_string())
            .map_err(OrchestratorError::Io)?;

        info!("node decommissioned");
        Ok(())
    }

    /// Toggles maintenance mode, serialised through the node lock like the
    /// other lifecycle operations.
    pub fn set_maintenance_mode(&self, enabled: bool) -> Result<(), OrchestratorError> {
        let _guard = lock::acquire_node_lock()?;
        let marker = runtime::data_dir().join(MAINTENANCE_MODE_MARKER);
        if enabled {
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent).map_err(OrchestratorError::Io)?;
            }
            fs::write(&marker, now_unix().to_string()).map_err(OrchestratorError::Io)?;
        } else {
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(OrchestratorError::Io(err)),
            }
        }
        Ok(())
    }

    fn wait_for_okay(&self, names: &[String], deadline: Duration) -> Result<(), OrchestratorError> {
        if names.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            let still_down: Vec<&String> = names
                .iter()
                .filter(|n| self.pidfile_pid(n).is_none())
                .collect();
            if still_down.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(OrchestratorError::Timeout(still_down[0].clone()));
            }
            thread::sleep(OKAY_STATUS_POLL);
        }
    }

    /// Runs `op` against every entry in `items` through a bounded worker
    /// pool, each call subject to `timeout` (spec §4.7 "Parallel fan-out").
    fn fan_out<F>(&self, items: &[String], timeout: Duration, op: F) -> Vec<(String, VerbOutcome)>
    where
        F: Fn(&str) -> VerbOutcome + Send + Sync + 'static,
    {
        fan_out(items, timeout, op)
    }
}

fn fan_out<F>(items: &[String], timeout: Duration, op: F) -> Vec<(String, VerbOutcome)>
where
    F: Fn(&str) -> VerbOutcome + Send + Sync + 'static,
{
    if items.is_empty() {
        return Vec::new();
    }

    let op = Arc::new(op);
    let queue = Arc::new(Mutex::new(VecDeque::from(items.to_vec())));
    let results: Arc<Mutex<Vec<(String, VerbOutcome)>>> = Arc::new(Mutex::new(Vec::new()));
    let worker_count = items.len().min(MAX_WORKERS);

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let results = Arc::clone(&results);
        let op = Arc::clone(&op);
        handles.push(thread::spawn(move || {
            loop {
                let next = queue.lock().expect("fan-out queue poisoned").pop_front();
                let Some(name) = next else { break };
                let outcome = run_with_timeout(timeout, &op, &name);
                results
                    .lock()
                    .expect("fan-out results poisoned")
                    .push((name, outcome));
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }

    Arc::try_unwrap(results)
        .expect("all workers joined")
        .into_inner()
        .expect("fan-out results poisoned")
}

/// Runs `op(name)` on a throwaway thread, racing it against `timeout`. A
/// panic inside `op` is caught and reported as a failure rather than taking
/// the worker thread down with it; a timeout abandons the thread, whose
/// eventual (late) result is simply discarded when the channel drops.
fn run_with_timeout(
    timeout: Duration,
    op: &Arc<dyn Fn(&str) -> VerbOutcome + Send + Sync>,
    name: &str,
) -> VerbOutcome {
    let (tx, rx) = mpsc::channel();
    let op = Arc::clone(op);
    let name = name.to_string();
    thread::spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| op(&name)))
            .unwrap_or_else(|_| VerbOutcome::Failed("panicked".to_string()));
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(_) => VerbOutcome::Timeout,
    }
}

pub(crate) fn run_probe(command: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn clear_run_dir() -> std::io::Result<()> {
    let dir = runtime::run_dir();
    if dir.is_dir() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)
}

fn trigger_start(config: &Config, service_name: &str) -> VerbOutcome {
    let Some(service) = config.services.get(service_name) else {
        return VerbOutcome::Failed(format!("unknown service '{service_name}'"));
    };

    let pidfile_path = supervisor_pidfile_path(service_name);
    if let Ok(record) = pidfile::read(&pidfile_path)
        && record.pid.is_some()
    {
        return VerbOutcome::Ok;
    }

    let privilege = match PrivilegeContext::from_service(service_name, service) {
        Ok(p) => p,
        Err(err) => return VerbOutcome::Failed(err.to_string()),
    };

    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Some(service_env) = &service.env
        && let Some(vars) = &service_env.vars
    {
        env.extend(vars.clone());
    }

    let chdir = config.project_dir.as_ref().map(PathBuf::from);
    let oom_adj = service.limits.as_ref().and_then(|l| l.oom_adj);
    let stop_signal = parse_signal(service.stop_signal.as_deref().unwrap_or("TERM"));

    let spec = SupervisorSpec {
        service_name: service_name.to_string(),
        pidfile_path: pidfile_path.clone(),
        command: service.command.clone(),
        args: service.args.clone(),
        env,
        chdir,
        privilege,
        oom_adj,
        log_basepath: Some(runtime::log_dir().join(service_name)),
        stop_signal,
    };

    match launcher::fork_daemon(&pidfile_path, move || supervisor::run(spec)) {
        Ok(()) => VerbOutcome::Ok,
        Err(err) => VerbOutcome::Failed(err.to_string()),
    }
}

fn trigger_stop(service_name: &str) -> VerbOutcome {
    let pidfile_path = supervisor_pidfile_path(service_name);
    let record = match pidfile::read(&pidfile_path) {
        Ok(r) => r,
        Err(err) => return VerbOutcome::Failed(err.to_string()),
    };
    let Some(pid) = record.pid else {
        return VerbOutcome::Ok;
    };

    if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        return VerbOutcome::Failed(err.to_string());
    }

    let deadline = Instant::now() + HARD_KILL_GRACE;
    while pidfile::read(&pidfile_path).map(|r| r.pid.is_some()).unwrap_or(false) {
        if Instant::now() >= deadline {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    VerbOutcome::Ok
}

fn trigger_reload(service_name: &str, reason: &str) -> VerbOutcome {
    let pidfile_path = supervisor_pidfile_path(service_name);
    let record = match pidfile::read(&pidfile_path) {
        Ok(r) => r,
        Err(err) => return VerbOutcome::Failed(err.to_string()),
    };
    let Some(pid) = record.pid else {
        return VerbOutcome::Failed(format!("'{service_name}' is not running"));
    };
    info!("reloading '{service_name}' ({reason})");
    match signal::kill(Pid::from_raw(pid), Signal::SIGHUP) {
        Ok(()) => VerbOutcome::Ok,
        Err(err) => VerbOutcome::Failed(err.to_string()),
    }
}

fn trigger_repair(service_name: &str) -> VerbOutcome {
    let pidfile_path = supervisor_pidfile_path(service_name);
    match pidfile::read(&pidfile_path) {
        Ok(record) if record.pid.is_some() => VerbOutcome::Ok,
        Ok(_) => VerbOutcome::Failed(format!("'{service_name}' has no live supervisor to repair")),
        Err(err) => VerbOutcome::Failed(err.to_string()),
    }
}

fn trigger_status(service_name: &str) -> VerbOutcome {
    let pidfile_path = supervisor_pidfile_path(service_name);
    match pidfile::read(&pidfile_path) {
        Ok(record) if record.pid.is_some() => VerbOutcome::Ok,
        Ok(_) => VerbOutcome::Failed("not running".to_string()),
        Err(err) => VerbOutcome::Failed(err.to_string()),
    }
}

/// Enumerates every pidfile's recorded pid under `LOCK_DIR`, flattens their
/// descendant sets via the OS process table, SIGTERMs the result, waits up
/// to [`HARD_KILL_GRACE`], then SIGKILLs survivors (spec §4.7.1).
pub fn hard_kill() -> Result<(), OrchestratorError> {
    let roots = recorded_pids()?;
    if roots.is_empty() {
        return Ok(());
    }

    let targets = flatten_descendants(&roots);
    for pid in &targets {
        let _ = signal::kill(Pid::from_raw(*pid), Signal::SIGTERM);
    }

    let deadline = Instant::now() + HARD_KILL_GRACE;
    loop {
        let alive: Vec<i32> = targets
            .iter()
            .copied()
            .filter(|pid| pidfile::pid_is_running(*pid))
            .collect();
        if alive.is_empty() || Instant::now() >= deadline {
            for pid in alive {
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    Ok(())
}

fn recorded_pids() -> Result<Vec<i32>, OrchestratorError> {
    let dir = runtime::lock_dir().join("supervisor");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut pids = Vec::new();
    for entry in fs::read_dir(&dir).map_err(OrchestratorError::Io)? {
        let entry = entry.map_err(OrchestratorError::Io)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        if let Ok(record) = pidfile::read(&path)
            && let Some(pid) = record.pid
        {
            pids.push(pid);
        }
    }
    Ok(pids)
}

#[cfg(target_os = "linux")]
fn process_parent_table() -> HashMap<i32, i32> {
    let mut table = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return table;
    };
    for entry in entries.flatten() {
        let pid_str = entry.file_name().to_string_lossy().to_string();
        let Ok(pid) = pid_str.parse::<i32>() else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the executable name (itself parenthesised and
        // possibly containing spaces) start at the closing paren.
        if let Some(after_name) = stat.rsplit_once(')') {
            let fields: Vec<&str> = after_name.1.split_whitespace().collect();
            if let Some(ppid_str) = fields.get(1)
                && let Ok(ppid) = ppid_str.parse::<i32>()
            {
                table.insert(pid, ppid);
            }
        }
    }
    table
}

#[cfg(not(target_os = "linux"))]
fn process_parent_table() -> HashMap<i32, i32> {
    warn!("process-parent table scan is only implemented on Linux");
    HashMap::new()
}

fn flatten_descendants(roots: &[i32]) -> Vec<i32> {
    let parents = process_parent_table();
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for (&pid, &ppid) in &parents {
        children.entry(ppid).or_default().push(pid);
    }

    let mut flattened = HashSet::new();
    let mut queue: VecDeque<i32> = roots.iter().copied().collect();
    while let Some(pid) = queue.pop_front() {
        if !flattened.insert(pid) {
            continue;
        }
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    flattened.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::runtime::{self as rt, RuntimeMode};
    use crate::test_utils::env_lock;
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn config_with(name: &str, classification: crate::config::Classification) -> Config {
        let mut services = StdHashMap::new();
        services.insert(
            name.to_string(),
            ServiceConfig {
                command: "true".into(),
                classification,
                ..ServiceConfig::default()
            },
        );
        Config {
            version: "1".into(),
            services,
            project_dir: None,
            env: None,
        }
    }

    #[test]
    fn membership_reports_enabled_but_not_running() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        let config = config_with("web", crate::config::Classification::On);
        let orchestrator = Orchestrator::new(config);
        let sets = orchestrator.membership();
        assert_eq!(sets.enabled, vec!["web".to_string()]);
        assert_eq!(sets.enabled_but_not_running, vec!["web".to_string()]);
        assert!(sets.running.is_empty());
    }

    #[test]
    fn off_service_is_never_enabled() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        let config = config_with("db", crate::config::Classification::Off);
        let orchestrator = Orchestrator::new(config);
        let sets = orchestrator.membership();
        assert!(sets.enabled.is_empty());
        assert!(sets.enabled_but_not_running.is_empty());
    }

    #[test]
    fn running_but_not_enabled_is_detected() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        let config = config_with("web", crate::config::Classification::Off);
        let path = supervisor_pidfile_path("web");
        pidfile::write(&path, Some(std::process::id() as i32), &Default::default()).unwrap();

        let orchestrator = Orchestrator::new(config);
        let sets = orchestrator.membership();
        assert_eq!(sets.running_but_not_enabled, vec!["web".to_string()]);
    }

    #[test]
    fn fan_out_collects_every_item_even_out_of_order() {
        let items: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let outcomes = fan_out(&items, Duration::from_secs(1), |name| {
            if name == "3" {
                VerbOutcome::Failed("boom".to_string())
            } else {
                VerbOutcome::Ok
            }
        });
        assert_eq!(outcomes.len(), 5);
        let failed = outcomes.iter().find(|(n, _)| n == "3").unwrap();
        assert!(matches!(failed.1, VerbOutcome::Failed(_)));
    }

    #[test]
    fn fan_out_reports_timeout_for_slow_work() {
        let items = vec!["slow".to_string()];
        let outcomes = fan_out(&items, Duration::from_millis(20), |_| {
            thread::sleep(Duration::from_millis(200));
            VerbOutcome::Ok
        });
        assert!(matches!(outcomes[0].1, VerbOutcome::Timeout));
    }

    #[test]
    fn flatten_descendants_dedupes_roots() {
        let flattened = flatten_descendants(&[1, 1, 2]);
        let unique: HashSet<i32> = flattened.into_iter().collect();
        assert!(unique.contains(&1));
        assert!(unique.contains(&2));
    }

    #[test]
    fn node_state_round_trips() {
        let _guard = env_lock();
        let dir = tempdir().unwrap();
        rt::init_with_test_home(dir.path());
        rt::init(RuntimeMode::User);

        write_node_state(NodeState::RunningOk).unwrap();
        assert_eq!(read_node_state(), NodeState::RunningOk);
    }
}
