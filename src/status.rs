//! Status Aggregator (spec §4.8): builds a `StatusValue` per service,
//! merges them into a node roll-up, and renders the four output formats
//! (default, nagios, collectd, errors-only, silent).
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::cache;
use crate::config::{Config, MonitoringConfig};
use crate::constants::{
    DISK_ERROR_FREE_MB, DISK_ERROR_USED_FRACTION, DISK_WARN_FREE_MB, DISK_WARN_USED_FRACTION,
    INODES_ERROR_FREE, INODES_WARN_FREE, LOAD_ERROR_THRESHOLD, SHORT_SPIKE_TIME_SECS,
};
use crate::orchestrator::{self, MembershipSets, Orchestrator};
use crate::stats;

/// Health state of one service or of the node roll-up. Discriminants line
/// up with the historical nagios-adjacent numbering (`RunningOk` = 0
/// through `Decommissioned` = 7) so the default-format text table and the
/// nagios exit-code remap read the same ordinal both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    RunningOk = 0,
    Warn = 1,
    Error = 2,
    Unknown = 3,
    Starting = 4,
    Stopping = 5,
    Stopped = 6,
    Decommissioned = 7,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::RunningOk => "OK",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Unknown => "UNKNOWN",
            Severity::Starting => "STARTING",
            Severity::Stopping => "STOPPING",
            Severity::Stopped => "STOPPED",
            Severity::Decommissioned => "DECOMMISSIONED",
        }
    }
}

/// One reported metric: `{value, unit, warn?, error?, min?, max?, group?}`
/// (spec §4.8).
#[derive(Debug, Clone)]
pub struct DataPoint {
    pub value: f64,
    pub unit: Option<Unit>,
    pub warn: Option<f64>,
    pub error: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub group: Option<String>,
}

impl DataPoint {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            unit: None,
            warn: None,
            error: None,
            min: None,
            max: None,
            group: None,
        }
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn warn(mut self, threshold: f64) -> Self {
        self.warn = Some(threshold);
        self
    }

    pub fn error(mut self, threshold: f64) -> Self {
        self.error = Some(threshold);
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }
}

/// Closed set of stat units with explicit collectd/nagios name mappings
/// (spec §6 "Stat unit mapping"). `Memory` is distinct from `Bytes` only by
/// tag; both map to nagios `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Bytes,
    Counter,
    Gauge,
    QueueSize,
    Records,
    Memory,
    Seconds,
}

impl Unit {
    pub fn nagios_code(&self) -> &'static str {
        match self {
            Unit::Bytes => "b",
            Unit::Counter => "",
            Unit::Gauge => "",
            Unit::QueueSize => "",
            Unit::Records => "",
            Unit::Memory => "b",
            Unit::Seconds => "s",
        }
    }

    pub fn collectd_name(&self) -> &'static str {
        match self {
            Unit::Bytes => "bytes",
            Unit::Counter => "count",
            Unit::Gauge => "gauge",
            Unit::QueueSize => "queue_length",
            Unit::Records => "records",
            Unit::Memory => "memory",
            Unit::Seconds => "seconds",
        }
    }
}

/// Per-service (or per-node-self-check) status, merged from one or more
/// partial updates.
#[derive(Debug, Clone)]
pub struct StatusValue {
    pub service_name: String,
    pub state: Option<Severity>,
    pub message: String,
    pub data: BTreeMap<String, DataPoint>,
}

impl StatusValue {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            state: None,
            message: String::new(),
            data: BTreeMap::new(),
        }
    }

    /// Appends `message` (joined with `"; "`) and folds `state` into the
    /// current state by severity precedence. Mirrors the update discipline
    /// used when a service reports several partial findings during one
    /// status pass: a later OK never erases an earlier WARN or ERROR.
    pub fn update(&mut self, message: Option<&str>, state: Option<Severity>) {
        if let Some(message) = message
            && !message.is_empty()
        {
            if self.message.is_empty() {
                self.message = message.to_string();
            } else {
                self.message = format!("{}; {}", self.message.trim_end(), message);
            }
        }
        if let Some(incoming) = state {
            self.state = Some(merge_state(self.state, incoming));
        }
    }

    pub fn add_data_point(&mut self, name: &str, point: DataPoint) {
        self.data.insert(name.to_string(), point);
    }

    pub fn resolved_state(&self) -> Severity {
        self.state.unwrap_or(Severity::Unknown)
    }
}

/// Folds `incoming` into `current` by severity precedence. STARTING/STOPPING
/// always wins (a transition in progress masks steady-state warnings);
/// ERROR wins over everything else; UNKNOWN wins unless we've already seen
/// an ERROR; WARN only escalates out of OK; OK never downgrades a worse
/// state; STOPPED is accepted as-is except when we've already seen UNKNOWN.
fn merge_state(current: Option<Severity>, incoming: Severity) -> Severity {
    let Some(current) = current else {
        return incoming;
    };
    if incoming == current {
        return current;
    }
    if matches!(incoming, Severity::Starting | Severity::Stopping) {
        return incoming;
    }
    if incoming == Severity::Error {
        return incoming;
    }
    if incoming == Severity::Unknown {
        if current != Severity::Error {
            return incoming;
        }
        return current;
    }
    if incoming == Severity::Warn {
        if current == Severity::RunningOk {
            return incoming;
        }
        return current;
    }
    if incoming == Severity::RunningOk {
        return current;
    }
    // incoming == Stopped
    if current == Severity::Unknown {
        return current;
    }
    warn!("not sure how to merge STOPPED onto state {}; ignoring", current.as_str());
    current
}

/// Full node roll-up: overall severity, a human message, and every
/// per-service (plus the node self-check) `StatusValue`.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub overall: Severity,
    pub message: String,
    pub services_running: bool,
    pub running_unexpectedly: Vec<String>,
    pub missing: Vec<String>,
    pub services: Vec<StatusValue>,
}

/// Runs a service's `status_probe` (or falls back to bare liveness) and
/// returns its `StatusValue`.
fn probe_service(name: &str, running: bool, probe: Option<&str>) -> StatusValue {
    let mut value = StatusValue::new(name);
    if !running {
        value.update(Some("not running"), Some(Severity::Stopped));
        return value;
    }
    match probe {
        Some(command) if orchestrator::run_probe(command) => {
            value.update(Some("ok"), Some(Severity::RunningOk));
        }
        Some(_) => {
            value.update(Some("status probe failed"), Some(Severity::Error));
        }
        None => {
            value.update(Some("running"), Some(Severity::RunningOk));
        }
    }
    value
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Folds a load-average sample into a WARN/ERROR decision with a sticky
/// spike grace (spec §4.8, scenario 6): a crossing of `warn` is tolerated
/// for `grace_secs` before escalating to WARN; crossing `error` always
/// escalates immediately regardless of grace.
fn load_severity(cache_key: &str, value: f64, warn: f64, error: f64, grace_secs: u64) -> Severity {
    if value > error {
        cache::clear(cache_key);
        return Severity::Error;
    }
    if value <= warn {
        cache::clear(cache_key);
        return Severity::RunningOk;
    }
    let first_seen = match cache::get(cache_key, None).and_then(|s| s.parse::<u64>().ok()) {
        Some(t) => t,
        None => {
            let now = now_unix();
            cache::set(cache_key, &now.to_string(), None);
            now
        }
    };
    if now_unix().saturating_sub(first_seen) > grace_secs {
        Severity::Warn
    } else {
        Severity::RunningOk
    }
}

/// Node self-check: load averages plus disk/inode usage for every locally
/// mounted filesystem, rolled up the way the teacher's `devops`
/// pseudo-service does (one `StatusValue` named `"node"` carrying the
/// aggregate data points, rather than a per-service struct each).
pub fn node_self_check(monitoring: Option<&MonitoringConfig>) -> StatusValue {
    let mut value = StatusValue::new("node");

    let load = stats::load_average();
    let warn1 = monitoring.and_then(|m| m.load1_warn).unwrap_or(LOAD_ERROR_THRESHOLD * 0.75);
    let warn5 = monitoring.and_then(|m| m.load5_warn).unwrap_or(LOAD_ERROR_THRESHOLD * 0.75);
    let warn15 = monitoring.and_then(|m| m.load15_warn).unwrap_or(LOAD_ERROR_THRESHOLD * 0.75);
    let error = monitoring.and_then(|m| m.load_error).unwrap_or(LOAD_ERROR_THRESHOLD);
    let grace = monitoring.and_then(|m| m.spike_grace_secs).unwrap_or(SHORT_SPIKE_TIME_SECS);

    let load_state = [
        ("load1", load.one, warn1),
        ("load5", load.five, warn5),
        ("load15", load.fifteen, warn15),
    ]
    .into_iter()
    .map(|(name, v, w)| {
        let state = load_severity(&format!("devops-checkload-{name}"), v, w, error, grace);
        value.add_data_point(name, DataPoint::new(v).unit(Unit::Gauge).warn(w).error(error));
        state
    })
    .fold(Severity::RunningOk, |acc, s| merge_state(Some(acc), s));
    value.update(
        Some(&format!("load1 {:.2} load5 {:.2} load15 {:.2}", load.one, load.five, load.fifteen)),
        Some(load_state),
    );

    for (path, usage) in stats::disk_usage_all() {
        let mut state = Severity::RunningOk;
        if usage.free_mb < DISK_WARN_FREE_MB || usage.used_fraction > DISK_WARN_USED_FRACTION {
            state = Severity::Warn;
        }
        if usage.free_mb < DISK_ERROR_FREE_MB || usage.used_fraction > DISK_ERROR_USED_FRACTION {
            state = Severity::Error;
        }
        if usage.free_inodes < INODES_WARN_FREE {
            state = merge_state(Some(state), Severity::Warn);
        }
        if usage.free_inodes < INODES_ERROR_FREE {
            state = merge_state(Some(state), Severity::Error);
        }
        if state != Severity::RunningOk {
            value.update(
                Some(&format!(
                    "disk {path}: {}MB free, {:.1}% used, {} inodes free",
                    usage.free_mb,
                    usage.used_fraction * 100.0,
                    usage.free_inodes
                )),
                Some(state),
            );
        }
        let mut key = path.trim_start_matches('/').replace('/', "-");
        if key.is_empty() {
            key = "root".to_string();
        }
        value.add_data_point(
            &format!("disk-{key}-free-mb"),
            DataPoint::new(usage.free_mb as f64)
                .unit(Unit::Bytes)
                .warn(DISK_WARN_FREE_MB as f64)
                .error(DISK_ERROR_FREE_MB as f64)
                .group("disk"),
        );
    }

    value
}

/// Builds the full node roll-up (spec §4.8 / the node-level merge in the
/// original monitoring module): decommissioned beats everything, then
/// unknown, error, stopped, starting, stopping, warn, ok; services running
/// unexpectedly push OK down to WARN, services missing while the node is
/// otherwise running push it to ERROR, and maintenance mode caps OK at WARN.
pub fn aggregate(
    orchestrator: &Orchestrator,
    config: &Config,
    decommissioned: bool,
    maintenance_mode: bool,
    subset: Option<&[String]>,
    include_node_self_check: bool,
) -> NodeStatus {
    let sets: MembershipSets = orchestrator.membership();
    let services_running = !sets.running.is_empty();

    let mut services = Vec::new();
    let snapshot = orchestrator.snapshot();
    let targets: Vec<&str> = match subset {
        Some(names) => names.iter().map(String::as_str).collect(),
        None => snapshot.iter().map(|s| s.name.as_str()).collect(),
    };
    for snap in &snapshot {
        if !targets.contains(&snap.name.as_str()) {
            continue;
        }
        let probe = config.services.get(&snap.name).and_then(|s| s.status_probe.as_deref());
        services.push(probe_service(&snap.name, snap.running, probe));
    }

    if include_node_self_check {
        let monitoring = config.services.values().find_map(|s| s.monitoring.as_ref());
        services.push(node_self_check(monitoring));
    }

    let mut seen = std::collections::HashSet::new();
    for svc in &services {
        seen.insert(svc.resolved_state());
    }

    let mut overall = if services_running { Severity::RunningOk } else { Severity::Stopped };
    let mut message = String::new();

    if decommissioned {
        overall = Severity::Decommissioned;
        message.push_str("DECOMMISSIONED");
    } else if seen.contains(&Severity::Unknown) {
        overall = Severity::Unknown;
    } else if seen.contains(&Severity::Error) {
        overall = Severity::Error;
    } else if seen.contains(&Severity::Stopped) {
        overall = Severity::Stopped;
    } else if seen.contains(&Severity::Starting) {
        overall = Severity::Starting;
    } else if seen.contains(&Severity::Stopping) {
        overall = Severity::Stopping;
    } else if seen.contains(&Severity::Warn) {
        overall = Severity::Warn;
    } else if seen.contains(&Severity::RunningOk) {
        overall = Severity::RunningOk;
    }

    if !decommissioned {
        if services_running && overall == Severity::Stopped {
            overall = Severity::Error;
        }
        if maintenance_mode {
            message.push_str(" (in maintenance mode)");
            if overall == Severity::RunningOk {
                overall = Severity::Warn;
            }
        }
        if !services_running {
            message.push_str(&format!(" (stopped; normally runs {})", sets.enabled.join(", ")));
            if matches!(overall, Severity::RunningOk | Severity::Warn) {
                overall = Severity::Stopped;
            }
        }
        if !sets.running_but_not_enabled.is_empty() {
            message.push_str(&format!(
                " (running unexpected services: {})",
                sets.running_but_not_enabled.join(", ")
            ));
            if overall == Severity::RunningOk {
                overall = Severity::Warn;
            }
        }
        if services_running && !sets.enabled_but_not_running.is_empty() {
            message.push_str(&format!(" (services missing: {})", sets.enabled_but_not_running.join(", ")));
            overall = Severity::Error;
        }
    }

    for svc in &services {
        if svc.resolved_state() != Severity::RunningOk || !svc.message.is_empty() {
            message.push_str(&format!(" {}: {}", svc.service_name, svc.message));
        }
    }

    NodeStatus {
        overall,
        message: message.trim().to_string(),
        services_running,
        running_unexpectedly: sets.running_but_not_enabled,
        missing: sets.enabled_but_not_running,
        services,
    }
}

/// Default human-readable rendering: one aligned line per service plus a
/// trailing state/status line. ANSI color is the caller's call (applied
/// only on a TTY); this returns plain text.
pub fn render_default(node: &NodeStatus) -> String {
    let width = node
        .services
        .iter()
        .map(|s| s.service_name.len())
        .max()
        .unwrap_or(6)
        .max(6);
    let mut out = String::new();
    for svc in &node.services {
        out.push_str(&format!(
            "{:>width$}: {:>9}  {}\n",
            svc.service_name,
            svc.resolved_state().as_str(),
            svc.message,
            width = width
        ));
    }
    out.push_str(&format!("{:>width$}: {}\n", "State", node.message, width = width));
    out
}

/// Exit code for the default format: 0 on OK/WARN, 1 otherwise.
pub fn default_exit_code(node: &NodeStatus) -> i32 {
    match node.overall {
        Severity::RunningOk | Severity::Warn => 0,
        _ => 1,
    }
}

/// Nagios exit code remap: nagios has no notion of
/// decommissioned/starting/stopping/stopped, so those fold onto
/// error/warn/warn/(warn-or-error depending on whether services are
/// expected to be running).
pub fn nagios_exit_code(node: &NodeStatus) -> i32 {
    match node.overall {
        Severity::Decommissioned => Severity::Error as i32,
        Severity::Starting | Severity::Stopping => Severity::Warn as i32,
        Severity::Stopped => {
            if node.services_running {
                Severity::Error as i32
            } else {
                Severity::Warn as i32
            }
        }
        other => other as i32,
    }
}

/// Nagios single-line rendering: `"<message>|<k=value[unit];warn;error;min;max> …"`.
pub fn render_nagios(node: &NodeStatus) -> String {
    let mut data_str = String::new();
    for svc in &node.services {
        for (key, point) in &svc.data {
            data_str.push_str(&format!(" {key}={}", point.value));
            if let Some(unit) = point.unit {
                data_str.push_str(unit.nagios_code());
            }
            if point.warn.is_none() && point.error.is_none() && point.min.is_none() && point.max.is_none() {
                continue;
            }
            data_str.push(';');
            if let Some(warn) = point.warn {
                data_str.push_str(&warn.to_string());
            }
            if point.error.is_none() && point.min.is_none() && point.max.is_none() {
                continue;
            }
            data_str.push(';');
            if let Some(error) = point.error {
                data_str.push_str(&error.to_string());
            }
            if point.min.is_none() && point.max.is_none() {
                continue;
            }
            data_str.push(';');
            if let Some(min) = point.min {
                data_str.push_str(&min.to_string());
            }
            if point.max.is_none() {
                continue;
            }
            data_str.push(';');
            if let Some(max) = point.max {
                data_str.push_str(&max.to_string());
            }
        }
    }

    let message = node.message.trim();
    if data_str.is_empty() {
        message.to_string()
    } else {
        format!("{message}|{}", data_str.trim_start())
    }
}

/// `errors-only` rendering: a single line iff in error/unknown/decommissioned
/// state, or stopped while expected to be running; silent (and exit 0)
/// otherwise.
pub fn render_errors_only(node: &NodeStatus, hostname: &str) -> Option<String> {
    let in_error = matches!(node.overall, Severity::Error | Severity::Unknown | Severity::Decommissioned)
        || (node.services_running && node.overall == Severity::Stopped);
    in_error.then(|| format!("{hostname}: {}", node.message))
}

pub fn errors_only_exit_code(node: &NodeStatus) -> i32 {
    if render_errors_only(node, "").is_some() { 1 } else { 0 }
}

/// Silent format: exit code only, same mapping as the default format.
pub fn silent_exit_code(node: &NodeStatus) -> i32 {
    default_exit_code(node)
}

/// One `collectd` `PUTVAL` line per data point, for the continuous collectd
/// loop (spec §6). The loop itself - sleep, re-poll, exit when stopped - is
/// CLI-layer orchestration, not this module's concern.
pub fn render_collectd(node: &NodeStatus, hostname: &str, interval_secs: u64, timestamp: u64) -> String {
    let mut lines = String::new();
    let host = &hostname[..hostname.len().min(62)];
    for svc in &node.services {
        let group = &svc.service_name[..svc.service_name.len().min(62)];
        for (name, point) in &svc.data {
            let metric_name = point.group.as_deref().unwrap_or(name);
            let metric = &metric_name[..metric_name.len().min(62)];
            lines.push_str(&format!(
                "PUTVAL \"{host}/{group}/{metric}\" interval={interval_secs} {timestamp}:{}\n",
                point.value
            ));
        }
    }
    lines
}
