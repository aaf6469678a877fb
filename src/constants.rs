//! Tunables and magic numbers shared across the supervisor, orchestrator, and installer.
use std::time::Duration;

// ============================================================================
// Supervisor backoff (spec §4.6)
// ============================================================================

/// Minimum backoff sleep, in seconds, after an unexpected child exit.
pub const BACKOFF_MIN_SECS: u64 = 5;
/// Maximum backoff sleep, in seconds.
pub const BACKOFF_MAX_SECS: u64 = 30;
/// Maximum random jitter added to a backoff sleep, in seconds.
pub const BACKOFF_JITTER_SECS: u64 = 60;
/// A child that ran at least this long resets the continuous-restart counter.
pub const BACKOFF_RESET_SECS: u64 = BACKOFF_MAX_SECS;
/// Per-restart backoff step, in seconds, added for each continuous failure.
pub const BACKOFF_STEP_SECS: u64 = 10;

/// Minimum free space, in bytes, required on `LOG_DIR`/`DATA_DIR`/`RUN_DIR`
/// before the supervisor will respawn a child.
pub const MIN_FREE_SPACE_BYTES: u64 = 100 * 1024 * 1024;
/// Sleep interval while waiting for free space to return.
pub const LOW_SPACE_RETRY: Duration = Duration::from_secs(10);

/// Poll interval used by the Stream Redirector's `select`-with-timeout loop.
pub const REDIRECTOR_POLL: Duration = Duration::from_millis(250);
/// Maximum bytes read per redirector iteration.
pub const REDIRECTOR_READ_CHUNK: usize = 1024;

/// Seconds the daemon-mode launcher will wait for a pidfile to appear.
pub const DAEMON_PIDFILE_WAIT_SECS: u64 = 10;
/// Poll interval while waiting for the daemon pidfile.
pub const DAEMON_PIDFILE_POLL: Duration = Duration::from_millis(250);

// ============================================================================
// Orchestrator (spec §4.7, §5)
// ============================================================================

/// Default `--wait` timeout, in seconds, for `service start/stop/restart`.
pub const DEFAULT_WAIT_SECS: u64 = 600;
/// Poll interval for `waitForOkayStatus`.
pub const OKAY_STATUS_POLL: Duration = Duration::from_secs(1);
/// Poll interval while acquiring the node lock.
pub const LOCK_POLL: Duration = Duration::from_millis(500);
/// Default deadline for acquiring the node lock.
pub const LOCK_DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// Grace period for hard-kill: SIGTERM is given this long before SIGKILL.
pub const HARD_KILL_GRACE: Duration = Duration::from_secs(4);
/// Default name for the node lock (spec §5).
pub const DEFAULT_NODE_LOCK_NAME: &str = "angel-service";

// ============================================================================
// Status Aggregator thresholds (spec §4.8)
// ============================================================================

/// Default hard error threshold for load average monitoring.
pub const LOAD_ERROR_THRESHOLD: f64 = 40.0;
/// Seconds a load spike is tolerated within the "grace" window before WARN.
pub const SHORT_SPIKE_TIME_SECS: u64 = 60;

/// Disk free space (MB) below which status is WARN.
pub const DISK_WARN_FREE_MB: u64 = 1000;
/// Disk free space (MB) below which status is ERROR.
pub const DISK_ERROR_FREE_MB: u64 = 250;
/// Disk usage fraction (0.0-1.0) above which status is WARN.
pub const DISK_WARN_USED_FRACTION: f64 = 0.80;
/// Disk usage fraction above which status is ERROR.
pub const DISK_ERROR_USED_FRACTION: f64 = 0.98;
/// Free inode count below which status is WARN.
pub const INODES_WARN_FREE: u64 = 90_000;
/// Free inode count below which status is ERROR.
pub const INODES_ERROR_FREE: u64 = 10_000;

// ============================================================================
// File/path naming
// ============================================================================

/// Name of the content-store safety-check file (spec §4.2, §6).
pub const DEDUP_SAFETY_CHECK_FILE: &str = ".dedup_safety_check";
/// Name of the hardlink-count safety companion to the safety-check file.
pub const DEDUP_SAFETY_CHECK_LINK: &str = ".dedup_safety_check-2";
/// Directory name under `versions_dir` holding version-store metadata.
pub const VERSION_DATA_DIR: &str = ".angel_version_data";
/// Directory name under `versions_dir/.angel_version_data` holding the content store.
pub const DEDUP_HARDLINKS_DIR: &str = "dedup_hardlinks";
/// Directory name under `versions_dir/.angel_version_data` holding downgrade pointers.
pub const DOWNGRADES_DIR: &str = "downgrades";
/// Name of the global pin-file under `versions_dir/.angel_version_data`.
pub const PIN_FILE: &str = "version_pinned.lock";
/// Per-version metadata directory inside each installed version tree.
pub const ANGEL_META_DIR: &str = ".angel";
/// Name of the global decommissioned marker file.
pub const DECOMMISSIONED_MARKER: &str = ".angel-decommissioned";
/// Name of the maintenance-mode marker file under `DATA_DIR`.
pub const MAINTENANCE_MODE_MARKER: &str = ".maintenance_mode_lock";
/// Name of the node lifecycle state file under `LOCK_DIR`.
pub const NODE_STATE_FILE: &str = "service_state.lock";
