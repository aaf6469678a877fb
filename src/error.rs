//! Error taxonomy for the supervisor, orchestrator, and versioned installer.
use thiserror::Error;

/// Errors raised by the Pidfile Store (§4.1).
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The pidfile at `path` records a live pid that is not the caller's.
    #[error("pidfile '{path}' is owned by running pid {owner}")]
    OwnedByOther {
        /// Path to the contested pidfile.
        path: String,
        /// The pid currently recorded in the file.
        owner: i32,
    },
    /// Underlying I/O failure reading or writing the pidfile.
    #[error("pidfile I/O error at '{path}': {source}")]
    Io {
        /// Path involved in the failing operation.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the content-addressed link store (§4.2).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store directory and the destination tree are not on the same filesystem.
    #[error("store '{store}' and tree '{tree}' are on different filesystems")]
    CrossFilesystem {
        /// The store directory.
        store: String,
        /// The destination tree.
        tree: String,
    },
    /// GC was asked to run against a store with no safety-check file.
    #[error("refusing to gc store '{0}': missing safety-check file")]
    MissingSafetyFile(String),
    /// Underlying I/O failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the versioned installer (§4.3).
#[derive(Debug, Error)]
pub enum VersionError {
    /// `(branch, version)` already exists.
    #[error("version '{branch}/{version}' already installed")]
    AlreadyInstalled {
        /// Branch name.
        branch: String,
        /// Version string.
        version: String,
    },
    /// `(branch, version)` is not installed.
    #[error("version '{branch}/{version}' is not installed")]
    NotInstalled {
        /// Branch name.
        branch: String,
        /// Version string.
        version: String,
    },
    /// Attempted downgrade without `downgrade_allowed`.
    #[error("'{branch}/{version}' is older than the current default; pass downgrade_allowed")]
    DowngradeNotAllowed {
        /// Branch name.
        branch: String,
        /// Version string.
        version: String,
    },
    /// Pinning blocks the requested default change.
    #[error("branch defaults are pinned; pass force to override")]
    Pinned,
    /// Version is in use and deletion was not forced.
    #[error("version '{branch}/{version}' is in use")]
    InUse {
        /// Branch name.
        branch: String,
        /// Version string.
        version: String,
    },
    /// A version segment was not a valid non-negative integer.
    #[error("invalid version string '{0}': segments must be non-negative integers")]
    InvalidVersion(String),
    /// A `pre_activate.sh`/`post_activate.sh` hook exited non-zero.
    #[error("activation hook '{hook}' failed with status {status}")]
    HookFailed {
        /// Hook script name.
        hook: String,
        /// Exit status of the hook process.
        status: i32,
    },
    /// A setuid file was encountered while materializing a version tree.
    #[error("setuid file '{0}' is not supported in version trees")]
    SetuidRejected(String),
    /// The rollback pointer for `(branch, from_version)` was absent.
    #[error("no rollback pointer recorded for '{branch}' from '{from_version}'")]
    NoRollbackPointer {
        /// Branch name.
        branch: String,
        /// Version being rolled back from.
        from_version: String,
    },
    /// Underlying content store error.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Underlying I/O failure.
    #[error("version I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the process launcher (§4.4).
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Failed to create or chown/chmod the log directory before exec.
    #[error("failed to prepare log directory '{0}': {1}")]
    LogDirSetup(String, std::io::Error),
    /// `fork(2)` failed.
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    /// Privilege-drop step failed.
    #[error("failed to drop privileges for service '{service}': {source}")]
    PrivilegeDrop {
        /// Service name.
        service: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `exec` itself failed (e.g. command not found).
    #[error("exec failed for '{0}': {1}")]
    Exec(String, #[source] nix::Error),
    /// The daemon mode timed out waiting for the pidfile to appear.
    #[error("timed out waiting for pidfile '{0}' to appear")]
    PidfileTimeout(String),
}

/// Errors raised by the supervisor event loop (§4.6).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Underlying pidfile error.
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    /// Underlying launch error.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Signal-related failure (install/forward/wait).
    #[error("signal error: {0}")]
    Signal(#[source] nix::Error),
    /// Another supervisor already holds the pidfile for this service.
    #[error("superseded: pidfile no longer names this supervisor")]
    Superseded,
}

/// Errors raised by the service orchestrator (§4.7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The node is decommissioned and refuses further lifecycle operations.
    #[error("node is decommissioned")]
    Decommissioned,
    /// Could not acquire the node lock before the deadline.
    #[error("could not acquire node lock '{name}' (held by pid {holder})")]
    LockContention {
        /// Lock name.
        name: String,
        /// Pid currently holding the lock.
        holder: i32,
    },
    /// Requested service is not declared in configuration.
    #[error("unknown service '{0}'")]
    UnknownService(String),
    /// A per-call timeout expired.
    #[error("operation on '{0}' timed out")]
    Timeout(String),
    /// Decommission preflight failed on one or more services.
    #[error("decommission preflight failed: {0:?}")]
    PreflightFailed(Vec<String>),
    /// Underlying pidfile error.
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    /// Underlying supervisor error.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while building or refreshing status (§4.8).
#[derive(Debug, Error)]
pub enum StatusError {
    /// Underlying pidfile error.
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error type surfaced at the CLI boundary (spec §7 taxonomy).
#[derive(Debug, Error)]
pub enum AngelError {
    /// Operator supplied a bad flag, unknown command, or malformed value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Required configuration is missing or ambiguous.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Command requires root/target user and current uid mismatches.
    #[error("privilege error: {0} (try sudo?)")]
    Privilege(String),
    /// Pidfile store failure.
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    /// Content store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Versioned installer failure.
    #[error(transparent)]
    Version(#[from] VersionError),
    /// Launcher failure.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Supervisor failure.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// Orchestrator failure.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// Status aggregation failure.
    #[error(transparent)]
    Status(#[from] StatusError),
    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AngelError {
    /// Maps an error to a process exit code per spec §6/§7: 0 only for success/WARN,
    /// non-zero otherwise. This mapping is used for hard failures raised before a
    /// status verdict is even computed (e.g. lock contention, bad arguments).
    pub fn exit_code(&self) -> i32 {
        match self {
            AngelError::InvalidArgument(_) => 2,
            AngelError::Configuration(_) => 3,
            AngelError::Privilege(_) => 4,
            AngelError::Orchestrator(OrchestratorError::LockContention { .. }) => 5,
            AngelError::Orchestrator(OrchestratorError::Timeout(_)) => 1,
            AngelError::Version(_) => 6,
            _ => 1,
        }
    }
}
