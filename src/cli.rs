//! Command-line interface (spec §6): a thin `clap`-derived binding from
//! parsed args into Orchestrator / Versioned Installer / Status Aggregator
//! calls. The full settings grammar and argument tree are external
//! collaborators (spec §1); this only covers the `service`, `status`, and
//! `package` command families.
use clap::{Parser, Subcommand, ValueEnum};
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Parses `--wait` / `--wait=SECS` (spec §6): bare presence means "wait the
/// default deadline", an explicit value overrides it.
#[derive(Clone, Copy, Debug)]
pub struct WaitArg(pub Option<u64>);

impl FromStr for WaitArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Ok(WaitArg(None));
        }
        value
            .parse::<u64>()
            .map(|secs| WaitArg(Some(secs)))
            .map_err(|_| format!("invalid --wait value '{value}'"))
    }
}

impl WaitArg {
    pub fn to_duration(self, default_secs: u64) -> Duration {
        Duration::from_secs(self.0.unwrap_or(default_secs))
    }
}

/// `status --format` (spec §6).
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum StatusFormat {
    Collectd,
    Nagios,
    ErrorsOnly,
    Silent,
}

/// Command-line interface.
#[derive(Parser)]
#[command(name = "angelctl", version, author)]
#[command(about = "Node-local service supervisor and deployment controller", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to the service manifest (defaults to `angel.yaml`/`services.yaml`).
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Opt into privileged system mode. Requires running as root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level command families (spec §6).
#[derive(Subcommand)]
pub enum Commands {
    /// Per-service lifecycle verbs.
    Service {
        #[command(subcommand)]
        verb: ServiceVerb,
    },

    /// Node/service health (spec §4.8).
    Status {
        /// Service names to restrict the report to (default: every declared service).
        service: Vec<String>,

        /// Reports only the node lifecycle state (spec §5), ignoring per-service detail.
        #[arg(long)]
        state: bool,

        /// Output rendering (default is the aligned human table).
        #[arg(long, value_enum)]
        format: Option<StatusFormat>,

        /// Per-service probe timeout in seconds (default 14, matching nrpe).
        #[arg(long, value_name = "SECS", default_value_t = 14)]
        timeout: u64,

        /// Wait for the node to settle before reporting.
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "")]
        wait: Option<WaitArg>,
    },

    /// Versioned-deployment operations.
    Package {
        #[command(subcommand)]
        verb: PackageVerb,
    },
}

/// `service` subcommands (spec §6 / §4.7).
#[derive(Subcommand)]
pub enum ServiceVerb {
    /// Starts every service in `Enabled \ Running`.
    Start {
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "")]
        wait: Option<WaitArg>,
    },
    /// Stops every service in `Running`.
    Stop {
        /// Brute-force kill the whole process tree first.
        #[arg(long)]
        hard: bool,
    },
    /// Stops then starts.
    Restart {
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "")]
        wait: Option<WaitArg>,
        #[arg(long)]
        hard: bool,
    },
    /// Reconciles membership, then reloads the remaining running set.
    Reload {
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "")]
        wait: Option<WaitArg>,
    },
    /// Reconciles membership, then repairs whatever is left running.
    Repair,
    /// Truncates and reopens every service's stdout/stderr log files.
    RotateLogs,
    /// Toggles maintenance mode.
    Mode {
        #[arg(value_enum)]
        mode: MaintenanceMode,
    },
    /// Sets or unsets a runtime configuration override.
    Conf {
        #[command(subcommand)]
        verb: ConfVerb,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum MaintenanceMode {
    Maintenance,
    Regular,
}

#[derive(Subcommand)]
pub enum ConfVerb {
    /// `K=V` or `K` (boolean-style presence).
    Set { entry: String },
    Unset { key: String },
}

/// `package` subcommands (spec §6 / §4.3).
#[derive(Subcommand)]
pub enum PackageVerb {
    /// Switches the default branch.
    Branch {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Installs and activates a new version.
    Upgrade {
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long = "downgrade-allowed")]
        downgrade_allowed: bool,
        #[arg(long = "download-only")]
        download_only: bool,
        #[arg(long)]
        force: bool,
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "")]
        jitter: Option<WaitArg>,
        #[arg(long = "skip-reload")]
        skip_reload: bool,
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "")]
        wait: Option<WaitArg>,
    },
    /// Reverts a branch to the version it was upgraded from.
    Rollback { version: String },
    /// Removes an installed version.
    Delete {
        version: String,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Enables or disables pinning of branch defaults.
    Pinning {
        #[command(subcommand)]
        verb: PinningVerb,
    },
    /// Lists installed versions for a branch.
    Versions {
        #[arg(long)]
        branch: Option<String>,
    },
    /// Checks whether `--version` is installed and active.
    CheckVersion {
        #[arg(long)]
        version: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        silent: bool,
    },
    /// Materializes a new version tree from `SRC` under `DIR`.
    AddVersion {
        dir: String,
        src: String,
        branch: String,
        version: String,
    },
}

#[derive(Subcommand)]
pub enum PinningVerb {
    On { reason: Option<String> },
    Off,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
