//! Narrowed YAML service manifest loader.
//!
//! The full settings grammar (§6: file globbing, env-variable overrides, type
//! coercion, conf-dir precedence) is an external collaborator; this module
//! only materializes the [`Service`] data model of spec §3 from a single YAML
//! document, the way the teacher's `config.rs` loads `systemg.yaml`.
use md5::{Digest, Md5};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::AngelError;

/// Whether a service runs on this node.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Always runs here.
    On,
    /// Never runs here.
    Off,
    /// Runs here iff the cluster is single-node or this node's address is
    /// in `hosts`.
    Default,
}

impl Default for Classification {
    fn default() -> Self {
        Classification::Default
    }
}

/// Resource limits applied by the Process Launcher prior to `exec`.
#[derive(Debug, Deserialize, Clone, Default, serde::Serialize)]
pub struct LimitsConfig {
    /// Maximum open file descriptors (`RLIMIT_NOFILE`).
    pub nofile: Option<u64>,
    /// Maximum number of processes (`RLIMIT_NPROC`).
    pub nproc: Option<u64>,
    /// Maximum locked memory in bytes (`RLIMIT_MEMLOCK`).
    pub memlock: Option<u64>,
    /// `nice` value applied to the child (-20..19).
    pub nice: Option<i32>,
    /// OOM-score adjustment applied to the child (-1000..1000).
    pub oom_adj: Option<i32>,
}

/// Monitoring thresholds for a service (spec §3, §4.8).
#[derive(Debug, Deserialize, Clone, Default, serde::Serialize)]
pub struct MonitoringConfig {
    /// Warn threshold for the 1-minute load average.
    pub load1_warn: Option<f64>,
    /// Warn threshold for the 5-minute load average.
    pub load5_warn: Option<f64>,
    /// Warn threshold for the 15-minute load average.
    pub load15_warn: Option<f64>,
    /// Hard error threshold applied to all load windows (default 40.0).
    pub load_error: Option<f64>,
    /// Seconds a load spike is tolerated before escalating to WARN.
    pub spike_grace_secs: Option<u64>,
    /// Warn threshold for `DATA_DIR` usage, as a fraction in `[0, 1]`.
    pub data_dir_warn_fraction: Option<f64>,
    /// Error threshold for `DATA_DIR` usage, as a fraction in `[0, 1]`.
    pub data_dir_error_fraction: Option<f64>,
}

/// Environment variables applied to a service process.
#[derive(Debug, Deserialize, Clone, Default, serde::Serialize)]
pub struct EnvConfig {
    /// Optional path to an environment file (`KEY=value` per line).
    pub file: Option<String>,
    /// Inline key/value pairs; override values loaded from `file`.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves `file` relative to `base` unless it is already absolute or exists as given.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() || path.exists() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }

    /// Merges root-level and service-level env blocks, service values winning.
    pub fn merge(root: Option<&EnvConfig>, service: Option<&EnvConfig>) -> Option<EnvConfig> {
        match (root, service) {
            (None, None) => None,
            (Some(r), None) => Some(r.clone()),
            (None, Some(s)) => Some(s.clone()),
            (Some(root_cfg), Some(service_cfg)) => {
                let mut merged_vars = root_cfg.vars.clone().unwrap_or_default();
                if let Some(service_vars) = &service_cfg.vars {
                    merged_vars.extend(service_vars.clone());
                }
                let file = service_cfg.file.clone().or_else(|| root_cfg.file.clone());
                Some(EnvConfig {
                    file,
                    vars: if merged_vars.is_empty() {
                        None
                    } else {
                        Some(merged_vars)
                    },
                })
            }
        }
    }
}

/// A declared service (spec §3's `Service`).
#[derive(Debug, Deserialize, Clone, Default, serde::Serialize)]
pub struct ServiceConfig {
    /// Binary or shell command used to start the service.
    pub command: String,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether this node runs the service (`on`/`off`/`default`).
    #[serde(default)]
    pub classification: Classification,
    /// Hosts this service is declared for, consulted when `classification` is `default`.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// User that should own the running process.
    pub user: Option<String>,
    /// Primary group for the running process.
    pub group: Option<String>,
    /// Supplementary groups applied after switching users.
    pub supplementary_groups: Option<Vec<String>>,
    /// Resource limits applied prior to `exec`.
    pub limits: Option<LimitsConfig>,
    /// Command that probes whether the service is healthy; exit 0 means OK.
    pub status_probe: Option<String>,
    /// Command invoked on `reload(code)` instead of a full restart.
    pub reload_command: Option<String>,
    /// Signal sent to request cooperative stop (default `TERM`).
    pub stop_signal: Option<String>,
    /// Seconds to wait for cooperative stop before escalating (hard-kill path).
    pub stop_timeout_secs: Option<u64>,
    /// Monitoring thresholds feeding the Status Aggregator.
    pub monitoring: Option<MonitoringConfig>,
    /// Environment variables for the service process.
    pub env: Option<EnvConfig>,
}

impl ServiceConfig {
    /// Computes a stable content hash of this service configuration, used to
    /// detect changes across reloads. Does not include the service name.
    pub fn compute_hash(&self) -> String {
        let json =
            serde_json::to_string(self).expect("ServiceConfig should always be serializable");
        let mut hasher = Md5::new();
        hasher.update(json.as_bytes());
        let digest = hasher.finalize();
        hex_encode(&digest[..8])
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Root configuration document (narrowed stand-in for the full settings file).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Map of service names to their respective configurations.
    pub services: HashMap<String, ServiceConfig>,
    /// Root directory from which relative paths are resolved.
    pub project_dir: Option<String>,
    /// Environment variables applied to all services unless overridden.
    pub env: Option<EnvConfig>,
}

impl Config {
    /// Computes a mapping from service names to their configuration hashes.
    pub fn service_hashes(&self) -> HashMap<String, String> {
        self.services
            .iter()
            .map(|(name, config)| (name.clone(), config.compute_hash()))
            .collect()
    }

    /// Returns the subset of services enabled on this node, given the node's
    /// own IP addresses and whether any service anywhere lists a non-loopback
    /// host (which would take the cluster out of single-node mode).
    pub fn enabled_services(&self, local_addrs: &[String]) -> Vec<String> {
        let single_node_mode = !self.services.values().any(|svc| {
            svc.hosts
                .iter()
                .any(|host| host != "127.0.0.1" && host != "localhost")
        });

        self.services
            .iter()
            .filter(|(_, cfg)| match cfg.classification {
                Classification::On => true,
                Classification::Off => false,
                Classification::Default => {
                    if single_node_mode {
                        true
                    } else {
                        cfg.hosts.iter().any(|host| local_addrs.contains(host))
                    }
                }
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Loads an `.env`-style file, setting process environment variables.
fn load_env_file(path: &str) -> Result<(), AngelError> {
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
                value = &value[1..value.len() - 1];
            }
            unsafe {
                env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Loads and parses the service manifest.
pub fn load_config(config_path: Option<&str>) -> Result<Config, AngelError> {
    let config_path = config_path.map(Path::new).unwrap_or_else(|| {
        if Path::new("angel.yaml").exists() {
            Path::new("angel.yaml")
        } else {
            Path::new("services.yaml")
        }
    });

    let content = fs::read_to_string(config_path).map_err(|e| {
        AngelError::Configuration(format!(
            "failed to read '{}': {e}",
            config_path.display()
        ))
    })?;

    let mut config: Config = serde_yaml::from_str(&content)
        .map_err(|e| AngelError::Configuration(format!("failed to parse config: {e}")))?;

    let base_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    if let Some(env_config) = &config.env
        && let Some(resolved_path) = env_config.path(&base_path)
    {
        load_env_file(&resolved_path.to_string_lossy())?;
    }
    if let Some(env_config) = &config.env
        && let Some(vars) = &env_config.vars
    {
        for (key, value) in vars {
            unsafe {
                env::set_var(key, value);
            }
        }
    }

    for service in config.services.values_mut() {
        let merged_env = EnvConfig::merge(config.env.as_ref(), service.env.as_ref());
        if let Some(env_config) = &merged_env
            && let Some(resolved_path) = env_config.path(&base_path)
        {
            load_env_file(&resolved_path.to_string_lossy())?;
        }
        service.env = merged_env;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn minimal_service() -> ServiceConfig {
        ServiceConfig {
            command: "echo ok".into(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn hash_is_stable_and_name_independent() {
        let a = minimal_service();
        let b = minimal_service();
        assert_eq!(a.compute_hash(), b.compute_hash());
        assert_eq!(a.compute_hash().len(), 16);
    }

    #[test]
    fn hash_changes_with_command() {
        let base = minimal_service();
        let mut changed = base.clone();
        changed.command = "echo different".into();
        assert_ne!(base.compute_hash(), changed.compute_hash());
    }

    #[test]
    fn enabled_services_single_node_mode_runs_default() {
        let mut services = HashMap::new();
        services.insert(
            "web".into(),
            ServiceConfig {
                classification: Classification::Default,
                ..minimal_service()
            },
        );
        let config = Config {
            version: "1".into(),
            services,
            project_dir: None,
            env: None,
        };
        let enabled = config.enabled_services(&[]);
        assert_eq!(enabled, vec!["web".to_string()]);
    }

    #[test]
    fn enabled_services_off_never_runs() {
        let mut services = HashMap::new();
        services.insert(
            "web".into(),
            ServiceConfig {
                classification: Classification::Off,
                ..minimal_service()
            },
        );
        let config = Config {
            version: "1".into(),
            services,
            project_dir: None,
            env: None,
        };
        assert!(config.enabled_services(&["10.0.0.1".into()]).is_empty());
    }

    #[test]
    fn enabled_services_default_needs_host_match_outside_single_node() {
        let mut services = HashMap::new();
        services.insert(
            "web".into(),
            ServiceConfig {
                classification: Classification::Default,
                hosts: vec!["10.0.0.5".into()],
                ..minimal_service()
            },
        );
        services.insert(
            "db".into(),
            ServiceConfig {
                classification: Classification::Default,
                hosts: vec!["10.0.0.9".into()],
                ..minimal_service()
            },
        );
        let config = Config {
            version: "1".into(),
            services,
            project_dir: None,
            env: None,
        };
        let enabled = config.enabled_services(&["10.0.0.5".to_string()]);
        assert_eq!(enabled, vec!["web".to_string()]);
    }

    #[test]
    fn load_env_file_sets_process_env() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join(".env");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "ANGEL_TEST_KEY=value").unwrap();

        load_env_file(file_path.to_str().unwrap()).unwrap();
        assert_eq!(env::var("ANGEL_TEST_KEY").unwrap(), "value");
    }
}
