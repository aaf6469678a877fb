//! Lightweight process manager for Unix services.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Status aggregator.
pub mod status;

/// Supervisor daemon.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// Runtime paths and modes.
pub mod runtime;

/// Privilege dropping.
pub mod privilege;

/// Pidfile store.
pub mod pidfile;

/// Node and named locks.
pub mod lock;

/// Content-addressed link store.
pub mod store;

/// Versioned installer.
pub mod versions;

/// Process launcher.
pub mod launcher;

/// Stream redirector.
pub mod redirector;

/// Service orchestrator.
pub mod orchestrator;

/// Per-key file cache.
pub mod cache;

/// Load, disk, inode, and network collectors.
pub mod stats;
