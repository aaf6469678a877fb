//! Pidfile Store (spec §4.1): atomic on-disk `{pid, extras}` records that are
//! the ground truth for "is this service running here."
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::error::PidFileError;

/// Parsed contents of a pidfile: the live pid (if any) plus sorted extras.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidRecord {
    /// The pid recorded in the first line, present only if that pid is
    /// currently running.
    pub pid: Option<i32>,
    /// `key=value` lines following the pid line, in sorted order.
    pub extras: BTreeMap<String, String>,
}

impl PidRecord {
    /// A record with no pid and no extras.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Returns true if `pid` currently names a running process. Uses signal 0,
/// which performs permission/existence checks without actually signaling.
/// `EPERM` still means the process exists (just owned by someone else).
pub fn pid_is_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn collapse_newlines(value: &str) -> String {
    value.replace('\n', " | ").replace('\r', "")
}

fn serialize(pid: Option<i32>, extras: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    match pid {
        Some(p) => out.push_str(&p.to_string()),
        None => {}
    }
    out.push('\n');
    for (key, value) in extras {
        out.push_str(key);
        out.push('=');
        out.push_str(&collapse_newlines(value));
        out.push('\n');
    }
    out
}

fn atomic_write(path: &Path, contents: &str) -> Result<(), PidFileError> {
    let pid = std::process::id();
    let tmp_path = path.with_extension(format!("{pid}"));
    (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })()
    .map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        PidFileError::Io {
            path: path.display().to_string(),
            source,
        }
    })
}

/// Parses raw pidfile contents into a [`PidRecord`]. The first line is the
/// pid (or empty); malformed `key=value` lines after it are skipped with a
/// warning, not treated as fatal.
fn parse(path: &Path, contents: &str) -> PidRecord {
    let mut lines = contents.lines();
    let pid = lines
        .next()
        .and_then(|first| first.trim().parse::<i32>().ok())
        .filter(|pid| pid_is_running(*pid));

    let mut extras = BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                extras.insert(key.to_string(), value.to_string());
            }
            None => {
                warn!(
                    "skipping malformed pidfile line in '{}': {line:?}",
                    path.display()
                );
            }
        }
    }

    PidRecord { pid, extras }
}

/// Writes `pid` (and `extras`) to `path`, atomically via write-to-temp +
/// rename. Fails with [`PidFileError::OwnedByOther`] if `path` currently
/// records a live pid that is not `pid` (or not the calling process, when
/// `pid` is the caller's own pid).
pub fn write(
    path: &Path,
    pid: Option<i32>,
    extras: &BTreeMap<String, String>,
) -> Result<(), PidFileError> {
    if let Ok(existing) = read(path) {
        let caller_pid = std::process::id() as i32;
        if let Some(owner) = existing.pid
            && owner != caller_pid
            && Some(owner) != pid
        {
            return Err(PidFileError::OwnedByOther {
                path: path.display().to_string(),
                owner,
            });
        }
    }

    atomic_write(path, &serialize(pid, extras))
}

/// Reads and parses `path`. A first-pass parse failure (e.g. a reader caught
/// mid-rename) is retried once before propagating the I/O error; a cleanly
/// absent file yields an empty record.
pub fn read(path: &Path) -> Result<PidRecord, PidFileError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(parse(path, &contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PidRecord::empty()),
        Err(err) => {
            // Tolerate a reader racing a concurrent writer's rename.
            match fs::read_to_string(path) {
                Ok(contents) => Ok(parse(path, &contents)),
                Err(_) => Err(PidFileError::Io {
                    path: path.display().to_string(),
                    source: err,
                }),
            }
        }
    }
}

/// Rewrites `path` preserving `extras` with an empty pid line, or removes the
/// file entirely if there is nothing left to preserve.
pub fn release(path: &Path) -> Result<(), PidFileError> {
    let existing = read(path)?;
    if existing.extras.is_empty() {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    } else {
        atomic_write(path, &serialize(None, &existing.extras))
    }
}

/// Merges `delta` into the extras recorded at `path`. A `None` or empty
/// value deletes the key. The pid line is preserved unchanged.
pub fn update(path: &Path, delta: &BTreeMap<String, Option<String>>) -> Result<(), PidFileError> {
    let mut existing = read(path)?;
    for (key, value) in delta {
        match value {
            Some(v) if !v.is_empty() => {
                existing.extras.insert(key.clone(), v.clone());
            }
            _ => {
                existing.extras.remove(key);
            }
        }
    }
    atomic_write(path, &serialize(existing.pid, &existing.extras))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");
        let mut extras = BTreeMap::new();
        extras.insert("child_pid".to_string(), "123".to_string());
        extras.insert("start_count".to_string(), "1".to_string());

        let my_pid = std::process::id() as i32;
        write(&path, Some(my_pid), &extras).expect("write");

        let record = read(&path).expect("read");
        assert_eq!(record.pid, Some(my_pid));
        assert_eq!(record.extras.get("child_pid"), Some(&"123".to_string()));
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.lock");
        let record = read(&path).expect("read");
        assert_eq!(record, PidRecord::empty());
    }

    #[test]
    fn write_rejects_live_foreign_owner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");

        // init pid 1 is always alive and is never the test process.
        write(&path, Some(1), &BTreeMap::new()).expect("seed with pid 1");

        let my_pid = std::process::id() as i32;
        let err = write(&path, Some(my_pid), &BTreeMap::new())
            .expect_err("should refuse to steal a live owner's pidfile");
        match err {
            PidFileError::OwnedByOther { owner, .. } => assert_eq!(owner, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stale_pid_is_not_reported_as_live() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");
        // pid 999999 is very unlikely to be alive in any test environment.
        fs::write(&path, "999999\nchild_pid=1\n").unwrap();

        let record = read(&path).expect("read");
        assert_eq!(record.pid, None);
        assert_eq!(record.extras.get("child_pid"), Some(&"1".to_string()));
    }

    #[test]
    fn release_preserves_extras_with_empty_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");
        let mut extras = BTreeMap::new();
        extras.insert("status_message".to_string(), "ok".to_string());
        write(&path, Some(std::process::id() as i32), &extras).unwrap();

        release(&path).expect("release");

        let record = read(&path).expect("read");
        assert_eq!(record.pid, None);
        assert_eq!(
            record.extras.get("status_message"),
            Some(&"ok".to_string())
        );
    }

    #[test]
    fn release_removes_file_when_nothing_to_preserve() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");
        write(&path, Some(std::process::id() as i32), &BTreeMap::new()).unwrap();

        release(&path).expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn update_merges_and_deletes_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");
        let mut extras = BTreeMap::new();
        extras.insert("a".to_string(), "1".to_string());
        extras.insert("b".to_string(), "2".to_string());
        write(&path, None, &extras).unwrap();

        let mut delta = BTreeMap::new();
        delta.insert("b".to_string(), None);
        delta.insert("c".to_string(), Some("3".to_string()));
        update(&path, &delta).expect("update");

        let record = read(&path).expect("read");
        assert_eq!(record.extras.get("a"), Some(&"1".to_string()));
        assert!(!record.extras.contains_key("b"));
        assert_eq!(record.extras.get("c"), Some(&"3".to_string()));
    }

    #[test]
    fn newlines_in_values_are_collapsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.lock");
        let mut extras = BTreeMap::new();
        extras.insert("status_message".to_string(), "line one\nline two".to_string());
        write(&path, None, &extras).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("line one\nline two"));
        assert!(raw.contains("line one | line two"));
    }
}
