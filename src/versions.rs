//! Versioned Installer (spec §4.3): materializes version trees via the
//! content-addressed store, activates them via atomic symlink swaps, tracks
//! per-branch rollback pointers, pinning, and stale-version GC.
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::info;

use crate::constants::{ANGEL_META_DIR, DEDUP_HARDLINKS_DIR, DOWNGRADES_DIR, PIN_FILE, VERSION_DATA_DIR};
use crate::error::VersionError;
use crate::store;

/// Parses a dotted version string into numeric segments.
pub fn parse_version(version: &str) -> Result<Vec<u64>, VersionError> {
    version
        .split('.')
        .map(|segment| {
            segment
                .parse::<u64>()
                .map_err(|_| VersionError::InvalidVersion(version.to_string()))
        })
        .collect()
}

/// Segment-wise numeric comparison: `1.10 > 1.9`, missing trailing segments
/// are treated as zero.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, VersionError> {
    let sa = parse_version(a)?;
    let sb = parse_version(b)?;
    let len = sa.len().max(sb.len());
    for i in 0..len {
        let va = sa.get(i).copied().unwrap_or(0);
        let vb = sb.get(i).copied().unwrap_or(0);
        match va.cmp(&vb) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

fn version_data_dir(versions_dir: &Path) -> PathBuf {
    versions_dir.join(VERSION_DATA_DIR)
}

fn hardlinks_dir(versions_dir: &Path) -> PathBuf {
    version_data_dir(versions_dir).join(DEDUP_HARDLINKS_DIR)
}

fn pin_file(versions_dir: &Path) -> PathBuf {
    version_data_dir(versions_dir).join(PIN_FILE)
}

fn branch_dir(versions_dir: &Path, branch: &str) -> PathBuf {
    versions_dir.join(branch)
}

fn version_dir(versions_dir: &Path, branch: &str, version: &str) -> PathBuf {
    branch_dir(versions_dir, branch).join(version)
}

fn global_default_link(versions_dir: &Path) -> PathBuf {
    versions_dir.join("_default")
}

fn branch_default_link(versions_dir: &Path, branch: &str) -> PathBuf {
    branch_dir(versions_dir, branch).join("_default")
}

fn rollback_pointer_path(versions_dir: &Path, branch: &str, from_version: &str) -> PathBuf {
    version_data_dir(versions_dir)
        .join(DOWNGRADES_DIR)
        .join(branch)
        .join(format!("downgrade-from-{from_version}"))
}

/// Atomically swaps a symlink at `link` to point at `target`, via
/// write-to-`<link>.new` + rename.
fn swap_symlink(link: &Path, target: &str) -> io::Result<()> {
    let tmp = link.with_extension("new");
    if tmp.exists() || fs::symlink_metadata(&tmp).is_ok() {
        let _ = fs::remove_file(&tmp);
    }
    std::os::unix::fs::symlink(target, &tmp)?;
    fs::rename(&tmp, link)?;
    sync_best_effort();
    Ok(())
}

fn sync_best_effort() {
    unsafe {
        libc::sync();
    }
}

fn is_installed(versions_dir: &Path, branch: &str, version: &str) -> bool {
    version_dir(versions_dir, branch, version)
        .join(ANGEL_META_DIR)
        .is_dir()
}

fn read_link_target(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
}

/// Returns the branch's current default version, if one is set.
pub fn branch_default_version(versions_dir: &Path, branch: &str) -> Option<String> {
    read_link_target(&branch_default_link(versions_dir, branch))
}

/// Returns the global default branch, if one is set.
pub fn global_default_branch(versions_dir: &Path) -> Option<String> {
    read_link_target(&global_default_link(versions_dir))
}

/// Switches the global default branch to `branch` without installing
/// anything, gated by pinning the same way `activate` is. `branch` must
/// already have a default version of its own.
pub fn set_default_branch(versions_dir: &Path, branch: &str, force: bool) -> Result<(), VersionError> {
    if branch_default_version(versions_dir, branch).is_none() {
        return Err(VersionError::NotInstalled {
            branch: branch.to_string(),
            version: "<no default version>".to_string(),
        });
    }

    if !force && pin_file(versions_dir).exists() {
        return Err(VersionError::Pinned);
    }

    swap_symlink(&global_default_link(versions_dir), branch)?;
    info!("default branch switched to '{branch}'");
    Ok(())
}

/// Creates or removes the pin file that blocks unforced default changes.
pub fn set_pinned(versions_dir: &Path, pinned: bool, reason: Option<&str>) -> io::Result<()> {
    let path = pin_file(versions_dir);
    if pinned {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, reason.unwrap_or("").as_bytes())?;
        info!("branch defaults pinned");
    } else {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        info!("branch defaults unpinned");
    }
    Ok(())
}

/// Whether branch/global defaults are currently pinned.
pub fn is_pinned(versions_dir: &Path) -> bool {
    pin_file(versions_dir).exists()
}

fn has_setuid(mode: u32) -> bool {
    mode & 0o4000 != 0
}

struct WalkState<'a> {
    source: &'a Path,
    staging: &'a Path,
    store_dir: &'a Path,
    checksums: &'a HashMap<PathBuf, String>,
    manifest: HashMap<PathBuf, String>,
    sleep_ratio: f64,
}

/// Creates a new version tree at `<versions_dir>/<branch>/<version>` by
/// hard-linking file bodies from `source` through the content store.
/// `checksum_manifest` lets a build server ship precomputed
/// relative-path -> checksum-name pairs, skipping the per-file hash here.
pub fn create(
    versions_dir: &Path,
    branch: &str,
    version: &str,
    source: &Path,
    sleep_ratio: f64,
    checksum_manifest: Option<HashMap<PathBuf, String>>,
) -> Result<(), VersionError> {
    if is_installed(versions_dir, branch, version) {
        return Err(VersionError::AlreadyInstalled {
            branch: branch.to_string(),
            version: version.to_string(),
        });
    }

    let sleep_ratio = sleep_ratio.clamp(0.0, 0.999);
    let store_dir = hardlinks_dir(versions_dir);
    store::ensure_init(&store_dir)?;

    let staging = branch_dir(versions_dir, branch).join(format!(".creating_{version}"));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let start = Instant::now();
    let mut state = WalkState {
        source,
        staging: &staging,
        store_dir: &store_dir,
        checksums: &checksum_manifest.unwrap_or_default(),
        manifest: HashMap::new(),
        sleep_ratio,
    };

    let result = walk_create(source, &staging, &mut state, start);
    if let Err(err) = result {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    write_metadata(&staging, branch, version, versions_dir, &state.manifest)?;

    let final_dir = version_dir(versions_dir, branch, version);
    fs::rename(&staging, &final_dir)?;

    if global_default_branch(versions_dir).is_none() {
        swap_symlink(&global_default_link(versions_dir), branch)?;
    }
    if branch_default_version(versions_dir, branch).is_none() {
        swap_symlink(&branch_default_link(versions_dir, branch), version)?;
    }

    info!("installed '{branch}/{version}'");
    Ok(())
}

fn walk_create(
    src_dir: &Path,
    dest_dir: &Path,
    state: &mut WalkState,
    start: Instant,
) -> Result<(), VersionError> {
    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let dest_path = dest_dir.join(entry.file_name());

        if file_type.is_symlink() {
            copy_symlink(state.source, &path, &dest_path)?;
        } else if file_type.is_dir() {
            let meta = fs::metadata(&path)?;
            fs::create_dir_all(&dest_path)?;
            fs::set_permissions(&dest_path, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
            walk_create(&path, &dest_path, state, start)?;
            throttle(state.sleep_ratio, start);
        } else if file_type.is_file() {
            let meta = fs::metadata(&path)?;
            if has_setuid(meta.mode()) {
                return Err(VersionError::SetuidRejected(path.display().to_string()));
            }

            let relative = path.strip_prefix(state.source).unwrap_or(&path).to_path_buf();
            let hash = match state.checksums.get(&relative) {
                Some(canonical_name) => canonical_name
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string(),
                None => store::hash_file(&path)?,
            };

            store::link_into(state.store_dir, &dest_path, &path, &hash, meta.len(), meta.mode())?;
            state
                .manifest
                .insert(relative, store::name_for(&hash, meta.len(), meta.mode()));
        }
    }
    Ok(())
}

fn throttle(sleep_ratio: f64, start: Instant) {
    if sleep_ratio <= 0.0 {
        return;
    }
    let elapsed = start.elapsed();
    let sleep_for = elapsed.mul_f64(sleep_ratio / (1.0 - sleep_ratio).max(0.001));
    let capped = sleep_for.min(Duration::from_secs(5));
    if !capped.is_zero() {
        std::thread::sleep(capped);
    }
}

fn copy_symlink(source_root: &Path, link: &Path, dest: &Path) -> Result<(), VersionError> {
    let target = fs::read_link(link)?;
    let resolved = if target.is_absolute() {
        target.clone()
    } else {
        link.parent().unwrap_or(Path::new("/")).join(&target)
    };

    let within_source = resolved.starts_with(source_root);
    let link_target = if within_source { target } else { resolved };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(&link_target, dest)?;
    Ok(())
}

fn write_metadata(
    staging: &Path,
    branch: &str,
    version: &str,
    versions_dir: &Path,
    manifest: &HashMap<PathBuf, String>,
) -> Result<(), VersionError> {
    let meta_dir = staging.join(ANGEL_META_DIR);
    fs::create_dir_all(&meta_dir)?;
    fs::write(meta_dir.join("code_branch"), branch)?;
    fs::write(meta_dir.join("code_version"), version)?;
    fs::write(meta_dir.join("versions_dir"), versions_dir.display().to_string())?;

    let checksums_text = manifest
        .iter()
        .map(|(path, name)| format!("{}={}", path.display(), name))
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(meta_dir.join("file_checksums"), checksums_text)?;
    Ok(())
}

/// Activates `(branch, version)` as the new default. See spec §4.3 for the
/// full precondition list (installed, not-already-default, downgrade
/// policy, pinning, hooks, rollback-pointer bookkeeping).
pub fn activate(
    versions_dir: &Path,
    branch: &str,
    version: &str,
    downgrade_allowed: bool,
    jitter: Duration,
    force: bool,
) -> Result<(), VersionError> {
    if !is_installed(versions_dir, branch, version) {
        return Err(VersionError::NotInstalled {
            branch: branch.to_string(),
            version: version.to_string(),
        });
    }

    let current = branch_default_version(versions_dir, branch);
    if current.as_deref() == Some(version) {
        return Ok(());
    }

    if let Some(current_version) = &current
        && compare_versions(version, current_version)? == Ordering::Less
        && !downgrade_allowed
    {
        return Err(VersionError::DowngradeNotAllowed {
            branch: branch.to_string(),
            version: version.to_string(),
        });
    }

    if !force && pin_file(versions_dir).exists() {
        return Err(VersionError::Pinned);
    }

    if !jitter.is_zero() {
        let millis = rand::rng().random_range(0..=jitter.as_millis().max(1) as u64);
        std::thread::sleep(Duration::from_millis(millis));
    }

    let new_tree = version_dir(versions_dir, branch, version);
    run_hook(&new_tree, "pre_activate.sh", versions_dir)?;

    swap_symlink(&branch_default_link(versions_dir, branch), version)?;
    swap_symlink(&global_default_link(versions_dir), branch)?;

    if let Some(current_version) = current {
        let is_forward = compare_versions(version, &current_version)? == Ordering::Greater;
        if is_forward {
            let pointer = rollback_pointer_path(versions_dir, branch, version);
            if let Some(parent) = pointer.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(pointer, &current_version)?;
        }
    }

    run_hook(&new_tree, "post_activate.sh", versions_dir)?;

    info!("activated '{branch}/{version}'");
    Ok(())
}

fn run_hook(tree: &Path, script: &str, versions_dir: &Path) -> Result<(), VersionError> {
    let hook_path = tree.join(ANGEL_META_DIR).join(script);
    if !hook_path.exists() {
        return Ok(());
    }

    let status = Command::new(&hook_path)
        .env("VERSIONS_DIR", versions_dir)
        .status()?;

    if !status.success() {
        return Err(VersionError::HookFailed {
            hook: script.to_string(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Rolls `branch` back to the version recorded as the rollback pointer for
/// `downgrade_from`. Rollback is defined *from* a version, not *to* one, so
/// a node that has not yet stepped forward cannot jump further back than
/// intended. `downgrade_from` must currently be the branch default; once
/// consumed, the pointer is removed, so repeating the same rollback call
/// errors instead of silently replaying it.
pub fn rollback(versions_dir: &Path, branch: &str, downgrade_from: &str) -> Result<(), VersionError> {
    if branch_default_version(versions_dir, branch).as_deref() != Some(downgrade_from) {
        return Err(VersionError::NoRollbackPointer {
            branch: branch.to_string(),
            from_version: downgrade_from.to_string(),
        });
    }

    let pointer = rollback_pointer_path(versions_dir, branch, downgrade_from);
    let target = fs::read_to_string(&pointer).map_err(|_| VersionError::NoRollbackPointer {
        branch: branch.to_string(),
        from_version: downgrade_from.to_string(),
    })?;

    activate(versions_dir, branch, target.trim(), true, Duration::ZERO, false)?;
    let _ = fs::remove_file(&pointer);
    Ok(())
}

/// Deletes `(branch, version)`. Renames to `_deleting_<version>` first so
/// racing readers never observe a half-removed tree, then recursively
/// removes it and runs store GC.
pub fn delete(
    versions_dir: &Path,
    branch: &str,
    version: &str,
    even_if_in_use: bool,
) -> Result<(), VersionError> {
    if !is_installed(versions_dir, branch, version) {
        return Err(VersionError::NotInstalled {
            branch: branch.to_string(),
            version: version.to_string(),
        });
    }

    if !even_if_in_use && is_in_use(versions_dir, branch, version)? {
        return Err(VersionError::InUse {
            branch: branch.to_string(),
            version: version.to_string(),
        });
    }

    let tree = version_dir(versions_dir, branch, version);
    let deleting = branch_dir(versions_dir, branch).join(format!("_deleting_{version}"));
    fs::rename(&tree, &deleting)?;
    fs::remove_dir_all(&deleting)?;

    let store_dir = hardlinks_dir(versions_dir);
    let _ = store::gc(&store_dir);

    info!("deleted '{branch}/{version}'");
    Ok(())
}

/// Returns true if `(branch, version)` is the branch default, or if any
/// process on this node has an open file descriptor or memory mapping under
/// its path. Re-checks once (spec's two-pass supplement) after opening a
/// read handle under the candidate path, to avoid a race where a process
/// opens a file between the first scan and the delete.
pub fn is_in_use(versions_dir: &Path, branch: &str, version: &str) -> Result<bool, VersionError> {
    if branch_default_version(versions_dir, branch).as_deref() == Some(version) {
        return Ok(true);
    }

    let tree = version_dir(versions_dir, branch, version);
    if process_table_references(&tree)? {
        return Ok(true);
    }

    is_in_use_checked(&tree)
}

/// The two-pass re-check: open a read handle somewhere under `tree`, rescan
/// the process table, then decide.
pub fn is_in_use_checked(tree: &Path) -> Result<bool, VersionError> {
    let probe_file = first_regular_file(tree)?;
    let _handle = probe_file.as_ref().and_then(|p| std::fs::File::open(p).ok());
    process_table_references(tree)
}

fn first_regular_file(dir: &Path) -> Result<Option<PathBuf>, VersionError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() {
            return Ok(Some(path));
        }
        if entry.file_type()?.is_dir()
            && let Some(found) = first_regular_file(&path)?
        {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

#[cfg(target_os = "linux")]
fn process_table_references(path: &Path) -> Result<bool, VersionError> {
    let prefix = path.display().to_string();
    for entry in fs::read_dir("/proc")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let pid_name = entry.file_name();
        let pid_str = pid_name.to_string_lossy();
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let fd_dir = entry.path().join("fd");
        if let Ok(fds) = fs::read_dir(&fd_dir) {
            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path())
                    && target.starts_with(&prefix)
                {
                    return Ok(true);
                }
            }
        }

        if let Ok(maps) = fs::read_to_string(entry.path().join("maps"))
            && maps.lines().any(|line| line.contains(&prefix))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(not(target_os = "linux"))]
fn process_table_references(_path: &Path) -> Result<bool, VersionError> {
    tracing::warn!("process-table in-use scan is only implemented on Linux");
    Ok(false)
}

/// Lists installed versions for `branch`, sorted newest-first.
pub fn list_versions(versions_dir: &Path, branch: &str) -> Result<Vec<String>, VersionError> {
    let dir = branch_dir(versions_dir, branch);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut versions = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('_') || name.starts_with(".creating_") || name.starts_with("_deleting_") {
            continue;
        }
        if entry.file_type()?.is_dir() && parse_version(&name).is_ok() {
            versions.push(name);
        }
    }

    versions.sort_by(|a, b| compare_versions(b, a).unwrap_or(Ordering::Equal));
    Ok(versions)
}

/// Keeps the newest `keep_n` versions of `branch`; deletes at most `limit`
/// of the remaining versions that are not in use.
pub fn gc_stale(
    versions_dir: &Path,
    branch: &str,
    keep_n: usize,
    limit: usize,
) -> Result<Vec<String>, VersionError> {
    let versions = list_versions(versions_dir, branch)?;
    let candidates = versions.into_iter().skip(keep_n);

    let mut deleted = Vec::new();
    for version in candidates {
        if deleted.len() >= limit {
            break;
        }
        if is_in_use(versions_dir, branch, &version)? {
            continue;
        }
        delete(versions_dir, branch, &version, false)?;
        deleted.push(version);
    }

    Ok(deleted)
}
