//! Content-Addressed Link Store (spec §4.2): a directory of files named
//! `md5hex.size.mode`, the source of truth for file bodies shared across
//! installed versions via hard links.
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::constants::{DEDUP_SAFETY_CHECK_FILE, DEDUP_SAFETY_CHECK_LINK};
use crate::error::StoreError;

/// Computes the md5 hex digest of a file's contents.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Returns the canonical store filename for a file with the given content
/// hash, size, and permission bits.
pub fn name_for(md5hex: &str, size: u64, mode: u32) -> String {
    format!("{md5hex}.{size}.{:o}", mode & 0o7777)
}

/// Initializes a fresh store directory: creates it with private (0700)
/// permissions, then writes the safety-check file with a companion hard
/// link so its link count is 2 (never garbage-collectable by accident).
pub fn ensure_init(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

    let safety = dir.join(DEDUP_SAFETY_CHECK_FILE);
    let companion = dir.join(DEDUP_SAFETY_CHECK_LINK);

    if !safety.exists() {
        fs::write(&safety, b"angel content store\n")?;
    }
    if !companion.exists() {
        match fs::hard_link(&safety, &companion) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

fn same_filesystem(a: &Path, b: &Path) -> io::Result<bool> {
    let dev_a = fs::metadata(a)?.dev();
    // `b`'s parent may not exist yet; walk up until we find one that does.
    let mut probe = b.to_path_buf();
    loop {
        match fs::metadata(&probe) {
            Ok(meta) => return Ok(meta.dev() == dev_a),
            Err(_) => {
                if !probe.pop() {
                    return Ok(false);
                }
            }
        }
    }
}

/// Materializes `src_path`'s content into the store (if not already
/// present) and hard-links it into `tree_path`. Fails fast if the store and
/// destination tree are on different filesystems, since hard links cannot
/// cross filesystem boundaries.
pub fn link_into(
    store_dir: &Path,
    tree_path: &Path,
    src_path: &Path,
    content_hash: &str,
    size: u64,
    mode: u32,
) -> Result<(), StoreError> {
    if !same_filesystem(store_dir, tree_path)? {
        return Err(StoreError::CrossFilesystem {
            store: store_dir.display().to_string(),
            tree: tree_path.display().to_string(),
        });
    }

    let canonical = store_dir.join(name_for(content_hash, size, mode));

    if !canonical.exists() {
        let tmp = store_dir.join(format!(".tmp-{}-{}", std::process::id(), name_for(content_hash, size, mode)));
        fs::copy(src_path, &tmp)?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode & 0o7777))?;
        match fs::rename(&tmp, &canonical) {
            Ok(()) => {}
            Err(_) if canonical.exists() => {
                // Lost a race with a concurrent writer of the same content; fine.
                let _ = fs::remove_file(&tmp);
            }
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(parent) = tree_path.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::hard_link(&canonical, tree_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Deletes every file in `dir` whose link count is exactly 1 and that is not
/// the safety-check file or its companion. Refuses to run if the
/// safety-check file is missing (a sign the directory is not actually an
/// initialized store).
pub fn gc(dir: &Path) -> Result<u64, StoreError> {
    let safety = dir.join(DEDUP_SAFETY_CHECK_FILE);
    if !safety.exists() {
        return Err(StoreError::MissingSafetyFile(dir.display().to_string()));
    }

    let mut removed = 0u64;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name == DEDUP_SAFETY_CHECK_FILE || name == DEDUP_SAFETY_CHECK_LINK {
            continue;
        }

        let meta = entry.metadata()?;
        if meta.nlink() == 1 {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Computes `{relative path within `root` -> canonical store name}` for every
/// regular file under `root`, for build servers that want to precompute
/// checksums once and ship the manifest with the source tree (spec's
/// checksum-manifest-reuse supplement).
pub fn checksum_manifest(root: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    walk_files(root, root, &mut out)?;
    Ok(out)
}

fn walk_files(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(root, &path, out)?;
        } else if file_type.is_file() {
            let meta = entry.metadata()?;
            let hash = hash_file(&path)?;
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push((relative, name_for(&hash, meta.len(), meta.mode())));
        }
    }
    Ok(())
}
