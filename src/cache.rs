//! Simple per-key file cache (spec §5): one small file per key under a
//! tmpfs-style directory, with TTL. No in-memory state crosses process
//! boundaries; readers tolerate a concurrent unlink racing an expired entry.
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn base_dir() -> PathBuf {
    for candidate in ["/dev/shm", "/tmp"] {
        if std::path::Path::new(candidate).is_dir() {
            return PathBuf::from(candidate);
        }
    }
    if let Some(tmpdir) = std::env::var_os("TMPDIR") {
        return PathBuf::from(tmpdir);
    }
    PathBuf::from("/tmp")
}

fn sanitize(key: &str) -> String {
    key.to_lowercase()
        .replace('/', "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect()
}

fn cache_path(key: &str) -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    base_dir().join(format!("angel-simplecache-1-{uid}-{}", sanitize(key)))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Sets `key` to `value`, optionally expiring after `ttl`. Passing an empty
/// value clears any previous entry.
pub fn set(key: &str, value: &str, ttl: Option<Duration>) {
    let path = cache_path(key);
    if value.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to clear cache key '{key}': {err}"),
        }
        return;
    }

    let set_time = now_unix();
    let expiry = ttl
        .map(|d| (set_time + d.as_secs()).to_string())
        .unwrap_or_default();
    let contents = format!("{set_time}\n{expiry}\n{value}");

    let tmp_path = path.with_extension(format!("tmp{}", std::process::id()));
    let result = (|| -> std::io::Result<()> {
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        warn!("failed to set cache key '{key}': {err}");
    }
}

/// Reads `key`, returning `None` if absent, expired, or unreadable. An entry
/// older than `max_age` (if given) is treated as absent without being
/// cleared - a longer-lived caller may still want it.
pub fn get(key: &str, max_age: Option<Duration>) -> Option<String> {
    let path = cache_path(key);
    let raw = fs::read_to_string(&path).ok()?;

    let mut parts = raw.splitn(3, '\n');
    let set_time: u64 = parts.next()?.parse().ok()?;
    let expiry = parts.next()?;
    let value = parts.next()?.to_string();

    if !expiry.is_empty()
        && let Ok(expiry) = expiry.parse::<u64>()
        && now_unix() > expiry
    {
        let _ = fs::remove_file(&path);
        return None;
    }

    if let Some(max_age) = max_age
        && now_unix().saturating_sub(set_time) > max_age.as_secs()
    {
        return None;
    }

    Some(value)
}

/// Clears a previously set key.
pub fn clear(key: &str) {
    set(key, "", None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key(name: &str) -> String {
        format!("test-{name}-{}", std::process::id())
    }

    #[test]
    fn set_then_get_round_trips() {
        let key = unique_key("roundtrip");
        set(&key, "hello", None);
        assert_eq!(get(&key, None), Some("hello".to_string()));
        clear(&key);
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let key = unique_key("expiry");
        set(&key, "stale", Some(Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(get(&key, None), None);
    }

    #[test]
    fn max_age_filters_without_clearing() {
        let key = unique_key("max-age");
        set(&key, "value", None);
        assert_eq!(get(&key, Some(Duration::from_secs(0))), None);
        // Still present for a caller with a longer allowance.
        assert_eq!(get(&key, None), Some("value".to_string()));
        clear(&key);
    }

    #[test]
    fn missing_key_is_none() {
        assert_eq!(get(&unique_key("missing"), None), None);
    }
}
