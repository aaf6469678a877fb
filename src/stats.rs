//! Load, disk, inode, and network collectors feeding the status aggregator
//! (spec §4.8). Each collector is best-effort: a path that can't be statted
//! or a peer that can't be reached is logged and reported absent rather than
//! failing the whole status round.
use std::net::ToSocketAddrs;
use std::process::Command;
use std::time::Duration;

use sysinfo::{Disks, System};
use tracing::warn;

/// 1/5/15-minute load averages, as reported by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Reads the system load averages.
pub fn load_average() -> LoadAverage {
    let load = System::load_average();
    LoadAverage {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    }
}

/// Usage of the filesystem backing `path`.
#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub free_mb: u64,
    pub used_mb: u64,
    pub size_mb: u64,
    pub used_fraction: f64,
    pub free_inodes: u64,
}

/// Statvfs-based usage for the partition containing `path`. Walks up to the
/// nearest existing ancestor first, since `path` itself may not exist yet.
pub fn disk_usage_for_path(path: &std::path::Path) -> Option<DiskUsage> {
    let mut probe = path.to_path_buf();
    while probe.as_os_str().len() > 1 && !probe.exists() {
        if !probe.pop() {
            break;
        }
    }

    let c_path = match std::ffi::CString::new(probe.as_os_str().as_encoded_bytes()) {
        Ok(c_path) => c_path,
        Err(err) => {
            warn!("can't get disk stats for path '{}': {err}", path.display());
            return None;
        }
    };

    let mut statvfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut statvfs) };
    if rc != 0 {
        warn!(
            "can't get disk stats for path '{}': {}",
            path.display(),
            std::io::Error::last_os_error()
        );
        return None;
    }

    let block_size = statvfs.f_bsize as u64;
    let capacity_mb = block_size.saturating_mul(statvfs.f_blocks) / (1024 * 1024);
    let free_mb = block_size.saturating_mul(statvfs.f_bavail) / (1024 * 1024);
    let used_mb = capacity_mb.saturating_sub(free_mb);
    let used_fraction = if capacity_mb == 0 {
        0.0
    } else {
        used_mb as f64 / capacity_mb as f64
    };

    Some(DiskUsage {
        free_mb,
        used_mb,
        size_mb: capacity_mb,
        used_fraction,
        free_inodes: statvfs.f_ffree as u64,
    })
}

/// Usage for every locally mounted partition, keyed by mount point.
pub fn disk_usage_all() -> Vec<(String, DiskUsage)> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter_map(|disk| {
            let mount = disk.mount_point();
            disk_usage_for_path(mount).map(|usage| (mount.display().to_string(), usage))
        })
        .collect()
}

/// IP address family to probe a peer over, made explicit rather than
/// inferred from the hostname string (the ambiguity spec.md flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Attempts a single ICMP echo against `host`, resolved under the requested
/// address family. Shells out to the system `ping` binary rather than
/// opening a raw socket, since raw ICMP sockets require `CAP_NET_RAW` that a
/// dropped-privilege service process won't have.
pub fn check_host(host: &str, family: AddressFamily, timeout: Duration) -> bool {
    if resolve(host, family).is_none() {
        return false;
    }

    let family_flag = match family {
        AddressFamily::V4 => "-4",
        AddressFamily::V6 => "-6",
    };
    let timeout_secs = timeout.as_secs().max(1).to_string();

    match Command::new("ping")
        .arg(family_flag)
        .args(["-c", "1", "-W", &timeout_secs])
        .arg(host)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(err) => {
            warn!("can't run ping for host '{host}': {err}");
            false
        }
    }
}

fn resolve(host: &str, family: AddressFamily) -> Option<std::net::IpAddr> {
    let candidates = (host, 0u16).to_socket_addrs().ok()?;
    candidates
        .map(|addr| addr.ip())
        .find(|ip| matches!((ip, family), (std::net::IpAddr::V4(_), AddressFamily::V4) | (std::net::IpAddr::V6(_), AddressFamily::V6)))
}

/// Runs `check_host` against every peer, returning the ones that answered.
pub fn reachable_peers(peers: &[(String, AddressFamily)], timeout: Duration) -> Vec<String> {
    peers
        .iter()
        .filter(|(host, family)| check_host(host, *family, timeout))
        .map(|(host, _)| host.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_usage_for_root_is_nonzero() {
        let usage = disk_usage_for_path(std::path::Path::new("/")).expect("statvfs on /");
        assert!(usage.size_mb > 0);
        assert!(usage.used_fraction >= 0.0 && usage.used_fraction <= 1.0);
    }

    #[test]
    fn disk_usage_walks_up_to_existing_ancestor() {
        let usage = disk_usage_for_path(std::path::Path::new("/definitely/does/not/exist"))
            .expect("statvfs on an ancestor of a missing path");
        assert!(usage.size_mb > 0);
    }

    #[test]
    fn load_average_is_non_negative() {
        let load = load_average();
        assert!(load.one >= 0.0);
        assert!(load.five >= 0.0);
        assert!(load.fifteen >= 0.0);
    }

    #[test]
    fn unresolvable_host_is_unreachable() {
        assert!(!check_host(
            "this-host-does-not-resolve.invalid",
            AddressFamily::V4,
            Duration::from_secs(1)
        ));
    }
}
