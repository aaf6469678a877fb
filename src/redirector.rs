//! Stream Redirector (spec §4.5): one worker thread per captured stream
//! (`stdout`, `stderr`, `supervisor`) that drains a pipe into a log file,
//! tolerating external log rotation and directory deletion.
use nix::unistd;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::warn;

use crate::constants::{REDIRECTOR_POLL, REDIRECTOR_READ_CHUNK};

/// Rewrites a line before it is appended to the log file. The default is a
/// no-op passthrough; reserved for redaction.
pub type LineFilter = Box<dyn Fn(&str) -> Option<String> + Send>;

fn passthrough() -> LineFilter {
    Box::new(|line| Some(line.to_string()))
}

/// A running redirector worker. Dropping the handle does not stop the
/// thread; call [`RedirectorHandle::stop`] explicitly so buffered output is
/// flushed.
pub struct RedirectorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RedirectorHandle {
    /// Signals the worker to drain its remaining buffer, flush, and exit,
    /// then joins the thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn file_inode(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.ino())
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

struct LogTarget {
    path: PathBuf,
    file: File,
    inode: Option<u64>,
}

impl LogTarget {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = open_append(&path)?;
        let inode = file_inode(&path);
        Ok(Self { path, file, inode })
    }

    /// Reopens the log file if its on-disk inode no longer matches the
    /// handle's (external rotation), or recreates the directory if deleted.
    fn reopen_if_rotated(&mut self) {
        let current = file_inode(&self.path);
        if current == self.inode && current.is_some() {
            return;
        }

        match open_append(&self.path) {
            Ok(file) => {
                self.inode = file_inode(&self.path);
                self.file = file;
            }
            Err(err) => warn!("failed to reopen log file '{}': {err}", self.path.display()),
        }
    }

    fn write_line(&mut self, line: &str) {
        self.reopen_if_rotated();
        if let Err(err) = writeln!(self.file, "{line}") {
            warn!("failed to write log line to '{}': {err}", self.path.display());
            return;
        }
        let _ = self.file.flush();
    }
}

/// Spawns a worker that reads `read_fd` until EOF, splitting on newlines and
/// appending complete lines to `log_path`. `read_fd`'s ownership transfers to
/// the worker thread.
pub fn spawn(read_fd: OwnedFd, log_path: PathBuf, filter: Option<LineFilter>) -> RedirectorHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let filter = filter.unwrap_or_else(passthrough);

    let thread = thread::spawn(move || {
        run_worker(read_fd, log_path, filter, worker_stop);
    });

    RedirectorHandle {
        stop,
        thread: Some(thread),
    }
}

fn run_worker(read_fd: OwnedFd, log_path: PathBuf, filter: LineFilter, stop: Arc<AtomicBool>) {
    let mut target = match LogTarget::open(log_path.clone()) {
        Ok(t) => t,
        Err(err) => {
            warn!("redirector could not open '{}': {err}", log_path.display());
            return;
        }
    };

    let fd: RawFd = read_fd.as_raw_fd();
    let mut remainder = String::new();

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match poll_readable(fd, REDIRECTOR_POLL) {
            PollOutcome::Readable => {}
            PollOutcome::Timeout => continue,
            PollOutcome::Error => continue,
            PollOutcome::Closed => break,
        }

        let mut buf = [0u8; REDIRECTOR_READ_CHUNK];
        match unistd::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                remainder.push_str(&String::from_utf8_lossy(&buf[..n]));
                drain_complete_lines(&mut remainder, &filter, &mut target);
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                warn!("redirector read error on '{}': {err}", log_path.display());
                break;
            }
        }
    }

    if !remainder.is_empty() {
        emit_line(&remainder, &filter, &mut target);
    }
}

fn drain_complete_lines(remainder: &mut String, filter: &LineFilter, target: &mut LogTarget) {
    while let Some(pos) = remainder.find('\n') {
        let line = remainder[..pos].to_string();
        *remainder = remainder[pos + 1..].to_string();
        emit_line(&line, filter, target);
    }
}

fn emit_line(line: &str, filter: &LineFilter, target: &mut LogTarget) {
    if let Some(rewritten) = filter(line) {
        target.write_line(&rewritten);
    }
}

enum PollOutcome {
    Readable,
    Timeout,
    Error,
    Closed,
}

fn poll_readable(fd: RawFd, timeout: std::time::Duration) -> PollOutcome {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];

    let res = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout.as_millis() as libc::c_int) };
    if res < 0 {
        return PollOutcome::Error;
    }
    if res == 0 {
        return PollOutcome::Timeout;
    }
    if fds[0].revents & libc::POLLHUP != 0 && fds[0].revents & libc::POLLIN == 0 {
        return PollOutcome::Closed;
    }
    PollOutcome::Readable
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::io::Write as _;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn drains_pipe_into_log_file_split_on_newlines() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("out.log");
        let (read_fd, write_fd) = pipe().expect("pipe");

        let handle = spawn(read_fd, log_path.clone(), None);

        let mut writer = File::from(write_fd);
        writer.write_all(b"line one\nline two\npartial").unwrap();
        thread::sleep(Duration::from_millis(400));
        drop(writer);

        thread::sleep(Duration::from_millis(400));
        handle.stop();

        let contents = fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("line one"));
        assert!(contents.contains("line two"));
        assert!(contents.contains("partial"));
    }

    #[test]
    fn filter_can_drop_lines() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("out.log");
        let (read_fd, write_fd) = pipe().expect("pipe");

        let filter: LineFilter = Box::new(|line| {
            if line.contains("secret") {
                None
            } else {
                Some(line.to_string())
            }
        });
        let handle = spawn(read_fd, log_path.clone(), Some(filter));

        let mut writer = File::from(write_fd);
        writer.write_all(b"public line\nsecret line\n").unwrap();
        thread::sleep(Duration::from_millis(400));
        drop(writer);
        thread::sleep(Duration::from_millis(400));
        handle.stop();

        let contents = fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("public line"));
        assert!(!contents.contains("secret line"));
    }
}
