//! Lifecycle Registrar — host-wide singleton enforcement via PID + lock files.
//!
//! At most one daemon process per host may hold the lock at any instant.
//! The invariant is expressed entirely through files in a well-known
//! per-user directory, not through in-process state: a daemon started on
//! this host is indistinguishable, by contract, from one restarted after a
//! crash, except that the latter recovers stale files instead of racing
//! against them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::{info, warn};

use crate::types::SingletonState;

const STALE_LOCK_AGE: Duration = Duration::from_secs(5 * 60);

/// Substring the daemon's own command line always contains (the binary
/// name). Used to tell "our daemon is still alive" apart from "some
/// unrelated process was handed this pid after a crash" (spec §4.1 step 2;
/// mirrors `daemon_manager.py`'s `'serial_daemon' in cmdline` check).
const DAEMON_ENTRY_POINT: &str = "smd-daemon";

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`Registrar::acquire`].
pub enum AcquireOutcome {
    /// The lock was free (or recovered from a stale holder) and is now ours.
    Acquired,
    /// A live daemon process already holds the lock.
    HeldByLive(SingletonState),
    /// A stale PID/lock pair was found and removed; callers may retry.
    StaleRecovered,
}

/// Host-wide singleton registrar, backed by `daemon.pid` and `daemon.lock`
/// in `base_dir` (default `~/.serial-monitor`).
pub struct Registrar {
    base_dir: PathBuf,
    lock_handle: Option<File>,
}

impl Registrar {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_handle: None,
        }
    }

    /// `~/.serial-monitor`, creating it if absent.
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".serial-monitor")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.base_dir.join("daemon.pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("daemon.lock")
    }

    /// Attempt to become the sole daemon on this host.
    ///
    /// Steps (spec §4.1):
    /// 1. Read the PID record, if present.
    /// 2. If it names a live process whose command line matches the daemon
    ///    entry-point, report `HeldByLive` with no side effects.
    /// 3. Otherwise remove stale PID/lock files (a lock with no PID record
    ///    older than 5 minutes also counts as stale).
    /// 4. Take a non-blocking exclusive advisory lock on the lock file.
    /// 5. Write our own PID record.
    pub fn acquire(&mut self, session_id: &str) -> Result<AcquireOutcome, RegistrarError> {
        std::fs::create_dir_all(&self.base_dir)?;

        if let Some(existing) = self.read_pid_record() {
            if is_alive(existing.pid) && is_daemon_process(existing.pid) {
                return Ok(AcquireOutcome::HeldByLive(existing));
            }
            info!(
                pid = existing.pid,
                "stale PID record (process not alive or pid recycled by another process), recovering"
            );
        } else if self.lock_path().exists() {
            if !self.lock_is_stale() {
                // A lock file exists with no readable PID record; another
                // process may be mid-startup. Let the OS-level flock below
                // decide who wins rather than guessing here.
            }
        }

        self.remove_files();

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if lock_file.try_lock_exclusive().is_err() {
            warn!("lost the race for daemon.lock to another starting daemon");
            let holder = self.read_pid_record();
            self.lock_handle = None;
            return Ok(match holder {
                Some(state) => AcquireOutcome::HeldByLive(state),
                None => AcquireOutcome::StaleRecovered,
            });
        }

        self.lock_handle = Some(lock_file);

        let state = SingletonState {
            pid: std::process::id(),
            started_at: unix_now(),
            current_port: None,
            session_id: session_id.to_string(),
        };
        self.write_pid_record(&state)?;
        info!(pid = state.pid, %session_id, "acquired daemon singleton lock");
        Ok(AcquireOutcome::Acquired)
    }

    /// Overwrite the current-port field of the PID record in place.
    pub fn update_current_port(&self, port: Option<&str>) -> Result<(), RegistrarError> {
        if let Some(mut state) = self.read_pid_record() {
            state.current_port = port.map(|s| s.to_string());
            self.write_pid_record(&state)?;
        }
        Ok(())
    }

    /// Release the lock and remove both files. Best-effort: failures are
    /// logged, never propagated.
    pub fn release(&mut self) {
        if let Some(handle) = self.lock_handle.take() {
            let _ = fs2::FileExt::unlock(&handle);
        }
        self.remove_files();
        info!("released daemon singleton lock");
    }

    /// Inspect the current PID record without acquiring anything.
    pub fn inspect(&self) -> Option<SingletonState> {
        self.read_pid_record()
    }

    fn read_pid_record(&self) -> Option<SingletonState> {
        let text = std::fs::read_to_string(self.pid_path()).ok()?;
        SingletonState::from_lines(&text)
    }

    fn write_pid_record(&self, state: &SingletonState) -> Result<(), RegistrarError> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.pid_path())?;
        f.write_all(state.to_lines().as_bytes())?;
        Ok(())
    }

    fn lock_is_stale(&self) -> bool {
        std::fs::metadata(self.lock_path())
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age > STALE_LOCK_AGE)
            .unwrap_or(false)
    }

    fn remove_files(&self) {
        let _ = std::fs::remove_file(self.pid_path());
        let _ = std::fs::remove_file(self.lock_path());
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whether `pid` names a live process on this host.
///
/// Sending signal 0 performs existence/permission checks without actually
/// delivering a signal — the standard POSIX liveness probe.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Whether `pid` is actually running the daemon binary, not some unrelated
/// process that happened to be assigned the same pid after a crash.
///
/// Reads `/proc/<pid>/cmdline` the same way `at-daemon::benchmarks` reads
/// `/proc/self/status` elsewhere in this codebase's idiom; a pid whose
/// command line can't be read (process gone, permission denied, or no
/// `/proc`) is treated as *not* our daemon, matching
/// `daemon_manager.py`'s `except (NoSuchProcess, AccessDenied): pass`
/// falling through to stale cleanup.
#[cfg(target_os = "linux")]
pub fn is_daemon_process(pid: u32) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
            cmdline.contains(DAEMON_ENTRY_POINT)
        }
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn is_daemon_process(pid: u32) -> bool {
    // No portable, dependency-free way to read another process's command
    // line outside Linux's /proc; fall back to the liveness check alone
    // rather than introduce a new crate for this one call site.
    is_alive(pid)
}

/// Whether a directory entry's lock file is older than the staleness
/// threshold, exposed for reuse by callers that want to pre-check before
/// calling [`Registrar::acquire`].
pub fn lock_is_stale(lock_path: impl AsRef<Path>) -> bool {
    std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|m| m.elapsed().ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_acquire_succeeds() {
        let dir = tempdir().unwrap();
        let mut reg = Registrar::new(dir.path());
        match reg.acquire("session_1_aaaaaaaa").unwrap() {
            AcquireOutcome::Acquired => {}
            _ => panic!("expected Acquired"),
        }
        assert!(reg.pid_path().exists());
        assert!(reg.lock_path().exists());
    }

    #[test]
    fn second_acquire_with_pid_recycled_by_unrelated_process_recovers_stale_state() {
        let dir = tempdir().unwrap();
        let mut first = Registrar::new(dir.path());
        assert!(matches!(
            first.acquire("session_1_aaaaaaaa").unwrap(),
            AcquireOutcome::Acquired
        ));

        // Our own pid is alive, but this test binary is not `smd-daemon` —
        // exactly the "pid recycled by an unrelated process" case the
        // command-line check exists for. A second registrar pointed at the
        // same directory must recover the record as stale rather than
        // falsely reporting HeldByLive.
        let mut second = Registrar::new(dir.path());
        match second.acquire("session_2_bbbbbbbb").unwrap() {
            AcquireOutcome::Acquired => {}
            AcquireOutcome::HeldByLive(_) => {
                panic!("a live-but-foreign pid must not be reported as HeldByLive")
            }
            AcquireOutcome::StaleRecovered => {
                panic!("expected the recovering registrar to finish acquiring, not just recover")
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn is_daemon_process_rejects_a_pid_whose_cmdline_does_not_match() {
        // The running test binary is not `smd-daemon`, so its own (very
        // much alive) pid must not be mistaken for a live daemon process.
        assert!(!is_daemon_process(std::process::id()));
    }

    #[test]
    fn release_removes_files() {
        let dir = tempdir().unwrap();
        let mut reg = Registrar::new(dir.path());
        reg.acquire("session_1_aaaaaaaa").unwrap();
        reg.release();
        assert!(!reg.pid_path().exists());
        assert!(!reg.lock_path().exists());
    }

    #[test]
    fn corrupt_pid_record_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("daemon.pid"), "not-a-pid\n").unwrap();
        let reg = Registrar::new(dir.path());
        assert!(reg.inspect().is_none());
    }

    #[test]
    fn stale_pid_is_recovered() {
        let dir = tempdir().unwrap();
        // PID 1 belongs to init on any live Unix host but our liveness
        // check targets processes the *current user* can signal; use a
        // pid that is guaranteed not to exist instead.
        let bogus_pid = 999_999;
        let state = SingletonState {
            pid: bogus_pid,
            started_at: 0,
            current_port: None,
            session_id: "session_0_deadbeef".into(),
        };
        std::fs::write(dir.path().join("daemon.pid"), state.to_lines()).unwrap();
        std::fs::write(dir.path().join("daemon.lock"), "").unwrap();

        let mut reg = Registrar::new(dir.path());
        match reg.acquire("session_1_aaaaaaaa").unwrap() {
            AcquireOutcome::Acquired => {}
            _ => panic!("expected the stale record to be recovered"),
        }
    }
}
