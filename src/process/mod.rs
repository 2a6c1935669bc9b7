//! Process table queries
//!
//! Session state outlives the broker, so a pid recorded on disk may belong
//! to an unrelated process by the time it is read back. Creation times are
//! compared to detect that.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getsid, sysconf, Pid, SysconfVar};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Decide whether a pid recorded at `recorded` still names the same process.
///
/// The process must exist and have been created strictly before the record
/// was written. A process created at or after that instant is a reuse of the
/// pid by something else.
pub fn is_pid_valid(recorded: SystemTime, live_created: Option<SystemTime>) -> bool {
    matches!(live_created, Some(created) if created < recorded)
}

/// Read-only view of the operating system's processes
pub trait ProcessTable: Send + Sync {
    /// Creation time of `pid`, or `None` if no such process exists
    fn create_time(&self, pid: i32) -> Option<SystemTime>;

    fn pid_exists(&self, pid: i32) -> bool {
        self.create_time(pid).is_some()
    }

    /// Session id of `pid`, or `None` if it cannot be determined
    fn session_id(&self, pid: i32) -> Option<i32>;
}

/// [`ProcessTable`] backed by Linux procfs
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }

    fn boot_time(&self) -> Option<u64> {
        let stat = std::fs::read_to_string(self.root.join("stat")).ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|value| value.trim().parse().ok())
    }

    /// Start time in clock ticks since boot (field 22 of `/proc/<pid>/stat`)
    fn start_ticks(&self, pid: i32) -> Option<u64> {
        let stat = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        // comm may contain spaces and parentheses; fields resume after the last ')'
        let rest = &stat[stat.rfind(')')? + 1..];
        rest.split_whitespace().nth(19)?.parse().ok()
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn create_time(&self, pid: i32) -> Option<SystemTime> {
        if pid <= 0 {
            return None;
        }
        let ticks = self.start_ticks(pid)?;
        let boot = self.boot_time()?;
        let hz = sysconf(SysconfVar::CLK_TCK).ok().flatten().filter(|hz| *hz > 0)? as u64;
        let since_boot = Duration::from_secs(ticks / hz)
            + Duration::from_nanos((ticks % hz) * 1_000_000_000 / hz);
        Some(UNIX_EPOCH + Duration::from_secs(boot) + since_boot)
    }

    fn pid_exists(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
    }

    fn session_id(&self, pid: i32) -> Option<i32> {
        if pid <= 0 {
            return None;
        }
        getsid(Some(Pid::from_raw(pid))).ok().map(Pid::as_raw)
    }
}
