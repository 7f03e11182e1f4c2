//! Process sampling via procfs.
//!
//! Best-effort by design: a probe that fails (process gone, permission
//! denied, unparsable stat line) returns `None` and the caller decides what
//! that means. Heap figures are approximated from the process's data
//! segment and virtual size; exact allocator statistics are not visible
//! from outside the process.

// Layer 1: Standard library imports
#[cfg(target_os = "linux")]
use std::fs;

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
// (none)

/// Raw figures read from the OS for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessProbe {
    /// Resident set size in bytes
    pub resident_bytes: u64,
    /// Data segment bytes (heap proxy)
    pub data_bytes: u64,
    /// Virtual size in bytes
    pub virtual_bytes: u64,
    /// Cumulative user+system CPU in clock ticks
    pub cpu_ticks: u64,
    /// Process start time in clock ticks since boot; detects pid reuse
    pub start_ticks: u64,
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(4096)
}

/// Clock ticks per second for CPU accounting.
#[cfg(target_os = "linux")]
pub fn clock_ticks_per_sec() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};
    sysconf(SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(100)
}

/// Clock ticks per second for CPU accounting.
#[cfg(not(target_os = "linux"))]
pub fn clock_ticks_per_sec() -> u64 {
    100
}

/// Probe a process by pid.
#[cfg(target_os = "linux")]
pub fn probe(pid: u32) -> Option<ProcessProbe> {
    let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let mut fields = statm.split_whitespace();
    let virtual_pages: u64 = fields.next()?.parse().ok()?;
    let resident_pages: u64 = fields.next()?.parse().ok()?;
    // statm: size resident shared text lib data dt
    let data_pages: u64 = fields.nth(3)?.parse().ok()?;

    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces and parentheses; fields after the
    // final ')' are positional.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After the comm split, utime is field 11, stime 12, starttime 19
    // (stat fields 14, 15, and 22, 1-based).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let start_ticks: u64 = fields.get(19)?.parse().ok()?;

    let page = page_size();
    Some(ProcessProbe {
        resident_bytes: resident_pages * page,
        data_bytes: data_pages * page,
        virtual_bytes: virtual_pages * page,
        cpu_ticks: utime + stime,
        start_ticks,
    })
}

/// Probe a process by pid. Unsupported off Linux; callers absorb the `None`.
#[cfg(not(target_os = "linux"))]
pub fn probe(_pid: u32) -> Option<ProcessProbe> {
    None
}

#[cfg(all(test, target_os = "linux"))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_self() {
        let probe = probe(std::process::id()).unwrap();
        assert!(probe.resident_bytes > 0);
        assert!(probe.virtual_bytes >= probe.resident_bytes);
        assert!(probe.start_ticks > 0);
    }

    #[test]
    fn test_probe_missing_pid() {
        // Pid close to the default pid_max is almost certainly unused.
        assert!(probe(u32::MAX - 7).is_none());
    }

    #[test]
    fn test_probe_stable_start_ticks() {
        let a = probe(std::process::id()).unwrap();
        let b = probe(std::process::id()).unwrap();
        assert_eq!(a.start_ticks, b.start_ticks);
    }

    #[test]
    fn test_clock_ticks() {
        assert!(clock_ticks_per_sec() > 0);
    }
}
