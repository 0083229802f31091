//! Process-group census and signalling.

use tracing::trace;

/// Returns the pids of live (non-zombie) processes in a process group.
///
/// Reads `/proc/<pid>/stat` for every process; entries that vanish while
/// scanning are skipped.
pub fn group_members(pgid: i32) -> Vec<u32> {
    let Ok(processes) = procfs::process::all_processes() else {
        return Vec::new();
    };

    processes
        .filter_map(Result::ok)
        .filter_map(|process| process.stat().ok())
        .filter(|stat| stat.pgrp == pgid && stat.state != 'Z')
        .filter_map(|stat| u32::try_from(stat.pid).ok())
        .collect()
}

/// Sends a signal to every member of a process group.
///
/// Returns false when the group no longer exists.
pub fn signal_group(pgid: i32, signal: libc::c_int) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: a negative pid addresses the process group; pgid > 1 so this
    // can never target our own group or every process.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        trace!(pgid, signal, error = %err, "killpg failed");
    }
    false
}

/// Returns true while any process (zombies included) remains in the group.
pub fn group_exists(pgid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission.
    pgid > 1 && unsafe { libc::kill(-pgid, 0) } == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_census_counts_group() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id() as i32;

        let mut members = Vec::new();
        for _ in 0..50 {
            members = group_members(pgid);
            if members.len() >= 3 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(members.len() >= 3, "members: {members:?}");

        assert!(signal_group(pgid, libc::SIGKILL));
        let _ = child.wait();
        for _ in 0..50 {
            if group_members(pgid).is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(group_members(pgid).is_empty());
    }

    #[test]
    fn test_signal_missing_group() {
        assert!(!signal_group(0, libc::SIGTERM));
        assert!(!signal_group(1, libc::SIGTERM));
        assert!(!group_exists(1));
    }
}
