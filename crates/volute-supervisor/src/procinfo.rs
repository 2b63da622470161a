//! Process inspection and signalling helpers.
//!
//! Nothing in this module kills a process on the strength of a PID alone.
//! A candidate must be alive *and* its command line must reference the mind
//! entrypoint before a signal is sent; PID reuse makes anything less a
//! loaded gun.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, System};
use tracing::{info, warn};

/// Liveness probe, the `kill(pid, 0)` idiom. EPERM still means the process
/// exists, just under another user.
pub fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// True when the process exists and its command line mentions `needle`.
pub fn cmdline_matches(pid: i32, needle: &str) -> bool {
    if pid <= 0 {
        return false;
    }
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid as u32);
    if !system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new()) {
        return false;
    }
    let Some(process) = system.process(sys_pid) else {
        return false;
    };
    process.cmd().iter().any(|arg| arg.contains(needle))
        || process.name().contains(needle)
}

/// Send a signal to the process group led by `pid`. Errors (group already
/// gone) are ignored.
pub fn signal_group(pid: i32, signal: Signal) {
    let _ = killpg(Pid::from_raw(pid), signal);
}

/// Terminate a verified mind process group: SIGTERM, a short grace period,
/// then SIGKILL if the leader is still alive.
pub async fn terminate_group(pid: i32, grace: Duration) {
    signal_group(pid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while pid_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if pid_alive(pid) {
        warn!(pid, "process group ignored SIGTERM, escalating to SIGKILL");
        signal_group(pid, Signal::SIGKILL);
    }
}

/// Resolve which PID is listening on a local TCP port, via `lsof`. Returns
/// None when nothing listens or `lsof` is unavailable.
pub fn find_port_owner(port: u16) -> Option<i32> {
    let output = std::process::Command::new("lsof")
        .args(["-ti", &format!("tcp:{}", port), "-sTCP:LISTEN"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .and_then(|line| line.trim().parse().ok())
}

/// Reconcile a stale PID file before starting a mind.
///
/// The file is always removed; the recorded process group is only killed
/// when the PID is alive and its command line references `entrypoint`. A
/// live but unrelated process (PID reuse) is left untouched.
pub async fn reconcile_stale_pid(pid_file: &Path, entrypoint: &str) -> std::io::Result<()> {
    let raw = match std::fs::read_to_string(pid_file) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let pid: i32 = match raw.trim().parse() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            warn!(path = %pid_file.display(), "malformed PID file, removing");
            std::fs::remove_file(pid_file)?;
            return Ok(());
        }
    };

    if !pid_alive(pid) {
        std::fs::remove_file(pid_file)?;
        return Ok(());
    }

    if cmdline_matches(pid, entrypoint) {
        info!(pid, "killing stale mind process group from previous run");
        terminate_group(pid, Duration::from_secs(2)).await;
    } else {
        warn!(
            pid,
            "PID file points at a live process that is not a mind, leaving it alone"
        );
    }
    std::fs::remove_file(pid_file)?;
    Ok(())
}

/// Persist a freshly spawned child's PID.
pub fn write_pid_file(pid_file: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_file, format!("{}\n", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_file_with_dead_pid_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mind.pid");
        // PIDs near the kernel max are effectively never allocated.
        std::fs::write(&path, "4194000\n").unwrap();
        reconcile_stale_pid(&path, "volute-mind").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_but_unrelated_pid_is_not_killed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mind.pid");
        // PID 1 is init; its command line never references a mind
        // entrypoint, so reconciliation must not signal it.
        std::fs::write(&path, "1\n").unwrap();
        reconcile_stale_pid(&path, "volute-mind").await.unwrap();
        assert!(!path.exists());
        assert!(pid_alive(1));
    }

    #[tokio::test]
    async fn malformed_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mind.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        reconcile_stale_pid(&path, "volute-mind").await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn own_process_cmdline_matches() {
        let pid = std::process::id() as i32;
        assert!(pid_alive(pid));
        // The test binary's argv[0] contains the crate name.
        assert!(cmdline_matches(pid, "volute_supervisor") || cmdline_matches(pid, "volute-supervisor"));
        assert!(!cmdline_matches(pid, "definitely-not-this-binary"));
    }
}
