//! Unix process liveness checks and signalling by pid.

use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for a SIGKILLed process to disappear.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running under that pid.
    NotRunning,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
}

fn to_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Whether a process with this pid exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(pid, 0) };
    let exists = result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: libc::pid_t) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Format: "<pid> (<comm>) <state> ..."; comm may itself contain ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: libc::pid_t) -> bool {
    false
}

pub fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = to_pid(pid)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {}", pid)))?;
    // SAFETY: plain kill(2) on a validated positive pid.
    let result = unsafe { libc::kill(raw, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// For processes that are not our children. Our own children are reaped by
/// their watcher task instead.
pub async fn terminate_pid(pid: u32, grace: Duration) -> io::Result<Termination> {
    if !is_alive(pid) {
        return Ok(Termination::NotRunning);
    }

    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(Termination::NotRunning),
        Err(e) => return Err(e),
    }
    debug!(pid, "Sent SIGTERM");

    if wait_for_exit(pid, grace).await {
        return Ok(Termination::Graceful);
    }

    warn!(pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, sending SIGKILL");
    match send_signal(pid, libc::SIGKILL) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(Termination::Graceful),
        Err(e) => return Err(e),
    }

    if wait_for_exit(pid, KILL_WAIT).await {
        Ok(Termination::Killed)
    } else {
        Err(io::Error::other(format!(
            "process {} still alive after SIGKILL",
            pid
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_detached(script: &str) -> std::process::Child {
        std::process::Command::new("sh")
            .args(["-c", script])
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_invalid_pids_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut child = spawn_detached("sleep 30");
        let pid = child.id();
        assert!(is_alive(pid));

        // Reap in the background so the pid does not linger as a zombie.
        let reaper = std::thread::spawn(move || child.wait());
        let outcome = terminate_pid(pid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, Termination::Graceful);
        reaper.join().unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut child = spawn_detached("trap '' TERM; while true; do sleep 0.1; done");
        let pid = child.id();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let reaper = std::thread::spawn(move || child.wait());
        let outcome = terminate_pid(pid, Duration::from_millis(500)).await.unwrap();
        assert_eq!(outcome, Termination::Killed);
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_not_running() {
        let mut child = spawn_detached("exit 0");
        let pid = child.id();
        child.wait().unwrap();
        let outcome = terminate_pid(pid, Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, Termination::NotRunning);
    }
}
