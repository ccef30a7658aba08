//! Termination of a child process together with all of its descendants.

use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Upper bound for each helper command (`pgrep`, `taskkill`).
const HELPER_TIMEOUT: Duration = Duration::from_secs(5);

/// Asks `pid` and every transitive descendant to terminate.
///
/// Failures are logged and otherwise ignored: a process that already exited is
/// not an error, and the caller bounds the wait for exit separately.
pub(crate) async fn kill_tree(pid: u32) {
    #[cfg(unix)]
    unix::kill_tree(pid).await;
    #[cfg(windows)]
    windows::kill_tree(pid).await;
    #[cfg(not(any(unix, windows)))]
    debug!(pid, "process tree teardown is not supported on this platform");
}

#[cfg(unix)]
mod unix {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    pub(super) async fn kill_tree(pid: u32) {
        for descendant in descendants(pid).await {
            terminate(descendant);
        }
        terminate(pid);
    }

    /// Walks the process tree below `root` breadth first using `pgrep -P`.
    pub(super) async fn descendants(root: u32) -> Vec<u32> {
        let mut found = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for child in children(parent).await {
                if child != root && !found.contains(&child) {
                    found.push(child);
                    frontier.push(child);
                }
            }
        }
        found
    }

    async fn children(parent: u32) -> Vec<u32> {
        let listing = Command::new("pgrep")
            .arg("-P")
            .arg(parent.to_string())
            .output();
        match tokio::time::timeout(HELPER_TIMEOUT, listing).await {
            Ok(Ok(output)) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect(),
            Ok(Err(e)) => {
                debug!(parent, error = %e, "pgrep unavailable, skipping descendants");
                Vec::new()
            }
            Err(_) => {
                debug!(parent, "pgrep timed out");
                Vec::new()
            }
        }
    }

    fn terminate(pid: u32) {
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => debug!(pid, "sent SIGTERM"),
            Err(e) => debug!(pid, error = %e, "SIGTERM not delivered"),
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;

    pub(super) async fn kill_tree(pid: u32) {
        let kill = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output();
        match tokio::time::timeout(HELPER_TIMEOUT, kill).await {
            Ok(Ok(output)) if output.status.success() => debug!(pid, "process tree killed"),
            Ok(Ok(output)) => debug!(
                pid,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "taskkill reported failure"
            ),
            Ok(Err(e)) => debug!(pid, error = %e, "taskkill could not run"),
            Err(_) => debug!(pid, "taskkill timed out"),
        }
    }
}

#[cfg(all(test, unix))]
pub(super) mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;
    use std::process::Stdio;

    /// Waits until `pid` no longer names a live process. A zombie waiting for
    /// its new parent to reap it counts as gone.
    pub(crate) async fn wait_gone(pid: u32) -> bool {
        for _ in 0..250 {
            if signal::kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH) {
                return true;
            }
            let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
            if stat.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_kill_tree_reaches_grandchildren() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let mut found = Vec::new();
        for _ in 0..50 {
            found = unix::descendants(pid).await;
            if found.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found.len() >= 2, "expected two sleeping grandchildren, found {found:?}");

        kill_tree(pid).await;
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("shell should exit once its tree is signalled")
            .unwrap();
        assert!(!status.success());
        for grandchild in found {
            assert!(wait_gone(grandchild).await, "grandchild {grandchild} survived");
        }
    }
}
