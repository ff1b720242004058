use std::collections::VecDeque;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Direct children of `pid`, via `pgrep -P`.
async fn children(pid: u32) -> Result<Vec<u32>, SessionError> {
    let output = Command::new("pgrep")
        .arg("-P")
        .arg(pid.to_string())
        .kill_on_drop(true)
        .output()
        .await?;
    // pgrep exits 1 when nothing matched.
    if !output.status.success() && output.status.code() != Some(1) {
        return Err(SessionError::CommandFailed {
            command: format!("pgrep -P {pid}"),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect())
}

/// All descendants of `root`, parents before children.
pub async fn descendants(root: u32) -> Result<Vec<u32>, SessionError> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for child in children(pid).await? {
            if !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    Ok(found)
}

fn signal(pid: u32, sig: Option<Signal>) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    kill(Pid::from_raw(raw), sig)
}

fn alive(pid: u32) -> bool {
    signal(pid, None).is_ok()
}

/// SIGTERM every descendant of `root` (deepest first), then SIGKILL whatever is
/// still alive after `grace`. `root` itself is left for the caller.
pub async fn terminate_descendants(root: u32, grace: Duration) -> Result<usize, SessionError> {
    let mut pids = descendants(root).await?;
    if pids.is_empty() {
        return Ok(0);
    }
    pids.reverse();

    for &pid in &pids {
        match signal(pid, Some(Signal::SIGTERM)) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid, error = %err, "SIGTERM failed"),
        }
    }
    tokio::time::sleep(grace).await;

    for &pid in pids.iter().filter(|&&pid| alive(pid)) {
        debug!(pid, "process ignored SIGTERM, sending SIGKILL");
        match signal(pid, Some(Signal::SIGKILL)) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid, error = %err, "SIGKILL failed"),
        }
    }
    Ok(pids.len())
}
