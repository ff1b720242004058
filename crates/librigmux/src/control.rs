use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::debug;

use crate::error::SessionError;
use crate::procs;

const PROCESS_GRACE: Duration = Duration::from_millis(500);

/// Narrow session-control surface of the terminal multiplexer.
///
/// Session targets are session names; pane targets are pane ids (`%12`).
#[allow(async_fn_in_trait)]
pub trait SessionControl {
    async fn has_session(&self, session: &str) -> Result<bool, SessionError>;
    async fn new_session(&self, session: &str, work_dir: &Path) -> Result<(), SessionError>;
    async fn kill_session(&self, session: &str) -> Result<(), SessionError>;
    async fn list_sessions(&self) -> Result<Vec<String>, SessionError>;
    /// Name of a session rooted at `work_dir`, if one exists.
    async fn session_for_work_dir(&self, work_dir: &Path) -> Result<Option<String>, SessionError>;
    async fn session_created(&self, session: &str) -> Result<Option<DateTime<Utc>>, SessionError>;
    async fn set_environment(&self, session: &str, key: &str, value: &str) -> Result<(), SessionError>;
    async fn set_status_style(&self, session: &str, style: &str) -> Result<(), SessionError>;
    async fn pane_id(&self, session: &str) -> Result<String, SessionError>;
    async fn pane_command(&self, target: &str) -> Result<String, SessionError>;
    /// Terminate every descendant of the pane's process.
    async fn kill_pane_processes(&self, pane: &str) -> Result<usize, SessionError>;
    /// Replace the pane's process in place with `command`.
    async fn respawn_pane(&self, pane: &str, work_dir: &Path, command: &str) -> Result<(), SessionError>;
    async fn attach(&self, session: &str, inside_multiplexer: bool) -> Result<(), SessionError>;
}

/// `SessionControl` backed by the `tmux` binary.
#[derive(Debug, Clone, Default)]
pub struct Tmux {
    socket: Option<String>,
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a named server socket (`tmux -L <name>`).
    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.arg("-L").arg(socket);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str], target: &str) -> Result<String, SessionError> {
        let output = self.command().args(args).output().await?;
        if !output.status.success() {
            return Err(SessionError::from_stderr(
                format!("tmux {}", args.join(" ")),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                target,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    async fn display(&self, target: &str, format: &str) -> Result<String, SessionError> {
        self.run(&["display-message", "-p", "-t", target, format], target)
            .await
    }
}

fn exact(session: &str) -> String {
    format!("={session}")
}

impl SessionControl for Tmux {
    async fn has_session(&self, session: &str) -> Result<bool, SessionError> {
        match self.run(&["has-session", "-t", &exact(session)], session).await {
            Ok(_) => Ok(true),
            Err(SessionError::SessionNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn new_session(&self, session: &str, work_dir: &Path) -> Result<(), SessionError> {
        let dir = work_dir.to_string_lossy();
        self.run(&["new-session", "-d", "-s", session, "-c", &dir], session)
            .await
            .map(|_| ())
    }

    async fn kill_session(&self, session: &str) -> Result<(), SessionError> {
        match self.run(&["kill-session", "-t", &exact(session)], session).await {
            Ok(_) | Err(SessionError::SessionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        match self.run(&["list-sessions", "-F", "#{session_name}"], "").await {
            Ok(out) => Ok(out.lines().map(str::to_string).collect()),
            Err(SessionError::SessionNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn session_for_work_dir(&self, work_dir: &Path) -> Result<Option<String>, SessionError> {
        let out = match self
            .run(&["list-sessions", "-F", "#{session_name}\t#{session_path}"], "")
            .await
        {
            Ok(out) => out,
            Err(SessionError::SessionNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(out.lines().find_map(|line| {
            let (name, path) = line.split_once('\t')?;
            (Path::new(path) == work_dir).then(|| name.to_string())
        }))
    }

    async fn session_created(&self, session: &str) -> Result<Option<DateTime<Utc>>, SessionError> {
        let raw = self.display(&exact(session), "#{session_created}").await?;
        let secs: i64 = raw
            .trim()
            .parse()
            .map_err(|_| SessionError::Parse(format!("session_created={raw:?}")))?;
        Ok(DateTime::from_timestamp(secs, 0))
    }

    async fn set_environment(&self, session: &str, key: &str, value: &str) -> Result<(), SessionError> {
        self.run(&["set-environment", "-t", &exact(session), key, value], session)
            .await
            .map(|_| ())
    }

    async fn set_status_style(&self, session: &str, style: &str) -> Result<(), SessionError> {
        self.run(&["set-option", "-t", &exact(session), "status-style", style], session)
            .await
            .map(|_| ())
    }

    async fn pane_id(&self, session: &str) -> Result<String, SessionError> {
        let id = self.display(&exact(session), "#{pane_id}").await?;
        if id.is_empty() {
            return Err(SessionError::PaneNotFound(session.to_string()));
        }
        Ok(id)
    }

    async fn pane_command(&self, target: &str) -> Result<String, SessionError> {
        self.display(target, "#{pane_current_command}").await
    }

    async fn kill_pane_processes(&self, pane: &str) -> Result<usize, SessionError> {
        let raw = self.display(pane, "#{pane_pid}").await?;
        let pid: u32 = raw
            .trim()
            .parse()
            .map_err(|_| SessionError::Parse(format!("pane_pid={raw:?}")))?;
        let killed = procs::terminate_descendants(pid, PROCESS_GRACE).await?;
        debug!(pane, pid, killed, "terminated pane descendants");
        Ok(killed)
    }

    async fn respawn_pane(&self, pane: &str, work_dir: &Path, command: &str) -> Result<(), SessionError> {
        let dir = work_dir.to_string_lossy();
        self.run(&["respawn-pane", "-k", "-t", pane, "-c", &dir, command], pane)
            .await
            .map(|_| ())
    }

    async fn attach(&self, session: &str, inside_multiplexer: bool) -> Result<(), SessionError> {
        let verb = if inside_multiplexer {
            "switch-client"
        } else {
            "attach-session"
        };
        let target = exact(session);
        let status = self.command().args([verb, "-t", target.as_str()]).status().await?;
        if !status.success() {
            return Err(SessionError::CommandFailed {
                command: format!("tmux {verb} -t {target}"),
                status: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}
