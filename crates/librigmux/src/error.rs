use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("multiplexer command failed ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("pane not found: {0}")]
    PaneNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("shell in session {session} not ready after {timeout_ms}ms")]
    ShellNotReady { session: String, timeout_ms: u64 },

    #[error("stale session {session} persists after cleanup (pane {pane})")]
    StaleAfterRecreate { session: String, pane: String },

    #[error("unexpected multiplexer output: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. } | Self::PaneNotFound(_) | Self::Io(_)
        )
    }

    /// Classify multiplexer stderr into the variants callers branch on.
    pub fn from_stderr(command: String, status: Option<i32>, stderr: String, target: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("can't find pane") || lower.contains("can't find window") {
            Self::PaneNotFound(target.to_string())
        } else if lower.contains("can't find session")
            || lower.contains("session not found")
            || lower.contains("no server running")
        {
            Self::SessionNotFound(target.to_string())
        } else {
            Self::CommandFailed {
                command,
                status,
                stderr: stderr.trim().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_stderr() {
        let e = SessionError::from_stderr("x".into(), Some(1), "can't find pane: %3".into(), "%3");
        assert!(matches!(e, SessionError::PaneNotFound(p) if p == "%3"));
        let e = SessionError::from_stderr("x".into(), Some(1), "no server running on /tmp/x".into(), "s");
        assert!(matches!(e, SessionError::SessionNotFound(_)));
        let e = SessionError::from_stderr("x".into(), Some(1), "boom\n".into(), "s");
        assert!(matches!(e, SessionError::CommandFailed { ref stderr, .. } if stderr == "boom"));
        assert!(e.is_transient());
    }
}
