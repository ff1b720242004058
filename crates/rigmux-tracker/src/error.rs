use thiserror::Error;
use tokio_util::codec::LinesCodecError;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("command failed ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected output from {command}: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("activity feed read failed: {0}")]
    Feed(#[from] LinesCodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn from_stderr(command: String, status: Option<i32>, stderr: String, subject: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("not found") || lower.contains("no issue") {
            return Self::NotFound(subject.to_string());
        }
        Self::CommandFailed {
            command,
            status,
            stderr: stderr.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        let err = TrackerError::from_stderr("bd gate show g1".into(), Some(1), "Error: gate g1 not found".into(), "g1");
        assert!(err.is_not_found());
        let err = TrackerError::from_stderr("bd list".into(), Some(2), "database locked\n".into(), "");
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "command failed (bd list) status=Some(2): database locked");
    }
}
