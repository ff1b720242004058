use std::fmt::Display;

use tracing::{debug, warn};

/// Outcome of a best-effort side effect.
///
/// Failures never travel on the primary error channel. Callers hand the value to
/// [`Advisory::log`], which reports a failure as a warning and returns its text so it
/// can also be surfaced to the user.
#[must_use = "route advisory outcomes to the log with `log()`"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    action: String,
    failure: Option<String>,
}

impl Advisory {
    pub fn ok(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            failure: None,
        }
    }

    pub fn failed(action: impl Into<String>, err: impl Display) -> Self {
        Self {
            action: action.into(),
            failure: Some(err.to_string()),
        }
    }

    pub fn from_result<T, E: Display>(action: impl Into<String>, result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::ok(action),
            Err(err) => Self::failed(action, err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Report to the log. Returns the warning line when the step failed.
    pub fn log(self) -> Option<String> {
        match self.failure {
            Some(err) => {
                warn!(action = %self.action, error = %err, "best-effort step failed");
                Some(format!("{}: {err}", self.action))
            }
            None => {
                debug!(action = %self.action, "best-effort step done");
                None
            }
        }
    }
}
