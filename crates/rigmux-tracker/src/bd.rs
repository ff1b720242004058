use std::path::PathBuf;

use rigmux_protocol::GateInfo;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::TrackerError;
use crate::{Issue, WorkTracker};

pub const DEFAULT_BIN: &str = "bd";
const PINNED_STATUS: &str = "pinned";

/// [`WorkTracker`] that shells out to the tracker CLI with `--json` output.
#[derive(Debug, Clone)]
pub struct BdTracker {
    bin: PathBuf,
    work_dir: Option<PathBuf>,
}

impl Default for BdTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BIN)
    }
}

impl BdTracker {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            work_dir: None,
        }
    }

    /// Run every command from `dir`; the CLI locates its database from the cwd.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn bin(&self) -> &PathBuf {
        &self.bin
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str], subject: &str) -> Result<String, TrackerError> {
        let command_line = format!("{} {}", self.bin.display(), args.join(" "));
        debug!(command = %command_line, "running tracker command");
        let output = self.command().args(args).output().await?;
        if !output.status.success() {
            return Err(TrackerError::from_stderr(
                command_line,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                subject,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[&str], subject: &str) -> Result<T, TrackerError> {
        let raw = self.run(args, subject).await?;
        parse_json(args, &raw)
    }

    async fn show(&self, issue_id: &str) -> Result<Issue, TrackerError> {
        let value: Value = self.run_json(&["show", issue_id, "--json"], issue_id).await?;
        single(value)
            .ok_or_else(|| TrackerError::NotFound(issue_id.to_string()))
            .and_then(|v| parse_value::<Issue>(&["show", issue_id], v))
            .map(Issue::with_attachment_fields)
    }
}

fn parse_json<T: DeserializeOwned>(args: &[&str], raw: &str) -> Result<T, TrackerError> {
    serde_json::from_str(raw.trim()).map_err(|source| TrackerError::Parse {
        command: args.join(" "),
        source,
    })
}

fn parse_value<T: DeserializeOwned>(args: &[&str], value: Value) -> Result<T, TrackerError> {
    serde_json::from_value(value).map_err(|source| TrackerError::Parse {
        command: args.join(" "),
        source,
    })
}

/// `show` may print an object or a one-element array.
fn single(value: Value) -> Option<Value> {
    match value {
        Value::Array(items) => items.into_iter().next(),
        Value::Null => None,
        other => Some(other),
    }
}

impl WorkTracker for BdTracker {
    async fn gate_show(&self, gate_id: &str) -> Result<Option<GateInfo>, TrackerError> {
        let args = ["gate", "show", gate_id, "--json"];
        let value: Value = match self.run_json(&args, gate_id).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        single(value).map(|v| parse_value(&args, v)).transpose()
    }

    async fn gate_wait(&self, gate_id: &str, waiter: &str) -> Result<(), TrackerError> {
        self.run(&["gate", "wait", gate_id, "--notify", waiter], gate_id)
            .await
            .map(|_| ())
    }

    async fn pinned_for(&self, assignee: &str) -> Result<Vec<Issue>, TrackerError> {
        let raw = self
            .run(
                &["list", "--status", PINNED_STATUS, "--assignee", assignee, "--json"],
                assignee,
            )
            .await?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let issues: Vec<Issue> = parse_json(&["list", "--status", PINNED_STATUS], &raw)?;
        Ok(issues.into_iter().map(Issue::with_attachment_fields).collect())
    }

    async fn pin(&self, issue_id: &str, assignee: &str) -> Result<(), TrackerError> {
        self.run(
            &["update", issue_id, "--status", PINNED_STATUS, "--assignee", assignee],
            issue_id,
        )
        .await
        .map(|_| ())
    }

    async fn labels(&self, issue_id: &str) -> Result<Vec<String>, TrackerError> {
        Ok(self.show(issue_id).await?.labels)
    }

    async fn set_labels(&self, issue_id: &str, labels: &[String]) -> Result<(), TrackerError> {
        let mut args = vec!["update".to_string(), issue_id.to_string()];
        if labels.is_empty() {
            args.push("--set-labels=".to_string());
        }
        args.extend(labels.iter().map(|label| format!("--set-labels={label}")));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, issue_id).await.map(|_| ())
    }
}
