use std::path::PathBuf;
use std::process::Stdio;

use futures_util::StreamExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

use crate::error::TrackerError;

const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Append-only stream of tracker activity, one line per event.
#[allow(async_fn_in_trait)]
pub trait ActivityFeed {
    type Subscription: FeedSubscription;

    async fn subscribe(&self) -> Result<Self::Subscription, TrackerError>;
}

#[allow(async_fn_in_trait)]
pub trait FeedSubscription {
    /// Next event line. `Ok(None)` when the feed ended.
    async fn next_event(&mut self) -> Result<Option<String>, TrackerError>;

    /// Stop the subscription and reap whatever backs it.
    async fn close(self);
}

/// Feed backed by a long-lived `<bin> activity --follow` child process.
#[derive(Debug, Clone)]
pub struct CommandFeed {
    bin: PathBuf,
    args: Vec<String>,
    work_dir: Option<PathBuf>,
}

impl CommandFeed {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            args: vec!["activity".to_string(), "--follow".to_string()],
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}

pub struct CommandSubscription {
    child: Child,
    lines: FramedRead<ChildStdout, LinesCodec>,
}

impl ActivityFeed for CommandFeed {
    type Subscription = CommandSubscription;

    async fn subscribe(&self) -> Result<CommandSubscription, TrackerError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other(format!("{} stdout not captured", self.bin.display()))
        })?;
        debug!(bin = %self.bin.display(), pid = ?child.id(), "activity feed subscribed");
        Ok(CommandSubscription {
            child,
            lines: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_EVENT_BYTES)),
        })
    }
}

impl FeedSubscription for CommandSubscription {
    async fn next_event(&mut self) -> Result<Option<String>, TrackerError> {
        loop {
            match self.lines.next().await {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return Ok(Some(line)),
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(TrackerError::CommandFailed {
                command: "activity feed".to_string(),
                status: status.code(),
                stderr: String::new(),
            });
        }
        Ok(None)
    }

    async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "activity feed already exited");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_line_is_the_event() {
        let feed = CommandFeed::new("sh").with_args(["-c", "echo; echo 'gt-1 created'; sleep 30"]);
        let mut sub = feed.subscribe().await.unwrap();
        assert_eq!(sub.next_event().await.unwrap().as_deref(), Some("gt-1 created"));
        sub.close().await;
    }

    #[tokio::test]
    async fn failing_feed_is_an_error() {
        let feed = CommandFeed::new("sh").with_args(["-c", "exit 3"]);
        let mut sub = feed.subscribe().await.unwrap();
        let err = sub.next_event().await.unwrap_err();
        assert!(matches!(err, TrackerError::CommandFailed { status: Some(3), .. }));
    }

    #[tokio::test]
    async fn clean_end_is_none() {
        let feed = CommandFeed::new("true").with_args(Vec::<String>::new());
        let mut sub = feed.subscribe().await.unwrap();
        assert!(sub.next_event().await.unwrap().is_none());
    }
}
