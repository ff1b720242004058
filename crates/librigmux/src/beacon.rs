use std::fmt;

use chrono::{DateTime, Utc};

const HEADER: &str = "[RIGMUX]";

const CHECK_IN: &str = "Check your hook and mail, then act on the hook if one is set: \
`rigmux hook` shows the pinned work item and `rigmux mail inbox` lists new mail.";

const RESUME: &str = "Your session was restarted. Re-read your hook with `rigmux hook` \
before continuing; unfinished work is still pinned to you.";

/// Why an agent process is being started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconTopic {
    ColdStart,
    Handoff,
    Start,
    Restart,
    Assigned(String),
    Ready,
}

impl BeaconTopic {
    pub fn label(&self) -> String {
        match self {
            BeaconTopic::ColdStart => "cold-start".to_string(),
            BeaconTopic::Handoff => "handoff".to_string(),
            BeaconTopic::Start => "start".to_string(),
            BeaconTopic::Restart => "restart".to_string(),
            BeaconTopic::Assigned(id) => format!("assigned:{id}"),
            BeaconTopic::Ready => "ready".to_string(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "cold-start" => BeaconTopic::ColdStart,
            "handoff" => BeaconTopic::Handoff,
            "start" => BeaconTopic::Start,
            "restart" => BeaconTopic::Restart,
            other => match other.strip_prefix("assigned:") {
                Some(id) if !id.is_empty() => BeaconTopic::Assigned(id.to_string()),
                _ => BeaconTopic::Ready,
            },
        }
    }

    fn instructions(&self) -> Option<&'static str> {
        match self {
            BeaconTopic::ColdStart
            | BeaconTopic::Handoff
            | BeaconTopic::Start
            | BeaconTopic::Assigned(_) => Some(CHECK_IN),
            BeaconTopic::Restart => Some(RESUME),
            BeaconTopic::Ready => None,
        }
    }
}

/// Startup payload handed to a freshly started agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub recipient: String,
    pub sender: String,
    pub topic: BeaconTopic,
    pub timestamp: DateTime<Utc>,
}

impl Beacon {
    pub fn new(recipient: impl Into<String>, sender: impl Into<String>, topic: BeaconTopic) -> Self {
        Self {
            recipient: recipient.into(),
            sender: sender.into(),
            topic,
            timestamp: Utc::now(),
        }
    }

    /// One-line header followed by the topic's instructions, if any.
    pub fn prompt(&self) -> String {
        match self.topic.instructions() {
            Some(text) => format!("{self}\n\n{text}"),
            None => self.to_string(),
        }
    }

    /// Shell command line that replaces the pane's shell with the agent.
    pub fn startup_command(&self, agent_command: &str) -> String {
        format!("exec {agent_command} {}", shell_quote(&self.prompt()))
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{HEADER} {} <- {} • {} • {}",
            self.recipient,
            self.sender,
            self.timestamp.format("%Y-%m-%dT%H:%M"),
            self.topic.label()
        )
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
