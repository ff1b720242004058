pub mod advisory;
pub mod lock;
pub mod names;
pub mod paths;

pub use advisory::Advisory;
pub use lock::{DEFAULT_LOCK_TIMEOUT, FileLock, LockError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Environment variables read by the identity resolver and exported into agent sessions.
pub mod env {
    pub const ROLE: &str = "RIGMUX_ROLE";
    pub const RIG: &str = "RIGMUX_RIG";
    pub const WORKER: &str = "RIGMUX_WORKER";
    pub const TOWN_ROOT: &str = "RIGMUX_TOWN_ROOT";
    pub const STATE_DIR: &str = "RIGMUX_STATE_DIR";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("invalid address: {0}")]
    Invalid(String),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("role {0} requires a rig")]
    MissingRig(Role),
    #[error("role {0} requires a worker name")]
    MissingWorker(Role),
}

/// Role an agent plays inside a town.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Global coordinator.
    #[serde(rename = "mayor")]
    Coordinator,
    /// Global supervisor.
    #[serde(rename = "deacon")]
    Supervisor,
    /// Per-rig worker health monitor.
    #[serde(rename = "witness")]
    Witness,
    /// Per-rig merge queue processor.
    #[serde(rename = "refinery")]
    Refinery,
    /// Short-lived worker recycled after each unit of work.
    #[serde(rename = "polecat")]
    EphemeralWorker,
    /// Long-lived, human-managed worker workspace.
    #[serde(rename = "crew")]
    PersistentWorker,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Coordinator,
        Role::Supervisor,
        Role::Witness,
        Role::Refinery,
        Role::EphemeralWorker,
        Role::PersistentWorker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Coordinator => "mayor",
            Role::Supervisor => "deacon",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
            Role::EphemeralWorker => "polecat",
            Role::PersistentWorker => "crew",
        }
    }

    pub fn needs_rig(self) -> bool {
        !self.is_global()
    }

    pub fn needs_worker(self) -> bool {
        matches!(self, Role::EphemeralWorker | Role::PersistentWorker)
    }

    pub fn is_global(self) -> bool {
        matches!(self, Role::Coordinator | Role::Supervisor)
    }

    pub fn description(self) -> &'static str {
        match self {
            Role::Coordinator => "Global coordinator; dispatches work across rigs",
            Role::Supervisor => "Global supervisor; keeps town-level agents alive",
            Role::Witness => "Per-rig monitor of worker health",
            Role::Refinery => "Per-rig merge queue processor",
            Role::EphemeralWorker => "Short-lived worker, recycled after each unit of work",
            Role::PersistentWorker => "Long-lived, human-managed worker workspace",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mayor" => Ok(Role::Coordinator),
            "deacon" => Ok(Role::Supervisor),
            "witness" => Ok(Role::Witness),
            "refinery" => Ok(Role::Refinery),
            "polecat" | "polecats" => Ok(Role::EphemeralWorker),
            "crew" => Ok(Role::PersistentWorker),
            other => Err(AddressError::UnknownRole(other.to_string())),
        }
    }
}

const RESERVED_SEGMENTS: [&str; 6] = ["mayor", "deacon", "witness", "refinery", "crew", "polecats"];

/// Canonical address of one agent.
///
/// The string form is a pure function of (role, rig, worker):
/// `mayor/`, `deacon/`, `<rig>/witness`, `<rig>/refinery`, `<rig>/<name>` and
/// `<rig>/crew/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentAddress {
    Coordinator,
    Supervisor,
    Witness { rig: String },
    Refinery { rig: String },
    EphemeralWorker { rig: String, name: String },
    PersistentWorker { rig: String, name: String },
}

impl AgentAddress {
    pub fn new(role: Role, rig: Option<&str>, worker: Option<&str>) -> Result<Self, AddressError> {
        let need_rig = || -> Result<String, AddressError> {
            match rig.map(str::trim).filter(|r| !r.is_empty()) {
                Some(r) => validate_segment(r).map(|_| r.to_string()),
                None => Err(AddressError::MissingRig(role)),
            }
        };
        let need_worker = || -> Result<String, AddressError> {
            match worker.map(str::trim).filter(|w| !w.is_empty()) {
                Some(w) => validate_segment(w).map(|_| w.to_string()),
                None => Err(AddressError::MissingWorker(role)),
            }
        };
        Ok(match role {
            Role::Coordinator => AgentAddress::Coordinator,
            Role::Supervisor => AgentAddress::Supervisor,
            Role::Witness => AgentAddress::Witness { rig: need_rig()? },
            Role::Refinery => AgentAddress::Refinery { rig: need_rig()? },
            Role::EphemeralWorker => AgentAddress::EphemeralWorker {
                rig: need_rig()?,
                name: need_worker()?,
            },
            Role::PersistentWorker => AgentAddress::PersistentWorker {
                rig: need_rig()?,
                name: need_worker()?,
            },
        })
    }

    /// Parse an address, accepting `mayor` for `mayor/` and `<rig>/polecats/<name>`
    /// for `<rig>/<name>`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let parts: Vec<&str> = trimmed.trim_end_matches('/').split('/').collect();
        match parts.as_slice() {
            ["mayor"] => Ok(AgentAddress::Coordinator),
            ["deacon"] => Ok(AgentAddress::Supervisor),
            [rig, "witness"] => AgentAddress::new(Role::Witness, Some(*rig), None),
            [rig, "refinery"] => AgentAddress::new(Role::Refinery, Some(*rig), None),
            [rig, "crew", name] => {
                AgentAddress::new(Role::PersistentWorker, Some(*rig), Some(*name))
            }
            [rig, "polecats", name] => {
                AgentAddress::new(Role::EphemeralWorker, Some(*rig), Some(*name))
            }
            [rig, name] if !RESERVED_SEGMENTS.contains(name) => {
                AgentAddress::new(Role::EphemeralWorker, Some(*rig), Some(*name))
            }
            _ => Err(AddressError::Invalid(trimmed.to_string())),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            AgentAddress::Coordinator => Role::Coordinator,
            AgentAddress::Supervisor => Role::Supervisor,
            AgentAddress::Witness { .. } => Role::Witness,
            AgentAddress::Refinery { .. } => Role::Refinery,
            AgentAddress::EphemeralWorker { .. } => Role::EphemeralWorker,
            AgentAddress::PersistentWorker { .. } => Role::PersistentWorker,
        }
    }

    pub fn rig(&self) -> Option<&str> {
        match self {
            AgentAddress::Coordinator | AgentAddress::Supervisor => None,
            AgentAddress::Witness { rig }
            | AgentAddress::Refinery { rig }
            | AgentAddress::EphemeralWorker { rig, .. }
            | AgentAddress::PersistentWorker { rig, .. } => Some(rig),
        }
    }

    pub fn worker(&self) -> Option<&str> {
        match self {
            AgentAddress::EphemeralWorker { name, .. }
            | AgentAddress::PersistentWorker { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Filesystem-safe key; see [`file_key`].
    pub fn file_key(&self) -> String {
        file_key(&self.to_string())
    }
}

/// Filesystem-safe form of any address string.
///
/// `/` becomes `_`; a literal `_`, `%` or `:` is percent-encoded, so distinct
/// addresses never share a key.
pub fn file_key(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    let mut key = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '/' => key.push('_'),
            '_' => key.push_str("%5F"),
            '%' => key.push_str("%25"),
            ':' => key.push_str("%3A"),
            c => key.push(c),
        }
    }
    key
}

fn validate_segment(segment: &str) -> Result<(), AddressError> {
    if segment.contains('/')
        || segment == "."
        || segment == ".."
        || segment.chars().any(char::is_whitespace)
    {
        return Err(AddressError::Invalid(segment.to_string()));
    }
    Ok(())
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentAddress::Coordinator => f.write_str("mayor/"),
            AgentAddress::Supervisor => f.write_str("deacon/"),
            AgentAddress::Witness { rig } => write!(f, "{rig}/witness"),
            AgentAddress::Refinery { rig } => write!(f, "{rig}/refinery"),
            AgentAddress::EphemeralWorker { rig, name } => write!(f, "{rig}/{name}"),
            AgentAddress::PersistentWorker { rig, name } => write!(f, "{rig}/crew/{name}"),
        }
    }
}

impl FromStr for AgentAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentAddress::parse(s)
    }
}

impl TryFrom<String> for AgentAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AgentAddress::parse(&value)
    }
}

impl From<AgentAddress> for String {
    fn from(value: AgentAddress) -> Self {
        value.to_string()
    }
}

/// Mail priority. Ordered so that `Urgent > High > Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric levels: 0 urgent, 1 high, anything else normal.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Priority::Urgent,
            1 => Priority::High,
            _ => Priority::Normal,
        }
    }

    /// Apply the notify flag: raises `Normal` to `High`, never lowers.
    pub fn with_notify(self, notify: bool) -> Self {
        if notify { self.max(Priority::High) } else { self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Notification,
    Task,
    Scavenge,
    Reply,
    Handoff,
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notification" | "" => Ok(MessageType::Notification),
            "task" => Ok(MessageType::Task),
            "scavenge" => Ok(MessageType::Scavenge),
            "reply" => Ok(MessageType::Reply),
            "handoff" => Ok(MessageType::Handoff),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// One mail message as stored on disk (one JSON object per line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, rename = "type")]
    pub message_type: MessageType,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub wisp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Open,
    Closed,
}

/// Gate as reported by the work tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateInfo {
    pub id: String,
    pub status: GateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

impl GateInfo {
    pub fn is_open(&self) -> bool {
        self.status == GateStatus::Open
    }
}

/// Suspension marker written by `park` and consumed by `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedWork {
    pub agent_id: String,
    pub gate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bead_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub parked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResumeStatus {
    pub has_parked_work: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parked_work: Option<ParkedWork>,
    pub gate_closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    pub can_resume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitReason {
    Signal,
    Timeout,
}

/// Result of one await-signal wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitOutcome {
    pub reason: AwaitReason,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub idle_cycles: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip_all_roles() {
        let cases = [
            ("mayor/", AgentAddress::Coordinator),
            ("deacon/", AgentAddress::Supervisor),
            ("rig42/witness", AgentAddress::Witness { rig: "rig42".into() }),
            ("rig42/refinery", AgentAddress::Refinery { rig: "rig42".into() }),
            (
                "rig42/nux",
                AgentAddress::EphemeralWorker {
                    rig: "rig42".into(),
                    name: "nux".into(),
                },
            ),
            (
                "rig42/crew/max",
                AgentAddress::PersistentWorker {
                    rig: "rig42".into(),
                    name: "max".into(),
                },
            ),
        ];
        for (text, addr) in cases {
            assert_eq!(AgentAddress::parse(text).unwrap(), addr);
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn address_aliases_normalize() {
        assert_eq!(AgentAddress::parse("mayor").unwrap(), AgentAddress::Coordinator);
        assert_eq!(
            AgentAddress::parse("rig42/polecats/nux").unwrap().to_string(),
            "rig42/nux"
        );
    }

    #[test]
    fn address_is_pure_function_of_triple() {
        for role in Role::ALL {
            let a = AgentAddress::new(role, Some("r"), Some("w")).unwrap();
            let b = AgentAddress::new(role, Some("r"), Some("w")).unwrap();
            assert_eq!(a.to_string(), b.to_string());
            assert_eq!(a.role(), role);
        }
    }

    #[test]
    fn address_requires_qualifiers() {
        assert_eq!(
            AgentAddress::new(Role::PersistentWorker, Some("r"), None),
            Err(AddressError::MissingWorker(Role::PersistentWorker))
        );
        assert_eq!(
            AgentAddress::new(Role::Witness, Some(""), None),
            Err(AddressError::MissingRig(Role::Witness))
        );
        assert!(AgentAddress::parse("rig/crew").is_err());
        assert!(AgentAddress::parse("a/b/c/d").is_err());
    }

    #[test]
    fn file_key_is_filesystem_safe() {
        assert_eq!(AgentAddress::Coordinator.file_key(), "mayor");
        assert_eq!(AgentAddress::parse("r/crew/max").unwrap().file_key(), "r_crew_max");
        assert_eq!(file_key("queue:work"), "queue%3Awork");
    }

    #[test]
    fn file_keys_never_collide() {
        let a = AgentAddress::parse("my_app/witness").unwrap().file_key();
        let b = AgentAddress::parse("my/app_witness").unwrap().file_key();
        assert_ne!(a, b);
        assert_ne!(file_key("queue:work"), file_key("queue/work"));
        assert_ne!(file_key("a_/b"), file_key("a/_b"));
    }

    #[test]
    fn dot_segments_are_rejected() {
        assert!(AgentAddress::parse("../witness").is_err());
        assert!(AgentAddress::parse("./crew/max").is_err());
        assert!(AgentAddress::parse("rig/crew/..").is_err());
        assert!(AgentAddress::parse("rig/..").is_err());
        assert!(AgentAddress::new(Role::Refinery, Some(".."), None).is_err());
    }

    #[test]
    fn notify_never_downgrades() {
        assert_eq!(Priority::Normal.with_notify(true), Priority::High);
        assert_eq!(Priority::Urgent.with_notify(true), Priority::Urgent);
        assert_eq!(Priority::Normal.with_notify(false), Priority::Normal);
        assert_eq!(Priority::from_level(0), Priority::Urgent);
        assert_eq!(Priority::from_level(3), Priority::Normal);
    }

    #[test]
    fn parked_work_json_shape() {
        let json = r#"{"agent_id":"r/crew/max","gate_id":"g1","parked_at":"2026-01-02T03:04:05Z"}"#;
        let parked: ParkedWork = serde_json::from_str(json).unwrap();
        assert_eq!(parked.gate_id, "g1");
        assert!(parked.bead_id.is_none());
        let back = serde_json::to_value(&parked).unwrap();
        assert!(back.get("context").is_none());
    }
}
