//! Seam to the external work tracker: gates, pinned work and per-agent labels,
//! plus the append-only activity feed.

pub mod bd;
pub mod error;
pub mod feed;
pub mod labels;
pub mod memory;

pub use bd::BdTracker;
pub use error::TrackerError;
pub use feed::{ActivityFeed, CommandFeed, FeedSubscription};
pub use labels::update_labels;

use rigmux_protocol::GateInfo;
use serde::{Deserialize, Serialize};

/// Work item as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

/// Description line naming the formula attached to a work item.
pub const ATTACHED_MOLECULE_KEY: &str = "attached_molecule";

impl Issue {
    /// Value of an `attached_molecule: <id>` line in the description, if any.
    pub fn attached_molecule(&self) -> Option<String> {
        self.description.lines().find_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            if !key.trim().eq_ignore_ascii_case(ATTACHED_MOLECULE_KEY) {
                return None;
            }
            value.split_whitespace().next().map(str::to_string)
        })
    }

    /// Fill `formula` from the description when the tracker did not report one.
    pub fn with_attachment_fields(mut self) -> Self {
        if self.formula.is_none() {
            self.formula = self.attached_molecule();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(description: &str) -> Issue {
        Issue {
            id: "gt-1".into(),
            description: description.into(),
            ..Default::default()
        }
    }

    #[test]
    fn attached_molecule_is_read_from_description() {
        let i = issue("Fix the build\n\nAttached_Molecule:  mol-42 extra\nattached_at: now");
        assert_eq!(i.attached_molecule().as_deref(), Some("mol-42"));
        assert_eq!(i.with_attachment_fields().formula.as_deref(), Some("mol-42"));
    }

    #[test]
    fn explicit_formula_wins_and_blank_value_is_none() {
        let mut i = issue("attached_molecule: mol-1");
        i.formula = Some("mol-9".into());
        assert_eq!(i.with_attachment_fields().formula.as_deref(), Some("mol-9"));
        assert_eq!(issue("attached_molecule:   ").attached_molecule(), None);
        assert_eq!(issue("no attachment here").attached_molecule(), None);
    }
}

/// Operations this crate needs from the tracker. Labels are read and replaced as a
/// whole set; there is no partial-label update.
#[allow(async_fn_in_trait)]
pub trait WorkTracker {
    /// `Ok(None)` when the gate does not exist.
    async fn gate_show(&self, gate_id: &str) -> Result<Option<GateInfo>, TrackerError>;
    async fn gate_wait(&self, gate_id: &str, waiter: &str) -> Result<(), TrackerError>;
    async fn pinned_for(&self, assignee: &str) -> Result<Vec<Issue>, TrackerError>;
    async fn pin(&self, issue_id: &str, assignee: &str) -> Result<(), TrackerError>;
    async fn labels(&self, issue_id: &str) -> Result<Vec<String>, TrackerError>;
    async fn set_labels(&self, issue_id: &str, labels: &[String]) -> Result<(), TrackerError>;
}
