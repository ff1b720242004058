//! In-process tracker and feed, for tests of code built on the tracker seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rigmux_protocol::{GateInfo, GateStatus};

use crate::error::TrackerError;
use crate::feed::{ActivityFeed, FeedSubscription};
use crate::{Issue, WorkTracker};

#[derive(Debug, Default)]
struct State {
    gates: HashMap<String, GateInfo>,
    waiters: Vec<(String, String)>,
    issues: HashMap<String, Issue>,
    labels: HashMap<String, Vec<String>>,
    fail_gate_wait: bool,
    fail_pin: bool,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryTracker {
    state: Arc<Mutex<State>>,
}

fn failed(command: &str) -> TrackerError {
    TrackerError::CommandFailed {
        command: command.to_string(),
        status: Some(1),
        stderr: "injected failure".to_string(),
    }
}

impl MemoryTracker {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_gate(&self, id: &str) {
        self.state().gates.insert(
            id.to_string(),
            GateInfo {
                id: id.to_string(),
                status: GateStatus::Open,
                close_reason: None,
            },
        );
    }

    pub fn close_gate(&self, id: &str, reason: &str) {
        self.state().gates.insert(
            id.to_string(),
            GateInfo {
                id: id.to_string(),
                status: GateStatus::Closed,
                close_reason: Some(reason.to_string()),
            },
        );
    }

    pub fn delete_gate(&self, id: &str) {
        self.state().gates.remove(id);
    }

    pub fn put_issue(&self, issue: Issue) {
        self.state().issues.insert(issue.id.clone(), issue);
    }

    pub fn issue(&self, id: &str) -> Option<Issue> {
        self.state().issues.get(id).cloned()
    }

    /// Take an issue off whoever has it pinned.
    pub fn unpin(&self, id: &str) {
        if let Some(issue) = self.state().issues.get_mut(id) {
            issue.status = "open".to_string();
            issue.assignee = None;
        }
    }

    pub fn put_labels(&self, id: &str, labels: &[&str]) {
        self.state()
            .labels
            .insert(id.to_string(), labels.iter().map(|s| s.to_string()).collect());
    }

    pub fn waiters(&self) -> Vec<(String, String)> {
        self.state().waiters.clone()
    }

    pub fn fail_gate_wait(&self, fail: bool) {
        self.state().fail_gate_wait = fail;
    }

    pub fn fail_pin(&self, fail: bool) {
        self.state().fail_pin = fail;
    }
}

impl WorkTracker for MemoryTracker {
    async fn gate_show(&self, gate_id: &str) -> Result<Option<GateInfo>, TrackerError> {
        Ok(self.state().gates.get(gate_id).cloned())
    }

    async fn gate_wait(&self, gate_id: &str, waiter: &str) -> Result<(), TrackerError> {
        let mut st = self.state();
        if st.fail_gate_wait {
            return Err(failed("gate wait"));
        }
        if !st.gates.contains_key(gate_id) {
            return Err(TrackerError::NotFound(gate_id.to_string()));
        }
        st.waiters.push((gate_id.to_string(), waiter.to_string()));
        Ok(())
    }

    async fn pinned_for(&self, assignee: &str) -> Result<Vec<Issue>, TrackerError> {
        let st = self.state();
        let mut pinned: Vec<Issue> = st
            .issues
            .values()
            .filter(|i| i.status == "pinned" && i.assignee.as_deref() == Some(assignee))
            .cloned()
            .collect();
        pinned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pinned)
    }

    async fn pin(&self, issue_id: &str, assignee: &str) -> Result<(), TrackerError> {
        let mut st = self.state();
        if st.fail_pin {
            return Err(failed("pin"));
        }
        let issue = st
            .issues
            .get_mut(issue_id)
            .ok_or_else(|| TrackerError::NotFound(issue_id.to_string()))?;
        issue.status = "pinned".to_string();
        issue.assignee = Some(assignee.to_string());
        Ok(())
    }

    async fn labels(&self, issue_id: &str) -> Result<Vec<String>, TrackerError> {
        self.state()
            .labels
            .get(issue_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(issue_id.to_string()))
    }

    async fn set_labels(&self, issue_id: &str, labels: &[String]) -> Result<(), TrackerError> {
        self.state().labels.insert(issue_id.to_string(), labels.to_vec());
        Ok(())
    }
}

/// What a [`ScriptedFeed`] subscription does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedScript {
    /// Emit one line after the delay.
    Event(String, Duration),
    Fail,
    /// Never emits.
    Silent,
    End,
}

#[derive(Debug, Default)]
struct FeedCounters {
    subscribed: usize,
    closed: usize,
}

#[derive(Debug, Clone)]
pub struct ScriptedFeed {
    script: FeedScript,
    counters: Arc<Mutex<FeedCounters>>,
}

impl ScriptedFeed {
    pub fn new(script: FeedScript) -> Self {
        Self {
            script,
            counters: Arc::default(),
        }
    }

    /// `(subscribed, closed)` counts.
    pub fn counts(&self) -> (usize, usize) {
        let c = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        (c.subscribed, c.closed)
    }
}

pub struct ScriptedSubscription {
    script: FeedScript,
    counters: Arc<Mutex<FeedCounters>>,
}

impl ActivityFeed for ScriptedFeed {
    type Subscription = ScriptedSubscription;

    async fn subscribe(&self) -> Result<ScriptedSubscription, TrackerError> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).subscribed += 1;
        Ok(ScriptedSubscription {
            script: self.script.clone(),
            counters: self.counters.clone(),
        })
    }
}

impl FeedSubscription for ScriptedSubscription {
    async fn next_event(&mut self) -> Result<Option<String>, TrackerError> {
        match &self.script {
            FeedScript::Event(line, delay) => {
                tokio::time::sleep(*delay).await;
                Ok(Some(line.clone()))
            }
            FeedScript::Fail => Err(failed("activity")),
            FeedScript::Silent => std::future::pending().await,
            FeedScript::End => Ok(None),
        }
    }

    async fn close(self) {
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).closed += 1;
    }
}
