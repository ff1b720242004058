use anyhow::Context;
use chrono::Utc;
use rigmux_protocol::paths::parked_dir;
use rigmux_protocol::{Advisory, ParkedWork, ResumeStatus, file_key};
use rigmux_tracker::WorkTracker;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::CoordError;

pub const GATE_GONE_REASON: &str = "Gate no longer exists (may have been cleaned up)";
const CONTEXT_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkReport {
    pub parked: ParkedWork,
    pub path: PathBuf,
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    #[serde(flatten)]
    pub status: ResumeStatus,
    /// The gate vanished; resumption went ahead anyway.
    pub gate_missing: bool,
    /// Work was restored and the park file removed.
    pub resumed: bool,
    pub warnings: Vec<String>,
}

/// Park/resume for one agent. The park file under `<town>/.runtime/parked/` is
/// the source of truth; gate waiter registration is advisory.
#[derive(Debug, Clone)]
pub struct GateCoordinator<T> {
    tracker: T,
    parked_dir: PathBuf,
    agent: String,
}

impl<T: WorkTracker> GateCoordinator<T> {
    pub fn new(tracker: T, town_root: &Path, agent: impl Into<String>) -> Self {
        Self::with_parked_dir(tracker, parked_dir(town_root), agent)
    }

    pub fn with_parked_dir(tracker: T, parked_dir: PathBuf, agent: impl Into<String>) -> Self {
        Self {
            tracker,
            parked_dir,
            agent: agent.into(),
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn park_path(&self) -> PathBuf {
        self.parked_dir.join(format!("{}.json", file_key(&self.agent)))
    }

    pub fn load(&self) -> Result<Option<ParkedWork>, CoordError> {
        let path = self.park_path();
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display()))
                    .into());
            }
        };
        let parked = serde_json::from_str(&data)
            .with_context(|| format!("invalid parked work in {}", path.display()))?;
        Ok(Some(parked))
    }

    fn save(&self, parked: &ParkedWork) -> Result<PathBuf, CoordError> {
        let path = self.park_path();
        std::fs::create_dir_all(&self.parked_dir)
            .with_context(|| format!("failed to create {}", self.parked_dir.display()))?;
        let json = serde_json::to_string_pretty(parked).context("failed to encode parked work")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(path)
    }

    fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(self.park_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Suspend on an open gate, saving the pinned work item and notes.
    pub async fn park(&self, gate_id: &str, message: Option<&str>, dry_run: bool) -> Result<ParkReport, CoordError> {
        let gate = self
            .tracker
            .gate_show(gate_id)
            .await?
            .ok_or_else(|| CoordError::GateNotFound(gate_id.to_string()))?;
        if !gate.is_open() {
            return Err(CoordError::GateClosed(gate_id.to_string()));
        }

        let mut warnings = Vec::new();
        let hook = match self.tracker.pinned_for(&self.agent).await {
            Ok(pinned) => pinned.into_iter().next(),
            Err(e) => {
                warnings.extend(Advisory::failed("read pinned work", e).log());
                None
            }
        };
        let hook_notes = hook
            .as_ref()
            .map(|i| i.description.as_str())
            .filter(|d| !d.trim().is_empty());

        let parked = ParkedWork {
            agent_id: self.agent.clone(),
            gate_id: gate_id.to_string(),
            bead_id: hook.as_ref().map(|i| i.id.clone()),
            formula: hook.as_ref().and_then(|i| i.formula.clone()),
            context: merge_context(hook_notes, message),
            parked_at: Utc::now(),
        };

        if dry_run {
            return Ok(ParkReport {
                parked,
                path: self.park_path(),
                dry_run,
                warnings,
            });
        }

        let registered = self.tracker.gate_wait(gate_id, &self.agent).await;
        warnings.extend(Advisory::from_result(format!("register waiter on {gate_id}"), registered).log());

        let path = self.save(&parked)?;
        info!(agent = %self.agent, gate = gate_id, bead = ?parked.bead_id, "work parked");
        Ok(ParkReport {
            parked,
            path,
            dry_run,
            warnings,
        })
    }

    /// Report whether parked work can resume, without changing anything.
    pub async fn status(&self) -> Result<ResumeReport, CoordError> {
        let Some(parked) = self.load()? else {
            return Ok(ResumeReport {
                status: ResumeStatus::default(),
                gate_missing: false,
                resumed: false,
                warnings: Vec::new(),
            });
        };
        let gate = self.tracker.gate_show(&parked.gate_id).await?;
        let gate_missing = gate.is_none();
        let (gate_closed, close_reason) = match gate {
            None => (true, Some(GATE_GONE_REASON.to_string())),
            Some(g) => (!g.is_open(), g.close_reason),
        };
        Ok(ResumeReport {
            status: ResumeStatus {
                has_parked_work: true,
                parked_work: Some(parked),
                gate_closed,
                close_reason,
                can_resume: gate_closed,
            },
            gate_missing,
            resumed: false,
            warnings: Vec::new(),
        })
    }

    /// Single non-blocking check. On a closed or vanished gate, re-pin the saved
    /// work item and remove the park file; a failed re-pin still removes it.
    pub async fn resume(&self) -> Result<ResumeReport, CoordError> {
        let mut report = self.status().await?;
        let Some(parked) = report.status.parked_work.clone() else {
            return Ok(report);
        };
        if !report.status.can_resume {
            return Ok(report);
        }
        if report.gate_missing {
            warn!(gate = %parked.gate_id, "gate no longer exists, restoring parked work anyway");
        }

        if let Some(bead) = &parked.bead_id {
            let pinned = self.tracker.pin(bead, &self.agent).await;
            report
                .warnings
                .extend(Advisory::from_result(format!("re-pin {bead}"), pinned).log());
        }
        let cleared = self.clear();
        report
            .warnings
            .extend(Advisory::from_result("clear parked state", cleared).log());

        report.resumed = true;
        info!(agent = %self.agent, gate = %parked.gate_id, "parked work resumed");
        Ok(report)
    }
}

/// Pinned item notes first, then the new message after a separator.
fn merge_context(hook: Option<&str>, message: Option<&str>) -> Option<String> {
    let message = message.filter(|m| !m.trim().is_empty());
    match (hook, message) {
        (Some(h), Some(m)) => Some(format!("{h}{CONTEXT_SEPARATOR}{m}")),
        (Some(h), None) => Some(h.to_string()),
        (None, Some(m)) => Some(m.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigmux_tracker::Issue;
    use rigmux_tracker::memory::MemoryTracker;

    const MAX: &str = "rig42/crew/max";

    fn coordinator(dir: &Path) -> GateCoordinator<MemoryTracker> {
        GateCoordinator::new(MemoryTracker::default(), dir, MAX)
    }

    fn hook(tracker: &MemoryTracker) {
        tracker.put_issue(Issue {
            id: "gt-7".into(),
            title: "auth flow".into(),
            description: "halfway through token refresh".into(),
            status: "pinned".into(),
            assignee: Some(MAX.into()),
            formula: Some("mol-review".into()),
            ..Issue::default()
        });
    }

    #[tokio::test]
    async fn park_then_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        gc.tracker().open_gate("g1");
        hook(gc.tracker());

        let parked = gc.park("g1", Some("waiting on review"), false).await.unwrap();
        assert!(parked.warnings.is_empty());
        assert_eq!(parked.path, dir.path().join(".runtime/parked/rig42_crew_max.json"));
        assert_eq!(gc.tracker().waiters(), vec![("g1".to_string(), MAX.to_string())]);
        gc.tracker().unpin("gt-7");

        let still_open = gc.resume().await.unwrap();
        assert!(still_open.status.has_parked_work);
        assert!(!still_open.status.can_resume);
        assert!(!still_open.resumed);
        assert!(gc.park_path().exists());

        gc.tracker().close_gate("g1", "approved");
        let resumed = gc.resume().await.unwrap();
        assert!(resumed.resumed);
        assert!(resumed.status.can_resume);
        assert_eq!(resumed.status.close_reason.as_deref(), Some("approved"));
        let work = resumed.status.parked_work.unwrap();
        assert_eq!(work.bead_id.as_deref(), Some("gt-7"));
        assert_eq!(work.formula.as_deref(), Some("mol-review"));
        assert_eq!(
            work.context.as_deref(),
            Some("halfway through token refresh\n---\nwaiting on review")
        );
        assert_eq!(gc.tracker().issue("gt-7").unwrap().assignee.as_deref(), Some(MAX));
        assert!(!gc.park_path().exists());

        let again = gc.resume().await.unwrap();
        assert!(!again.status.has_parked_work);
        assert!(!again.resumed);
    }

    #[tokio::test]
    async fn resume_with_no_hook_clears_park_file() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        gc.tracker().open_gate("g1");
        let parked = gc.park("g1", None, false).await.unwrap();
        assert!(parked.parked.bead_id.is_none());
        assert!(parked.parked.context.is_none());

        gc.tracker().close_gate("g1", "approved");
        let report = gc.resume().await.unwrap();
        assert!(report.status.can_resume);
        assert_eq!(report.status.close_reason.as_deref(), Some("approved"));
        assert!(!gc.resume().await.unwrap().status.has_parked_work);
    }

    #[tokio::test]
    async fn deleted_gate_still_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        gc.tracker().open_gate("g1");
        hook(gc.tracker());
        gc.park("g1", None, false).await.unwrap();
        gc.tracker().delete_gate("g1");

        let report = gc.resume().await.unwrap();
        assert!(report.gate_missing);
        assert!(report.resumed);
        assert_eq!(report.status.close_reason.as_deref(), Some(GATE_GONE_REASON));
        assert!(gc.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_repin_still_clears_marker() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        gc.tracker().open_gate("g1");
        hook(gc.tracker());
        gc.park("g1", None, false).await.unwrap();
        gc.tracker().close_gate("g1", "done");
        gc.tracker().fail_pin(true);

        let report = gc.resume().await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("re-pin gt-7"));
        assert!(!gc.park_path().exists());
    }

    #[tokio::test]
    async fn park_rejects_missing_or_closed_gates() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        assert!(matches!(gc.park("nope", None, false).await, Err(CoordError::GateNotFound(_))));
        gc.tracker().close_gate("g2", "done");
        assert!(matches!(gc.park("g2", None, false).await, Err(CoordError::GateClosed(_))));
        assert!(!gc.park_path().exists());
    }

    #[tokio::test]
    async fn waiter_failure_is_a_warning_and_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        gc.tracker().open_gate("g1");

        let dry = gc.park("g1", Some("note"), true).await.unwrap();
        assert!(dry.dry_run);
        assert!(!gc.park_path().exists());
        assert!(gc.tracker().waiters().is_empty());

        gc.tracker().fail_gate_wait(true);
        let report = gc.park("g1", Some("note"), false).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(gc.load().unwrap().unwrap().context.as_deref(), Some("note"));
    }

    #[tokio::test]
    async fn reparking_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let gc = coordinator(dir.path());
        gc.tracker().open_gate("g1");
        gc.tracker().open_gate("g2");
        gc.park("g1", Some("first"), false).await.unwrap();
        gc.park("g2", Some("second"), false).await.unwrap();
        let parked = gc.load().unwrap().unwrap();
        assert_eq!(parked.gate_id, "g2");
        assert_eq!(parked.context.as_deref(), Some("second"));
    }

    #[test]
    fn context_merge() {
        assert_eq!(merge_context(None, Some("  ")), None);
        assert_eq!(merge_context(Some("a"), Some("b")).as_deref(), Some("a\n---\nb"));
    }
}
