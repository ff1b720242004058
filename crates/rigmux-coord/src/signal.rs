use chrono::{SecondsFormat, Utc};
use rigmux_protocol::{Advisory, AwaitOutcome, AwaitReason};
use rigmux_tracker::labels::{idle_cycles, with_idle_cycles, with_last_activity};
use rigmux_tracker::{ActivityFeed, FeedSubscription, TrackerError, WorkTracker, update_labels};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::CoordError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MULT: u32 = 2;

/// `min(base * mult^idle, cap)` when a backoff base is set, otherwise `flat`.
pub fn effective_timeout(
    flat: Duration,
    base: Option<Duration>,
    mult: u32,
    cap: Option<Duration>,
    idle: u32,
) -> Duration {
    let Some(base) = base else {
        return flat;
    };
    let mut timeout = base;
    for _ in 0..idle {
        timeout = timeout.saturating_mul(mult);
        if timeout == Duration::MAX || cap.is_some_and(|c| timeout >= c) {
            break;
        }
    }
    cap.map_or(timeout, |c| timeout.min(c))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwaitConfig {
    pub timeout: Duration,
    pub backoff_base: Option<Duration>,
    pub backoff_mult: u32,
    pub backoff_max: Option<Duration>,
    /// Tracker record holding this agent's `idle:<n>` label.
    pub agent_bead: Option<String>,
}

impl Default for AwaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backoff_base: None,
            backoff_mult: DEFAULT_BACKOFF_MULT,
            backoff_max: None,
            agent_bead: None,
        }
    }
}

impl AwaitConfig {
    pub fn effective_timeout(&self, idle: u32) -> Duration {
        effective_timeout(self.timeout, self.backoff_base, self.backoff_mult, self.backoff_max, idle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwaitReport {
    #[serde(flatten)]
    pub outcome: AwaitOutcome,
    pub timeout_ms: u64,
    pub warnings: Vec<String>,
}

/// Blocks until the activity feed emits a line or the backed-off deadline passes.
pub struct SignalWaiter<T, F> {
    tracker: T,
    feed: F,
}

impl<T: WorkTracker, F: ActivityFeed> SignalWaiter<T, F> {
    pub fn new(tracker: T, feed: F) -> Self {
        Self { tracker, feed }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub async fn await_signal(&self, cfg: &AwaitConfig) -> Result<AwaitReport, CoordError> {
        let mut warnings = Vec::new();
        let idle = match &cfg.agent_bead {
            Some(bead) => match self.tracker.labels(bead).await {
                Ok(labels) => idle_cycles(&labels),
                Err(e) => {
                    warnings.extend(Advisory::failed(format!("read idle count of {bead}"), e).log());
                    0
                }
            },
            None => 0,
        };
        let timeout = cfg.effective_timeout(idle);
        debug!(timeout_ms = timeout.as_millis() as u64, idle, "awaiting signal");

        let started = Instant::now();
        let event = self.wait_for_event(timeout).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (reason, idle_cycles) = match (&event, &cfg.agent_bead) {
            (Some(_), Some(bead)) => {
                let at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                let beat = update_labels(&self.tracker, bead, |l| with_last_activity(l, &at)).await;
                warnings.extend(Advisory::from_result(format!("heartbeat {bead}"), beat).log());
                (AwaitReason::Signal, idle)
            }
            (Some(_), None) => (AwaitReason::Signal, idle),
            (None, Some(bead)) => {
                let next = idle.saturating_add(1);
                let bumped = update_labels(&self.tracker, bead, |l| with_idle_cycles(l, next)).await;
                let advisory = Advisory::from_result(format!("update idle count of {bead}"), bumped);
                let cycles = if advisory.is_ok() { next } else { idle };
                warnings.extend(advisory.log());
                (AwaitReason::Timeout, cycles)
            }
            (None, None) => (AwaitReason::Timeout, idle),
        };

        info!(reason = ?reason, elapsed_ms, idle_cycles, "await finished");
        Ok(AwaitReport {
            outcome: AwaitOutcome {
                reason,
                elapsed_ms,
                signal: event,
                idle_cycles,
            },
            timeout_ms: timeout.as_millis() as u64,
            warnings,
        })
    }

    /// Race first line, feed error and deadline. The subscription is closed
    /// whichever wins.
    async fn wait_for_event(&self, timeout: Duration) -> Result<Option<String>, CoordError> {
        let mut sub = self.feed.subscribe().await?;
        let result = tokio::select! {
            r = first_event(&mut sub) => r.map(Some),
            () = tokio::time::sleep(timeout) => Ok(None),
        };
        sub.close().await;
        Ok(result?)
    }

    /// Put the idle counter back to zero after acting on a signal.
    pub async fn reset_idle(&self, agent_bead: &str) -> Result<(), CoordError> {
        update_labels(&self.tracker, agent_bead, |l| with_idle_cycles(l, 0)).await?;
        info!(bead = agent_bead, "idle counter reset");
        Ok(())
    }
}

/// A feed that ends cleanly never signals; the deadline decides.
async fn first_event<S: FeedSubscription>(sub: &mut S) -> Result<String, TrackerError> {
    match sub.next_event().await? {
        Some(line) => Ok(line),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigmux_tracker::labels::{LAST_ACTIVITY_KEY, get_label};
    use rigmux_tracker::memory::{FeedScript, MemoryTracker, ScriptedFeed};

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn flat_timeout_without_backoff() {
        assert_eq!(effective_timeout(60 * SEC, None, 2, None, 7), 60 * SEC);
    }

    #[test]
    fn backoff_grows_with_idle_cycles() {
        assert_eq!(effective_timeout(60 * SEC, Some(30 * SEC), 2, None, 0), 30 * SEC);
        assert_eq!(effective_timeout(60 * SEC, Some(30 * SEC), 2, None, 2), 120 * SEC);
    }

    #[test]
    fn backoff_is_clamped_to_cap() {
        assert_eq!(
            effective_timeout(60 * SEC, Some(30 * SEC), 2, Some(300 * SEC), 10),
            300 * SEC
        );
        assert_eq!(
            effective_timeout(SEC, Some(SEC), 10, Some(300 * SEC), u32::MAX),
            300 * SEC
        );
    }

    fn waiter(script: FeedScript) -> SignalWaiter<MemoryTracker, ScriptedFeed> {
        let tracker = MemoryTracker::default();
        tracker.put_labels("ag-w", &["role:witness", "idle:2"]);
        SignalWaiter::new(tracker, ScriptedFeed::new(script))
    }

    fn cfg(bead: Option<&str>) -> AwaitConfig {
        AwaitConfig {
            timeout: Duration::from_millis(50),
            agent_bead: bead.map(str::to_string),
            ..AwaitConfig::default()
        }
    }

    #[tokio::test]
    async fn signal_updates_heartbeat_not_idle() {
        let w = waiter(FeedScript::Event("gt-1 created".into(), Duration::from_millis(5)));
        let mut c = cfg(Some("ag-w"));
        c.timeout = 5 * SEC;
        let report = w.await_signal(&c).await.unwrap();
        assert_eq!(report.outcome.reason, AwaitReason::Signal);
        assert_eq!(report.outcome.signal.as_deref(), Some("gt-1 created"));
        assert_eq!(report.outcome.idle_cycles, 2);

        let labels = w.tracker().labels("ag-w").await.unwrap();
        assert_eq!(idle_cycles(&labels), 2);
        assert!(get_label(&labels, LAST_ACTIVITY_KEY).is_some());
        assert_eq!(w.feed().counts(), (1, 1));
    }

    #[tokio::test]
    async fn timeout_increments_idle_and_keeps_other_labels() {
        let w = waiter(FeedScript::Silent);
        let mut c = cfg(Some("ag-w"));
        c.backoff_base = Some(Duration::from_millis(5));
        let report = w.await_signal(&c).await.unwrap();
        assert_eq!(report.outcome.reason, AwaitReason::Timeout);
        assert_eq!(report.timeout_ms, 20);
        assert_eq!(report.outcome.idle_cycles, 3);
        assert_eq!(
            w.tracker().labels("ag-w").await.unwrap(),
            vec!["role:witness".to_string(), "idle:3".to_string()]
        );
        assert_eq!(w.feed().counts(), (1, 1));
    }

    #[tokio::test]
    async fn ended_feed_waits_out_the_deadline() {
        let w = waiter(FeedScript::End);
        let report = w.await_signal(&cfg(None)).await.unwrap();
        assert_eq!(report.outcome.reason, AwaitReason::Timeout);
        assert!(report.outcome.elapsed_ms >= 50);
        assert_eq!(report.outcome.idle_cycles, 0);
    }

    #[tokio::test]
    async fn feed_error_propagates_and_closes() {
        let w = waiter(FeedScript::Fail);
        let err = w.await_signal(&cfg(Some("ag-w"))).await.unwrap_err();
        assert!(matches!(err, CoordError::Tracker(_)));
        assert_eq!(w.feed().counts(), (1, 1));
        assert_eq!(idle_cycles(&w.tracker().labels("ag-w").await.unwrap()), 2);
    }

    #[tokio::test]
    async fn unknown_bead_is_only_a_warning() {
        let w = waiter(FeedScript::Silent);
        let report = w.await_signal(&cfg(Some("ag-missing"))).await.unwrap();
        assert_eq!(report.outcome.reason, AwaitReason::Timeout);
        assert_eq!(report.outcome.idle_cycles, 0);
        assert_eq!(report.warnings.len(), 2);
    }

    #[tokio::test]
    async fn reset_idle_zeroes_counter() {
        let w = waiter(FeedScript::Silent);
        w.reset_idle("ag-w").await.unwrap();
        assert_eq!(
            w.tracker().labels("ag-w").await.unwrap(),
            vec!["role:witness".to_string(), "idle:0".to_string()]
        );
    }
}
