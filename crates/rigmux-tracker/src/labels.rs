//! `key:value` label helpers. The tracker only supports replacing the whole label
//! set, so every update is load, transform, replace.

use crate::WorkTracker;
use crate::error::TrackerError;

pub const IDLE_KEY: &str = "idle";
pub const LAST_ACTIVITY_KEY: &str = "last_activity";

pub fn get_label<'a>(labels: &'a [String], key: &str) -> Option<&'a str> {
    labels.iter().find_map(|label| match label.split_once(':') {
        Some((k, v)) if k == key => Some(v),
        _ => None,
    })
}

/// Replace every `key:*` entry with one `key:value`, keeping everything else in order.
pub fn set_label(labels: Vec<String>, key: &str, value: &str) -> Vec<String> {
    let mut out = remove_label(labels, key);
    out.push(format!("{key}:{value}"));
    out
}

pub fn remove_label(labels: Vec<String>, key: &str) -> Vec<String> {
    labels
        .into_iter()
        .filter(|label| label.split_once(':').is_none_or(|(k, _)| k != key))
        .collect()
}

/// Persisted idle counter; absent or unparsable reads as zero.
pub fn idle_cycles(labels: &[String]) -> u32 {
    get_label(labels, IDLE_KEY)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

pub fn with_idle_cycles(labels: Vec<String>, cycles: u32) -> Vec<String> {
    set_label(labels, IDLE_KEY, &cycles.to_string())
}

pub fn with_last_activity(labels: Vec<String>, at: &str) -> Vec<String> {
    set_label(labels, LAST_ACTIVITY_KEY, at)
}

/// Load the full label set of `issue_id`, apply `transform`, write the result back.
pub async fn update_labels<T, F>(tracker: &T, issue_id: &str, transform: F) -> Result<Vec<String>, TrackerError>
where
    T: WorkTracker,
    F: FnOnce(Vec<String>) -> Vec<String>,
{
    let current = tracker.labels(issue_id).await?;
    let next = transform(current);
    tracker.set_labels(issue_id, &next).await?;
    Ok(next)
}
