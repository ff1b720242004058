use anyhow::{Context, Result};
use rigmux_protocol::paths::messaging_config_path;
use rigmux_protocol::{AgentAddress, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Town-wide mail configuration from `<town>/config/messaging.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Named mailing lists, each expanding to direct addresses.
    pub lists: BTreeMap<String, Vec<String>>,
    pub queues: BTreeMap<String, QueueConfig>,
    pub channels: BTreeMap<String, ChannelConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Address patterns allowed to claim from the queue.
    pub workers: Vec<String>,
    /// Concurrent claims per claimant; 0 is unlimited.
    pub max_claims: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Address patterns allowed to read; empty means everyone.
    pub readers: Vec<String>,
    /// Unpinned messages kept after each delivery; 0 keeps everything.
    pub retain_count: usize,
}

impl MessagingConfig {
    /// Missing file means an empty configuration.
    pub fn load(town_root: &Path) -> Result<Self> {
        let path = messaging_config_path(town_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, town_root: &Path) -> Result<()> {
        let path = messaging_config_path(town_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Match an address against a worker/reader pattern.
///
/// Patterns: `*`, `<rig>/*`, `<rig>/polecats/*`, `<rig>/crew/*`, or an exact address
/// (compared after normalization).
pub fn matches_pattern(pattern: &str, address: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    let Ok(addr) = AgentAddress::parse(address) else {
        return pattern == address.trim();
    };
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return match prefix.split_once('/') {
            None => addr.rig() == Some(prefix),
            Some((rig, "polecats")) => {
                addr.rig() == Some(rig) && addr.role() == Role::EphemeralWorker
            }
            Some((rig, "crew")) => {
                addr.rig() == Some(rig) && addr.role() == Role::PersistentWorker
            }
            Some(_) => false,
        };
    }
    AgentAddress::parse(pattern).is_ok_and(|p| p == addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns() {
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("rig42/polecats/*", "rig42/nux"));
        assert!(matches_pattern("rig42/polecats/*", "rig42/polecats/nux"));
        assert!(!matches_pattern("rig42/polecats/*", "rig42/crew/max"));
        assert!(matches_pattern("rig42/crew/*", "rig42/crew/max"));
        assert!(matches_pattern("rig42/*", "rig42/witness"));
        assert!(!matches_pattern("rig42/*", "other/witness"));
        assert!(matches_pattern("mayor", "mayor/"));
        assert!(!matches_pattern("deacon/", "mayor/"));
    }

    #[test]
    fn load_missing_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(MessagingConfig::load(dir.path()).unwrap(), MessagingConfig::default());

        let mut cfg = MessagingConfig::default();
        cfg.lists.insert("oncall".into(), vec!["mayor/".into(), "rig42/witness".into()]);
        cfg.queues.insert(
            "work".into(),
            QueueConfig {
                workers: vec!["rig42/polecats/*".into()],
                max_claims: 1,
            },
        );
        cfg.save(dir.path()).unwrap();
        assert_eq!(MessagingConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn partial_file_defaults_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = messaging_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"channels":{"alerts":{"retain_count":5}}}"#).unwrap();
        let cfg = MessagingConfig::load(dir.path()).unwrap();
        assert!(cfg.lists.is_empty());
        assert_eq!(cfg.channels["alerts"].retain_count, 5);
        assert!(cfg.channels["alerts"].readers.is_empty());
    }
}
