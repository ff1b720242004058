use rigmux_identity::discover_agents;
use rigmux_protocol::{AddressError, AgentAddress, Role};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::messaging::MessagingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    /// One mailbox per recipient; each gets its own copy.
    Direct,
    /// One shared copy; at most one consumer claims it.
    Queue,
    /// One shared copy read by every subscriber.
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub address: String,
}

impl Recipient {
    pub fn direct(address: impl Into<String>) -> Self {
        Self {
            kind: RecipientKind::Direct,
            address: address.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown mailing list: {0}")]
    UnknownList(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("invalid group: {0}")]
    InvalidGroup(String),
    #[error("group {0} has no members")]
    EmptyGroup(String),
    #[error("mailing list {0} has no valid members")]
    EmptyList(String),
    #[error("group {0} needs a town root")]
    NoTownRoot(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("failed to scan town: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a logical `to` into concrete delivery targets.
pub struct AddressResolver<'a> {
    town_root: Option<&'a Path>,
    config: &'a MessagingConfig,
}

impl<'a> AddressResolver<'a> {
    pub fn new(town_root: Option<&'a Path>, config: &'a MessagingConfig) -> Self {
        Self { town_root, config }
    }

    pub fn resolve(&self, to: &str) -> Result<Vec<Recipient>, ResolveError> {
        let to = to.trim();
        if let Some(name) = to.strip_prefix("list:") {
            let members = self
                .config
                .lists
                .get(name)
                .ok_or_else(|| ResolveError::UnknownList(name.to_string()))?;
            let recipients: Vec<Recipient> = members
                .iter()
                .filter_map(|m| match normalize(m) {
                    Ok(address) => Some(Recipient::direct(address)),
                    Err(e) => {
                        warn!(list = name, member = %m, error = %e, "skipping invalid list member");
                        None
                    }
                })
                .collect();
            if recipients.is_empty() {
                return Err(ResolveError::EmptyList(name.to_string()));
            }
            return Ok(recipients);
        }
        if let Some(name) = to.strip_prefix("queue:") {
            if !self.config.queues.contains_key(name) {
                return Err(ResolveError::UnknownQueue(name.to_string()));
            }
            return Ok(vec![Recipient {
                kind: RecipientKind::Queue,
                address: format!("queue:{name}"),
            }]);
        }
        if let Some(name) = to
            .strip_prefix("channel:")
            .or_else(|| to.strip_prefix("announce:"))
        {
            if !self.config.channels.contains_key(name) {
                return Err(ResolveError::UnknownChannel(name.to_string()));
            }
            return Ok(vec![Recipient {
                kind: RecipientKind::Channel,
                address: format!("channel:{name}"),
            }]);
        }
        if let Some(group) = to.strip_prefix('@') {
            return self.resolve_group(group);
        }
        Ok(vec![Recipient::direct(normalize(to)?)])
    }

    fn resolve_group(&self, group: &str) -> Result<Vec<Recipient>, ResolveError> {
        let filter = GroupFilter::parse(group)?;
        let root = self
            .town_root
            .ok_or_else(|| ResolveError::NoTownRoot(format!("@{group}")))?;
        let members: Vec<Recipient> = discover_agents(root)?
            .into_iter()
            .filter(|a| filter.admits(a))
            .map(|a| Recipient::direct(a.to_string()))
            .collect();
        if members.is_empty() {
            return Err(ResolveError::EmptyGroup(format!("@{group}")));
        }
        Ok(members)
    }
}

/// Canonical form of a direct address.
pub fn normalize(address: &str) -> Result<String, ResolveError> {
    Ok(AgentAddress::parse(address)?.to_string())
}

#[derive(Debug, PartialEq, Eq)]
struct GroupFilter<'g> {
    role: Option<Role>,
    rig: Option<&'g str>,
}

impl<'g> GroupFilter<'g> {
    fn parse(group: &'g str) -> Result<Self, ResolveError> {
        let (head, rig) = match group.split_once('/') {
            Some((head, rig)) if !rig.is_empty() && !rig.contains('/') => (head, Some(rig)),
            Some(_) => return Err(ResolveError::InvalidGroup(format!("@{group}"))),
            None => (group, None),
        };
        let role = match (head, rig) {
            ("town", None) => None,
            ("witnesses", None) => Some(Role::Witness),
            ("refineries", None) => Some(Role::Refinery),
            ("crew", _) => Some(Role::PersistentWorker),
            ("polecats", _) => Some(Role::EphemeralWorker),
            ("rig", Some(_)) => None,
            _ => return Err(ResolveError::InvalidGroup(format!("@{group}"))),
        };
        Ok(Self { role, rig })
    }

    fn admits(&self, addr: &AgentAddress) -> bool {
        self.role.is_none_or(|r| addr.role() == r) && self.rig.is_none_or(|r| addr.rig() == Some(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ChannelConfig, QueueConfig};

    fn town() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for p in [
            "mayor",
            "rig42/witness",
            "rig42/refinery/rig",
            "rig42/crew/max",
            "rig42/crew/alice",
            "rig42/polecats/nux",
            "other/witness",
            "other/polecats/toast",
        ] {
            std::fs::create_dir_all(dir.path().join(p)).unwrap();
        }
        dir
    }

    fn config() -> MessagingConfig {
        let mut cfg = MessagingConfig::default();
        cfg.lists
            .insert("leads".into(), vec!["mayor".into(), "rig42/polecats/nux".into()]);
        cfg.lists
            .insert("mixed".into(), vec!["a/b/c/d".into(), "rig42/witness".into(), "../x".into()]);
        cfg.lists.insert("broken".into(), vec!["a/b/c/d".into()]);
        cfg.queues.insert("work".into(), QueueConfig::default());
        cfg.channels.insert("alerts".into(), ChannelConfig::default());
        cfg
    }

    fn addrs(rs: Vec<Recipient>) -> Vec<String> {
        rs.into_iter().map(|r| r.address).collect()
    }

    #[test]
    fn direct_is_normalized() {
        let cfg = config();
        let r = AddressResolver::new(None, &cfg);
        assert_eq!(addrs(r.resolve("mayor").unwrap()), ["mayor/"]);
        assert_eq!(addrs(r.resolve("rig42/polecats/nux").unwrap()), ["rig42/nux"]);
        assert!(matches!(r.resolve("a/b/c/d"), Err(ResolveError::Address(_))));
    }

    #[test]
    fn lists_queues_channels() {
        let cfg = config();
        let r = AddressResolver::new(None, &cfg);
        assert_eq!(addrs(r.resolve("list:leads").unwrap()), ["mayor/", "rig42/nux"]);
        let q = r.resolve("queue:work").unwrap();
        assert_eq!(q[0].kind, RecipientKind::Queue);
        assert_eq!(q[0].address, "queue:work");
        let c = r.resolve("announce:alerts").unwrap();
        assert_eq!(c[0].kind, RecipientKind::Channel);
        assert_eq!(c[0].address, "channel:alerts");
        assert!(matches!(r.resolve("list:nope"), Err(ResolveError::UnknownList(_))));
        assert_eq!(addrs(r.resolve("list:mixed").unwrap()), ["rig42/witness"]);
        assert!(matches!(r.resolve("list:broken"), Err(ResolveError::EmptyList(_))));
        assert!(matches!(r.resolve("queue:nope"), Err(ResolveError::UnknownQueue(_))));
        assert!(matches!(r.resolve("channel:nope"), Err(ResolveError::UnknownChannel(_))));
    }

    #[test]
    fn groups_expand_from_layout() {
        let dir = town();
        let cfg = config();
        let r = AddressResolver::new(Some(dir.path()), &cfg);
        assert_eq!(addrs(r.resolve("@witnesses").unwrap()), ["other/witness", "rig42/witness"]);
        assert_eq!(addrs(r.resolve("@crew/rig42").unwrap()), ["rig42/crew/alice", "rig42/crew/max"]);
        assert_eq!(addrs(r.resolve("@polecats").unwrap()), ["other/toast", "rig42/nux"]);
        assert_eq!(r.resolve("@rig/rig42").unwrap().len(), 5);
        assert_eq!(r.resolve("@town").unwrap().len(), 9);
        assert!(matches!(r.resolve("@bogus"), Err(ResolveError::InvalidGroup(_))));
        assert!(matches!(r.resolve("@crew/other"), Err(ResolveError::EmptyGroup(_))));
    }

    #[test]
    fn groups_need_a_town() {
        let cfg = config();
        let r = AddressResolver::new(None, &cfg);
        assert!(matches!(r.resolve("@town"), Err(ResolveError::NoTownRoot(_))));
    }
}
