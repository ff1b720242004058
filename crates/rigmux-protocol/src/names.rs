use crate::AgentAddress;

/// Prefix for town-level sessions.
pub const HQ_PREFIX: &str = "hq";

/// Default prefix for rig-level sessions.
pub const DEFAULT_PREFIX: &str = "rm";

/// Multiplexer session name for an agent address.
pub fn session_name(address: &AgentAddress, prefix: &str) -> String {
    match address {
        AgentAddress::Coordinator => format!("{HQ_PREFIX}-mayor"),
        AgentAddress::Supervisor => format!("{HQ_PREFIX}-deacon"),
        AgentAddress::Witness { rig } => format!("{prefix}-{rig}-witness"),
        AgentAddress::Refinery { rig } => format!("{prefix}-{rig}-refinery"),
        AgentAddress::PersistentWorker { rig, name } => format!("{prefix}-{rig}-crew-{name}"),
        AgentAddress::EphemeralWorker { rig, name } => format!("{prefix}-{rig}-{name}"),
    }
}

/// Recover the agent address from a session name.
///
/// Rig names may contain hyphens. When `known_rigs` lists the rig, the split point is
/// exact; otherwise role suffixes and the `-crew-` marker decide, and ephemeral workers
/// fall back to splitting at the first hyphen.
pub fn parse_session_name(name: &str, prefix: &str, known_rigs: &[String]) -> Option<AgentAddress> {
    if let Some(rest) = name.strip_prefix(HQ_PREFIX).and_then(|r| r.strip_prefix('-')) {
        match rest {
            "mayor" => return Some(AgentAddress::Coordinator),
            "deacon" => return Some(AgentAddress::Supervisor),
            _ => {}
        }
    }
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    if rest.is_empty() {
        return None;
    }

    let mut rigs: Vec<&String> = known_rigs.iter().collect();
    rigs.sort_by_key(|r| std::cmp::Reverse(r.len()));
    for rig in rigs {
        if let Some(tail) = rest.strip_prefix(rig.as_str()).and_then(|t| t.strip_prefix('-')) {
            return address_from_tail(rig, tail);
        }
    }

    if let Some(rig) = rest.strip_suffix("-witness") {
        return AgentAddress::parse(&format!("{rig}/witness")).ok();
    }
    if let Some(rig) = rest.strip_suffix("-refinery") {
        return AgentAddress::parse(&format!("{rig}/refinery")).ok();
    }
    if let Some((rig, worker)) = rest.split_once("-crew-") {
        return AgentAddress::new(crate::Role::PersistentWorker, Some(rig), Some(worker)).ok();
    }
    let (rig, worker) = rest.split_once('-')?;
    AgentAddress::new(crate::Role::EphemeralWorker, Some(rig), Some(worker)).ok()
}

fn address_from_tail(rig: &str, tail: &str) -> Option<AgentAddress> {
    use crate::Role;
    match tail {
        "" => None,
        "witness" => AgentAddress::new(Role::Witness, Some(rig), None).ok(),
        "refinery" => AgentAddress::new(Role::Refinery, Some(rig), None).ok(),
        _ => match tail.strip_prefix("crew-") {
            Some(worker) => AgentAddress::new(Role::PersistentWorker, Some(rig), Some(worker)).ok(),
            None => AgentAddress::new(Role::EphemeralWorker, Some(rig), Some(tail)).ok(),
        },
    }
}
