use std::path::{Component, Path, PathBuf};

use rigmux_protocol::paths::{TOWN_MARKER, TOWN_MARKER_DIR, rig_config_path};
use rigmux_protocol::{AgentAddress, Role};
use serde::Deserialize;
use tracing::debug;

const TOWN_LEVEL_DIRS: [&str; 3] = ["mayor", "deacon", "config"];
const RIG_MARKERS: [&str; 4] = ["witness", "refinery", "crew", "polecats"];

/// Walk up from `start` looking for the town root.
///
/// `mayor/town.json` is the primary marker and a bare `mayor/` directory the secondary
/// one. Worker clones (`polecats/`, `crew/`) may carry their own copy of the town
/// layout, so from inside one the walk continues to the outermost primary match.
pub fn find_town_root(start: &Path) -> Option<PathBuf> {
    let in_worker_clone = start.components().any(|c| {
        matches!(c, Component::Normal(name) if name == "polecats" || name == "crew")
    });

    let mut primary: Option<PathBuf> = None;
    let mut secondary: Option<PathBuf> = None;
    for dir in start.ancestors() {
        if dir.join(TOWN_MARKER).is_file() {
            primary = Some(dir.to_path_buf());
            if !in_worker_clone {
                break;
            }
        } else if secondary.is_none() && dir.join(TOWN_MARKER_DIR).is_dir() {
            secondary = Some(dir.to_path_buf());
        }
    }
    primary.or(secondary)
}

/// Role information implied by a directory inside the town.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CwdRole {
    pub role: Option<Role>,
    pub rig: Option<String>,
    pub worker: Option<String>,
}

/// Detect the role from `cwd`'s position relative to `town_root`.
pub fn detect_cwd_role(town_root: &Path, cwd: &Path) -> CwdRole {
    let Ok(rel) = cwd.strip_prefix(town_root) else {
        return CwdRole::default();
    };
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();

    let known = |role, rig: Option<&str>, worker: Option<&str>| CwdRole {
        role: Some(role),
        rig: rig.map(str::to_string),
        worker: worker.map(str::to_string),
    };

    match parts.as_slice() {
        [] | ["mayor", ..] => known(Role::Coordinator, None, None),
        ["deacon", ..] => known(Role::Supervisor, None, None),
        [first, ..] if first.starts_with('.') || TOWN_LEVEL_DIRS.contains(first) => {
            CwdRole::default()
        }
        [_, "mayor", ..] => known(Role::Coordinator, None, None),
        [rig, "witness", ..] => known(Role::Witness, Some(*rig), None),
        [rig, "refinery", ..] => known(Role::Refinery, Some(*rig), None),
        [rig, "polecats", name, ..] => known(Role::EphemeralWorker, Some(*rig), Some(*name)),
        [rig, "crew", name, ..] => known(Role::PersistentWorker, Some(*rig), Some(*name)),
        [rig, ..] => CwdRole {
            role: None,
            rig: Some(rig.to_string()),
            worker: None,
        },
    }
}

/// Rig directories directly under the town root, sorted by name.
pub fn discover_rigs(town_root: &Path) -> std::io::Result<Vec<String>> {
    let mut rigs = Vec::new();
    for entry in std::fs::read_dir(town_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || TOWN_LEVEL_DIRS.contains(&name.as_str()) {
            continue;
        }
        if RIG_MARKERS.iter().any(|m| entry.path().join(m).is_dir()) {
            rigs.push(name);
        }
    }
    rigs.sort();
    Ok(rigs)
}

/// Every agent the town layout implies, town-level agents first.
pub fn discover_agents(town_root: &Path) -> std::io::Result<Vec<AgentAddress>> {
    let mut agents = vec![AgentAddress::Coordinator, AgentAddress::Supervisor];
    for rig in discover_rigs(town_root)? {
        let rig_dir = town_root.join(&rig);
        if rig_dir.join("witness").is_dir() {
            agents.push(AgentAddress::Witness { rig: rig.clone() });
        }
        if rig_dir.join("refinery").is_dir() {
            agents.push(AgentAddress::Refinery { rig: rig.clone() });
        }
        for name in subdirs(&rig_dir.join("crew"))? {
            agents.push(AgentAddress::PersistentWorker {
                rig: rig.clone(),
                name,
            });
        }
        for name in subdirs(&rig_dir.join("polecats"))? {
            agents.push(AgentAddress::EphemeralWorker {
                rig: rig.clone(),
                name,
            });
        }
    }
    Ok(agents)
}

fn subdirs(dir: &Path) -> std::io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Deserialize)]
struct RigConfig {
    #[serde(default)]
    default_branch: Option<String>,
}

/// Configured default branch of a rig, if its `config.json` names one.
pub fn rig_default_branch(town_root: &Path, rig: &str) -> Option<String> {
    let path = rig_config_path(town_root, rig);
    let data = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<RigConfig>(&data) {
        Ok(cfg) => cfg.default_branch.filter(|b| !b.trim().is_empty()),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "ignoring unreadable rig config");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Town with one rig `rig42` holding a witness, a refinery, crew `alice` and polecat `nux`.
    pub(crate) fn make_town() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("mayor")).unwrap();
        std::fs::write(root.join(TOWN_MARKER), "{}").unwrap();
        std::fs::create_dir_all(root.join("deacon")).unwrap();
        std::fs::create_dir_all(root.join("config")).unwrap();
        std::fs::create_dir_all(root.join("rig42/witness")).unwrap();
        std::fs::create_dir_all(root.join("rig42/refinery/rig")).unwrap();
        std::fs::create_dir_all(root.join("rig42/crew/alice/src")).unwrap();
        std::fs::create_dir_all(root.join("rig42/polecats/nux")).unwrap();
        dir
    }

    #[test]
    fn finds_root_from_nested_dir() {
        let town = make_town();
        let start = town.path().join("rig42/crew/alice/src");
        assert_eq!(find_town_root(&start), Some(town.path().to_path_buf()));
    }

    #[test]
    fn worker_clone_uses_outermost_marker() {
        let town = make_town();
        let clone = town.path().join("rig42/crew/alice");
        std::fs::create_dir_all(clone.join("mayor")).unwrap();
        std::fs::write(clone.join(TOWN_MARKER), "{}").unwrap();
        assert_eq!(find_town_root(&clone), Some(town.path().to_path_buf()));
    }

    #[test]
    fn secondary_marker_when_no_town_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mayor")).unwrap();
        std::fs::create_dir_all(dir.path().join("r/witness")).unwrap();
        let found = find_town_root(&dir.path().join("r/witness"));
        assert_eq!(found, Some(dir.path().to_path_buf()));
    }

    #[test]
    fn outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_town_root(dir.path()), None);
    }

    #[test]
    fn detects_roles_by_location() {
        let root = Path::new("/town");
        let role = |p: &str| detect_cwd_role(root, &root.join(p)).role;
        assert_eq!(role(""), Some(Role::Coordinator));
        assert_eq!(role("mayor/notes"), Some(Role::Coordinator));
        assert_eq!(role("deacon"), Some(Role::Supervisor));
        assert_eq!(role("rig42/mayor/rig"), Some(Role::Coordinator));
        assert_eq!(role("rig42/witness"), Some(Role::Witness));
        assert_eq!(role("rig42/refinery/rig"), Some(Role::Refinery));
        assert_eq!(role("rig42/polecats/nux"), Some(Role::EphemeralWorker));
        assert_eq!(role("rig42/crew/alice/src"), Some(Role::PersistentWorker));
        assert_eq!(role("rig42/docs"), None);
        assert_eq!(role(".mail/x"), None);
    }

    #[test]
    fn unknown_location_keeps_rig() {
        let root = Path::new("/town");
        let cwd = detect_cwd_role(root, &root.join("rig42/docs"));
        assert_eq!(cwd.rig.as_deref(), Some("rig42"));
        assert_eq!(detect_cwd_role(root, Path::new("/elsewhere")), CwdRole::default());
    }

    #[test]
    fn discovers_agents_from_layout() {
        let town = make_town();
        let agents: Vec<String> = discover_agents(town.path())
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            agents,
            vec![
                "mayor/",
                "deacon/",
                "rig42/witness",
                "rig42/refinery",
                "rig42/crew/alice",
                "rig42/nux"
            ]
        );
    }

    #[test]
    fn rig_branch_from_config() {
        let town = make_town();
        assert_eq!(rig_default_branch(town.path(), "rig42"), None);
        std::fs::write(
            town.path().join("rig42/config.json"),
            r#"{"default_branch":"develop"}"#,
        )
        .unwrap();
        assert_eq!(
            rig_default_branch(town.path(), "rig42").as_deref(),
            Some("develop")
        );
    }
}
