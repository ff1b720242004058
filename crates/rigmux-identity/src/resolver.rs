use std::path::{Path, PathBuf};

use rigmux_protocol::{AddressError, AgentAddress, Role, env};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::IdentityError;
use crate::workspace::{CwdRole, detect_cwd_role, find_town_root};

/// The identity-related environment variables, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    pub role: Option<String>,
    pub rig: Option<String>,
    pub worker: Option<String>,
    pub town_root: Option<PathBuf>,
}

impl EnvSnapshot {
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            role: var(env::ROLE),
            rig: var(env::RIG),
            worker: var(env::WORKER),
            town_root: var(env::TOWN_ROOT).map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Env,
    Cwd,
}

/// Who the calling agent is. Computed fresh on every invocation, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentIdentity {
    pub role: Role,
    pub rig: Option<String>,
    pub worker: Option<String>,
    pub source: IdentitySource,
    pub home_dir: Option<PathBuf>,
    pub address: AgentAddress,
    pub env_role: Option<String>,
    pub cwd_role: Option<Role>,
    /// The environment and the directory name different roles; the environment won.
    pub mismatch: bool,
    /// The environment named a role but rig or worker came from the directory.
    pub env_incomplete: bool,
    pub town_root: Option<PathBuf>,
    pub work_dir: PathBuf,
}

/// Resolves agent identity from environment variables and the working directory.
///
/// An explicit role variable is authoritative. Gaps in it are filled from directory
/// detection and flagged; disagreement is flagged as a mismatch but never blocks.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    env: EnvSnapshot,
}

impl IdentityResolver {
    pub fn new(env: EnvSnapshot) -> Self {
        Self { env }
    }

    pub fn from_process() -> Self {
        Self::new(EnvSnapshot::from_process())
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    /// Town root for `cwd`, falling back to the workspace-root variable.
    pub fn town_root(&self, cwd: &Path) -> Result<PathBuf, IdentityError> {
        find_town_root(cwd)
            .or_else(|| self.env.town_root.clone())
            .ok_or_else(|| IdentityError::NotInWorkspace(cwd.to_path_buf()))
    }

    pub fn resolve(&self, cwd: &Path) -> Result<AgentIdentity, IdentityError> {
        let town_root = self.town_root(cwd).ok();
        let cwd_info = town_root
            .as_deref()
            .map(|root| detect_cwd_role(root, cwd))
            .unwrap_or_default();

        match &self.env.role {
            Some(value) => self.resolve_from_env(value, cwd, town_root, cwd_info),
            None => resolve_from_cwd(cwd, town_root, cwd_info),
        }
    }

    fn resolve_from_env(
        &self,
        value: &str,
        cwd: &Path,
        town_root: Option<PathBuf>,
        cwd_info: CwdRole,
    ) -> Result<AgentIdentity, IdentityError> {
        let (role, rig, worker) = parse_role_value(value)?;
        let mut rig = rig.or_else(|| self.env.rig.clone());
        let mut worker = worker.or_else(|| self.env.worker.clone());

        let mut env_incomplete = false;
        if role.needs_rig() && rig.is_none() {
            rig = cwd_info.rig.clone();
            env_incomplete = true;
        }
        if role.needs_worker() && worker.is_none() {
            worker = cwd_info.worker.clone();
            env_incomplete = true;
        }

        let address = AgentAddress::new(role, rig.as_deref(), worker.as_deref())
            .map_err(|err| incomplete(role, err))?;
        let mismatch = cwd_info.role.is_some_and(|r| r != role);
        if mismatch {
            warn!(
                env_role = %role,
                cwd_role = ?cwd_info.role,
                "role from environment disagrees with working directory"
            );
        }
        if env_incomplete {
            debug!(address = %address, "filled identity gaps from working directory");
        }

        Ok(build_identity(
            address,
            IdentitySource::Env,
            Some(value.to_string()),
            cwd_info.role,
            mismatch,
            env_incomplete,
            town_root,
            cwd,
        ))
    }
}

fn resolve_from_cwd(
    cwd: &Path,
    town_root: Option<PathBuf>,
    cwd_info: CwdRole,
) -> Result<AgentIdentity, IdentityError> {
    if town_root.is_none() {
        return Err(IdentityError::NotInWorkspace(cwd.to_path_buf()));
    }
    let role = cwd_info
        .role
        .ok_or_else(|| IdentityError::UnknownLocation(cwd.to_path_buf()))?;
    let address = AgentAddress::new(role, cwd_info.rig.as_deref(), cwd_info.worker.as_deref())
        .map_err(|err| incomplete(role, err))?;
    Ok(build_identity(
        address,
        IdentitySource::Cwd,
        None,
        Some(role),
        false,
        false,
        town_root,
        cwd,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_identity(
    address: AgentAddress,
    source: IdentitySource,
    env_role: Option<String>,
    cwd_role: Option<Role>,
    mismatch: bool,
    env_incomplete: bool,
    town_root: Option<PathBuf>,
    cwd: &Path,
) -> AgentIdentity {
    let role = address.role();
    let rig = address.rig().map(str::to_string);
    let worker = address.worker().map(str::to_string);
    let home = town_root
        .as_deref()
        .and_then(|root| home_dir(root, role, rig.as_deref(), worker.as_deref()));
    AgentIdentity {
        role,
        rig,
        worker,
        source,
        home_dir: home,
        address,
        env_role,
        cwd_role,
        mismatch,
        env_incomplete,
        town_root,
        work_dir: cwd.to_path_buf(),
    }
}

fn incomplete(role: Role, err: AddressError) -> IdentityError {
    match err {
        AddressError::MissingRig(_) => IdentityError::Incomplete {
            role,
            missing: "rig",
        },
        AddressError::MissingWorker(_) => IdentityError::Incomplete {
            role,
            missing: "worker",
        },
        other => IdentityError::Address(other),
    }
}

/// Parse a role variable: a bare role (`crew`), a rig-qualified role (`rig42/crew`)
/// or a full address (`rig42/crew/alice`).
pub fn parse_role_value(
    value: &str,
) -> Result<(Role, Option<String>, Option<String>), IdentityError> {
    let value = value.trim();
    if let Ok(role) = value.parse::<Role>() {
        return Ok((role, None, None));
    }
    if let Ok(addr) = AgentAddress::parse(value) {
        return Ok((
            addr.role(),
            addr.rig().map(str::to_string),
            addr.worker().map(str::to_string),
        ));
    }
    if let Some((rig, role)) = value.split_once('/') {
        if let (false, Ok(role)) = (rig.is_empty(), role.parse::<Role>()) {
            return Ok((role, Some(rig.to_string()), None));
        }
    }
    Err(IdentityError::InvalidRole {
        value: value.to_string(),
        source: AddressError::Invalid(value.to_string()),
    })
}

/// Canonical home directory for (role, rig, worker); `None` when a required
/// qualifier is missing.
pub fn home_dir(
    town_root: &Path,
    role: Role,
    rig: Option<&str>,
    worker: Option<&str>,
) -> Option<PathBuf> {
    let rig = rig.filter(|r| !r.is_empty());
    let worker = worker.filter(|w| !w.is_empty());
    match role {
        Role::Coordinator => Some(town_root.join("mayor")),
        Role::Supervisor => Some(town_root.join("deacon")),
        Role::Witness => Some(town_root.join(rig?).join("witness")),
        Role::Refinery => Some(town_root.join(rig?).join("refinery").join("rig")),
        Role::EphemeralWorker => Some(town_root.join(rig?).join("polecats").join(worker?)),
        Role::PersistentWorker => Some(town_root.join(rig?).join("crew").join(worker?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::tests::make_town;

    fn env_role(role: &str) -> EnvSnapshot {
        EnvSnapshot {
            role: Some(role.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn env_role_gaps_filled_from_cwd() {
        let town = make_town();
        let cwd = town.path().join("rig42/crew/alice");
        let id = IdentityResolver::new(env_role("crew")).resolve(&cwd).unwrap();
        assert_eq!(id.role, Role::PersistentWorker);
        assert_eq!(id.rig.as_deref(), Some("rig42"));
        assert_eq!(id.worker.as_deref(), Some("alice"));
        assert!(id.env_incomplete);
        assert!(!id.mismatch);
        assert_eq!(id.source, IdentitySource::Env);
        assert_eq!(id.address.to_string(), "rig42/crew/alice");
        assert_eq!(id.home_dir, Some(town.path().join("rig42/crew/alice")));
    }

    #[test]
    fn env_wins_on_mismatch() {
        let town = make_town();
        let cwd = town.path().join("rig42/witness");
        let env = EnvSnapshot {
            role: Some("rig42/crew/alice".into()),
            ..Default::default()
        };
        let id = IdentityResolver::new(env).resolve(&cwd).unwrap();
        assert_eq!(id.role, Role::PersistentWorker);
        assert!(id.mismatch);
        assert!(!id.env_incomplete);
        assert_eq!(id.cwd_role, Some(Role::Witness));
    }

    #[test]
    fn env_rig_and_worker_vars() {
        let town = make_town();
        let env = EnvSnapshot {
            role: Some("polecat".into()),
            rig: Some("rig42".into()),
            worker: Some("nux".into()),
            town_root: None,
        };
        let id = IdentityResolver::new(env).resolve(town.path()).unwrap();
        assert_eq!(id.address.to_string(), "rig42/nux");
        assert!(!id.env_incomplete);
        assert!(id.mismatch);
    }

    #[test]
    fn env_incomplete_without_cwd_help_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = IdentityResolver::new(env_role("crew"))
            .resolve(dir.path())
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Incomplete {
                missing: "rig",
                ..
            }
        ));
    }

    #[test]
    fn cwd_detection_alone() {
        let town = make_town();
        let id = IdentityResolver::default()
            .resolve(&town.path().join("rig42/refinery/rig"))
            .unwrap();
        assert_eq!(id.role, Role::Refinery);
        assert_eq!(id.source, IdentitySource::Cwd);
        assert_eq!(id.home_dir, Some(town.path().join("rig42/refinery/rig")));
    }

    #[test]
    fn cwd_detection_outside_workspace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = IdentityResolver::default().resolve(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::NotInWorkspace(_)));
    }

    #[test]
    fn cwd_detection_unknown_location() {
        let town = make_town();
        std::fs::create_dir_all(town.path().join("rig42/docs")).unwrap();
        let err = IdentityResolver::default()
            .resolve(&town.path().join("rig42/docs"))
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnknownLocation(_)));
    }

    #[test]
    fn town_root_env_fallback() {
        let town = make_town();
        let elsewhere = tempfile::tempdir().unwrap();
        let env = EnvSnapshot {
            role: Some("mayor".into()),
            town_root: Some(town.path().to_path_buf()),
            ..Default::default()
        };
        let id = IdentityResolver::new(env).resolve(elsewhere.path()).unwrap();
        assert_eq!(id.address, AgentAddress::Coordinator);
        assert_eq!(id.home_dir, Some(town.path().join("mayor")));
    }

    #[test]
    fn role_value_forms() {
        assert_eq!(parse_role_value("crew").unwrap(), (Role::PersistentWorker, None, None));
        assert_eq!(
            parse_role_value("rig42/crew").unwrap(),
            (Role::PersistentWorker, Some("rig42".into()), None)
        );
        assert_eq!(
            parse_role_value("rig42/crew/alice").unwrap(),
            (Role::PersistentWorker, Some("rig42".into()), Some("alice".into()))
        );
        assert!(parse_role_value("janitor").is_err());
    }

    #[test]
    fn home_dir_is_pure_and_undeterminable_without_qualifiers() {
        let root = Path::new("/town");
        for role in Role::ALL {
            let a = home_dir(root, role, Some("r"), Some("w"));
            assert_eq!(a, home_dir(root, role, Some("r"), Some("w")));
            assert!(a.is_some());
        }
        assert_eq!(home_dir(root, Role::Witness, None, None), None);
        assert_eq!(home_dir(root, Role::PersistentWorker, Some("r"), None), None);
        assert_eq!(
            home_dir(root, Role::EphemeralWorker, Some("r"), Some("nux")),
            Some(PathBuf::from("/town/r/polecats/nux"))
        );
        assert_eq!(
            home_dir(root, Role::Coordinator, None, None),
            Some(PathBuf::from("/town/mayor"))
        );
    }
}
