use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use librigmux::{LaunchSpec, SessionLifecycleManager, Tmux};
use rigmux_coord::SessionIndex;
use rigmux_identity::{AgentIdentity, IdentityResolver, discover_rigs, home_dir, rig_default_branch};
use rigmux_mail::MailRouter;
use rigmux_protocol::names::parse_session_name;
use rigmux_protocol::{AgentAddress, Role, paths};
use rigmux_tracker::{BdTracker, CommandFeed};
use serde::Serialize;

use crate::config::CliConfig;

/// Everything a command needs: config, the caller's location and identity override.
#[derive(Clone)]
pub struct Context {
    pub config: CliConfig,
    cwd: PathBuf,
    resolver: IdentityResolver,
    acting_as: Option<String>,
}

impl Context {
    pub fn new(config: CliConfig, acting_as: Option<String>) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        Ok(Self {
            config,
            cwd,
            resolver: IdentityResolver::from_process(),
            acting_as,
        })
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn town_root(&self) -> Result<PathBuf> {
        Ok(self.resolver.town_root(&self.cwd)?)
    }

    pub fn identity(&self) -> Result<AgentIdentity> {
        Ok(self.resolver.resolve(&self.cwd)?)
    }

    /// Address of whoever is running the command.
    pub fn caller(&self) -> Result<AgentAddress> {
        match &self.acting_as {
            Some(addr) => parse_address(addr),
            None => Ok(self.identity()?.address),
        }
    }

    pub fn address_or_caller(&self, address: Option<&str>) -> Result<AgentAddress> {
        match address {
            Some(addr) => parse_address(addr),
            None => self.caller(),
        }
    }

    /// An agent address, or the name of a session one of our agents runs in.
    pub fn session_target(&self, target: &str) -> Result<AgentAddress> {
        if let Ok(address) = AgentAddress::parse(target) {
            return Ok(address);
        }
        let rigs = match self.town_root() {
            Ok(root) => discover_rigs(&root).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        parse_session_name(target, &self.config.session_prefix, &rigs)
            .with_context(|| format!("'{target}' is neither an agent address nor a session name"))
    }

    /// The tracker CLI locates its database from the working directory.
    fn tracker_dir(&self) -> PathBuf {
        self.town_root().unwrap_or_else(|_| self.cwd.clone())
    }

    pub fn tracker(&self) -> BdTracker {
        BdTracker::new(&self.config.tracker_bin).in_dir(self.tracker_dir())
    }

    pub fn feed(&self) -> CommandFeed {
        CommandFeed::new(&self.config.tracker_bin).in_dir(self.tracker_dir())
    }

    pub fn router(&self) -> Result<MailRouter> {
        let root = self.town_root()?;
        Ok(MailRouter::for_town(&root)?.with_lock_timeout(self.config.lock_timeout()))
    }

    pub fn tmux(&self) -> Tmux {
        match &self.config.tmux_socket {
            Some(socket) => Tmux::with_socket(socket),
            None => Tmux::new(),
        }
    }

    pub fn sessions(&self) -> SessionLifecycleManager<Tmux> {
        let town_root = self.town_root().ok();
        SessionLifecycleManager::new(self.tmux(), self.config.session_config(town_root))
    }

    pub fn session_index(&self) -> Result<SessionIndex> {
        let state_dir = paths::default_state_dir()?;
        paths::ensure_state_dir(&state_dir)?;
        Ok(SessionIndex::open(&state_dir).with_lock_timeout(self.config.lock_timeout()))
    }

    /// Where `address` lives and which branch its clone must be on.
    pub fn launch_spec(&self, address: AgentAddress) -> Result<LaunchSpec> {
        let root = self.town_root()?;
        let work_dir = agent_home(&root, &address)?;
        let default_branch = match (address.role(), address.rig()) {
            (Role::EphemeralWorker | Role::PersistentWorker, Some(rig)) => {
                Some(rig_default_branch(&root, rig).unwrap_or_else(|| self.config.default_branch.clone()))
            }
            _ => None,
        };
        let mut spec = LaunchSpec::new(address, work_dir);
        spec.default_branch = default_branch;
        Ok(spec)
    }
}

/// Run a command that takes mailbox or index file locks on the blocking pool.
pub async fn blocking<F>(ctx: &Context, f: F) -> Result<()>
where
    F: FnOnce(&Context) -> Result<()> + Send + 'static,
{
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || f(&ctx)).await?
}

pub fn parse_address(address: &str) -> Result<AgentAddress> {
    AgentAddress::parse(address).with_context(|| format!("invalid agent address '{address}'"))
}

pub fn agent_home(town_root: &Path, address: &AgentAddress) -> Result<PathBuf> {
    home_dir(town_root, address.role(), address.rig(), address.worker())
        .with_context(|| format!("no home directory for {address}"))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
