use std::path::PathBuf;
use std::time::Duration;

use rigmux_git::ensure_default_branch;
use rigmux_protocol::names::{DEFAULT_PREFIX, session_name};
use rigmux_protocol::{Advisory, AgentAddress, env};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::beacon::{Beacon, BeaconTopic};
use crate::control::SessionControl;
use crate::error::SessionError;

const SHELLS: [&str; 6] = ["bash", "zsh", "sh", "fish", "dash", "ksh"];
const STATUS_PALETTE: [&str; 6] = [
    "colour24", "colour29", "colour53", "colour94", "colour130", "colour61",
];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prefix: String,
    /// Command line that starts the agent; the beacon is appended as one argument.
    pub agent_command: String,
    /// Foreground command names that mean the agent is running.
    pub agent_processes: Vec<String>,
    pub shell_ready_timeout: Duration,
    pub poll_interval: Duration,
    pub town_root: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            agent_command: "claude".to_string(),
            agent_processes: vec!["claude".to_string(), "node".to_string()],
            shell_ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            town_root: None,
        }
    }
}

/// Observable state of an agent's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Absent,
    /// Shell is interactive but no agent has been started in it.
    Ready,
    AgentRunning,
    AgentExited,
    /// The session entry exists but its pane does not.
    Stale,
}

/// What to start and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub address: AgentAddress,
    pub work_dir: PathBuf,
    pub sender: String,
    /// Beacon topic override; defaults to `start` for new sessions and `restart` otherwise.
    pub topic: Option<BeaconTopic>,
    /// Branch the work directory must be on before the first attach.
    pub default_branch: Option<String>,
}

impl LaunchSpec {
    pub fn new(address: AgentAddress, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            address,
            work_dir: work_dir.into(),
            sender: "human".to_string(),
            topic: None,
            default_branch: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnsureOutcome {
    AlreadyRunning,
    Created,
    Respawned,
    Recreated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureReport {
    pub session: String,
    pub outcome: EnsureOutcome,
    pub warnings: Vec<String>,
}

/// Single-shot permission to destroy and recreate a stale session.
///
/// Lives on the stack of one top-level call; unrelated calls never share it.
#[derive(Debug, Default)]
struct StaleRetry {
    used: bool,
}

impl StaleRetry {
    fn take(&mut self) -> bool {
        !std::mem::replace(&mut self.used, true)
    }
}

enum Step {
    Ensure,
    Recreate,
}

/// Drives the session hosting one agent through
/// `absent → creating → ready → agent-running → {stale, agent-exited} → (respawned | killed)`.
pub struct SessionLifecycleManager<C> {
    control: C,
    config: SessionConfig,
}

impl<C: SessionControl> SessionLifecycleManager<C> {
    pub fn new(control: C, config: SessionConfig) -> Self {
        Self { control, config }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_name(&self, address: &AgentAddress) -> String {
        session_name(address, &self.config.prefix)
    }

    pub fn is_agent_command(&self, command: &str) -> bool {
        let command = command.trim();
        self.config.agent_processes.iter().any(|p| p == command) || looks_like_version(command)
    }

    pub async fn probe(&self, address: &AgentAddress) -> Result<SessionState, SessionError> {
        let name = self.session_name(address);
        if !self.control.has_session(&name).await? {
            return Ok(SessionState::Absent);
        }
        let command = match self.control.pane_id(&name).await {
            Ok(pane) => self.control.pane_command(&pane).await,
            Err(e) => Err(e),
        };
        match command {
            Err(SessionError::PaneNotFound(_)) => Ok(SessionState::Stale),
            Err(e) => Err(e),
            Ok(cmd) if self.is_agent_command(&cmd) => Ok(SessionState::AgentRunning),
            Ok(cmd) if is_shell(&cmd) => Ok(SessionState::Ready),
            Ok(_) => Ok(SessionState::AgentExited),
        }
    }

    /// Make sure the agent for `spec.address` is running, creating or respawning
    /// its session as needed. A stale session is destroyed and recreated at most once.
    pub async fn ensure_session(&self, spec: &LaunchSpec) -> Result<EnsureReport, SessionError> {
        self.run_guarded(spec, Step::Ensure).await
    }

    /// Destroy and recreate the session in one step.
    pub async fn restart(&self, spec: &LaunchSpec) -> Result<EnsureReport, SessionError> {
        self.run_guarded(spec, Step::Recreate).await
    }

    /// Kill the session. Returns whether it existed.
    pub async fn stop(&self, address: &AgentAddress) -> Result<bool, SessionError> {
        let name = self.session_name(address);
        if !self.control.has_session(&name).await? {
            return Ok(false);
        }
        self.control.kill_session(&name).await?;
        info!(session = %name, "session stopped");
        Ok(true)
    }

    pub async fn attach(&self, session: &str) -> Result<(), SessionError> {
        let inside = std::env::var_os("TMUX").is_some_and(|v| !v.is_empty());
        self.control.attach(session, inside).await
    }

    async fn run_guarded(&self, spec: &LaunchSpec, mut step: Step) -> Result<EnsureReport, SessionError> {
        let name = self.session_name(&spec.address);
        let mut warnings = Vec::new();
        let mut retry = StaleRetry::default();
        // Session actually targeted; differs from `name` when one was adopted by work dir.
        let mut in_use = name.clone();
        loop {
            let result = match step {
                Step::Ensure => self.ensure_once(spec, &name, &mut in_use, &mut warnings).await,
                Step::Recreate => self
                    .kill_and_recreate(spec, &in_use, &name, &mut warnings)
                    .await
                    .map(|()| (name.clone(), EnsureOutcome::Recreated)),
            };
            match result {
                Ok((session, outcome)) => {
                    info!(session = %session, outcome = ?outcome, "session ensured");
                    return Ok(EnsureReport {
                        session,
                        outcome,
                        warnings,
                    });
                }
                Err(SessionError::PaneNotFound(pane)) if retry.take() => {
                    warn!(session = %in_use, pane = %pane, "stale session, destroying and recreating");
                    step = Step::Recreate;
                }
                Err(SessionError::PaneNotFound(pane)) => {
                    return Err(SessionError::StaleAfterRecreate {
                        session: in_use,
                        pane,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_once(
        &self,
        spec: &LaunchSpec,
        name: &str,
        in_use: &mut String,
        warnings: &mut Vec<String>,
    ) -> Result<(String, EnsureOutcome), SessionError> {
        let session = if self.control.has_session(name).await? {
            name.to_string()
        } else {
            match self.control.session_for_work_dir(&spec.work_dir).await {
                Ok(Some(existing)) => {
                    info!(session = %existing, work_dir = %spec.work_dir.display(), "reusing session in work dir");
                    existing
                }
                Ok(None) => {
                    self.create(spec, name, BeaconTopic::Start, warnings).await?;
                    return Ok((name.to_string(), EnsureOutcome::Created));
                }
                Err(e) => {
                    debug!(error = %e, "work dir session lookup failed");
                    self.create(spec, name, BeaconTopic::Start, warnings).await?;
                    return Ok((name.to_string(), EnsureOutcome::Created));
                }
            }
        };

        in_use.clone_from(&session);
        let pane = self.control.pane_id(&session).await?;
        let command = self.control.pane_command(&pane).await?;
        if self.is_agent_command(&command) {
            return Ok((session, EnsureOutcome::AlreadyRunning));
        }

        info!(session = %session, command = %command, "agent not running, respawning");
        let kill = self.control.kill_pane_processes(&pane).await;
        warnings.extend(Advisory::from_result("kill pane processes", kill).log());
        self.start_agent(spec, &pane, BeaconTopic::Restart).await?;
        Ok((session, EnsureOutcome::Respawned))
    }

    /// Kill `stale` then create `name`; the two steps are one intent and never run apart.
    async fn kill_and_recreate(
        &self,
        spec: &LaunchSpec,
        stale: &str,
        name: &str,
        warnings: &mut Vec<String>,
    ) -> Result<(), SessionError> {
        self.control.kill_session(stale).await?;
        self.create(spec, name, BeaconTopic::Restart, warnings).await
    }

    async fn create(
        &self,
        spec: &LaunchSpec,
        name: &str,
        default_topic: BeaconTopic,
        warnings: &mut Vec<String>,
    ) -> Result<(), SessionError> {
        if let Some(branch) = &spec.default_branch {
            warnings.extend(self.guard_branch(spec, branch).await);
        }

        info!(session = %name, work_dir = %spec.work_dir.display(), "creating session");
        self.control.new_session(name, &spec.work_dir).await?;

        for (key, value) in self.session_env(&spec.address) {
            let set = self.control.set_environment(name, key, &value).await;
            warnings.extend(Advisory::from_result(format!("set {key}"), set).log());
        }
        let themed = self
            .control
            .set_status_style(name, &status_style(&spec.address))
            .await;
        warnings.extend(Advisory::from_result("set status style", themed).log());

        self.wait_for_shell(name).await?;
        let pane = self.control.pane_id(name).await?;
        self.start_agent(spec, &pane, default_topic).await
    }

    async fn start_agent(&self, spec: &LaunchSpec, pane: &str, default_topic: BeaconTopic) -> Result<(), SessionError> {
        let topic = spec.topic.clone().unwrap_or(default_topic);
        let beacon = Beacon::new(spec.address.to_string(), spec.sender.clone(), topic);
        let command = beacon.startup_command(&self.config.agent_command);
        debug!(pane, topic = %beacon.topic.label(), "starting agent");
        self.control
            .respawn_pane(pane, &spec.work_dir, &command)
            .await
    }

    async fn wait_for_shell(&self, session: &str) -> Result<(), SessionError> {
        let timeout = self.config.shell_ready_timeout;
        let poll = async {
            loop {
                match self.control.pane_command(session).await {
                    Ok(cmd) if is_shell(&cmd) => return Ok(()),
                    Ok(cmd) => debug!(session, command = %cmd, "shell not ready yet"),
                    Err(SessionError::PaneNotFound(pane)) => {
                        return Err(SessionError::PaneNotFound(pane));
                    }
                    Err(e) => debug!(session, error = %e, "shell probe failed"),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ShellNotReady {
                session: session.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn guard_branch(&self, spec: &LaunchSpec, branch: &str) -> Vec<String> {
        let dir = spec.work_dir.clone();
        let branch = branch.to_string();
        match tokio::task::spawn_blocking(move || ensure_default_branch(&dir, &branch)).await {
            Ok(guard) => guard.log(),
            Err(e) => Advisory::failed("default branch check", e).log().into_iter().collect(),
        }
    }

    fn session_env(&self, address: &AgentAddress) -> Vec<(&'static str, String)> {
        let mut vars = vec![(env::ROLE, address.role().as_str().to_string())];
        if let Some(rig) = address.rig() {
            vars.push((env::RIG, rig.to_string()));
        }
        if let Some(worker) = address.worker() {
            vars.push((env::WORKER, worker.to_string()));
        }
        if let Some(root) = &self.config.town_root {
            vars.push((env::TOWN_ROOT, root.to_string_lossy().into_owned()));
        }
        vars
    }
}

fn is_shell(command: &str) -> bool {
    let command = command.trim().trim_start_matches('-');
    SHELLS.contains(&command)
}

/// Some agent runtimes report their version as the process title.
fn looks_like_version(command: &str) -> bool {
    command.contains('.')
        && command.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Status-line style, one colour per rig.
pub fn status_style(address: &AgentAddress) -> String {
    let key = address.rig().unwrap_or("hq");
    let idx = key.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    format!("bg={},fg=colour255", STATUS_PALETTE[idx % STATUS_PALETTE.len()])
}
