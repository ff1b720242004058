use anyhow::Context;
use librigmux::SessionConfig;
use rigmux_protocol::names::DEFAULT_PREFIX;
use rigmux_protocol::paths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_TTL_HOURS: u64 = 24 * 365 * 100;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_agent_processes")]
    pub agent_processes: Vec<String>,
    #[serde(default = "default_shell_ready_timeout_secs")]
    pub shell_ready_timeout_secs: u64,
    /// Named tmux server socket (`tmux -L`); the default server when unset.
    #[serde(default)]
    pub tmux_socket: Option<String>,
    #[serde(default = "default_tracker_bin")]
    pub tracker_bin: PathBuf,
    #[serde(default = "default_default_branch")]
    pub default_branch: String,
    #[serde(default = "default_status_concurrency")]
    pub status_concurrency: usize,
    #[serde(default = "default_ephemeral_ttl_hours")]
    pub ephemeral_ttl_hours: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl CliConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&paths::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn ephemeral_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ephemeral_ttl_hours.min(MAX_TTL_HOURS) as i64)
    }

    pub fn session_config(&self, town_root: Option<PathBuf>) -> SessionConfig {
        SessionConfig {
            prefix: self.session_prefix.clone(),
            agent_command: self.agent_command.clone(),
            agent_processes: self.agent_processes.clone(),
            shell_ready_timeout: Duration::from_secs(self.shell_ready_timeout_secs),
            town_root,
            ..SessionConfig::default()
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            session_prefix: default_session_prefix(),
            agent_command: default_agent_command(),
            agent_processes: default_agent_processes(),
            shell_ready_timeout_secs: default_shell_ready_timeout_secs(),
            tmux_socket: None,
            tracker_bin: default_tracker_bin(),
            default_branch: default_default_branch(),
            status_concurrency: default_status_concurrency(),
            ephemeral_ttl_hours: default_ephemeral_ttl_hours(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_session_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_processes() -> Vec<String> {
    vec!["claude".to_string(), "node".to_string()]
}

fn default_shell_ready_timeout_secs() -> u64 {
    10
}

fn default_tracker_bin() -> PathBuf {
    PathBuf::from(rigmux_tracker::bd::DEFAULT_BIN)
}

fn default_default_branch() -> String {
    "main".to_string()
}

fn default_status_concurrency() -> usize {
    8
}

fn default_ephemeral_ttl_hours() -> u64 {
    24
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CliConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg, CliConfig::default());
        assert_eq!(cfg.session_prefix, "rm");
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "tracker_bin = \"/opt/bd\"\nstatus_concurrency = 2\n").unwrap();
        let cfg = CliConfig::load_from(&path).unwrap();
        assert_eq!(cfg.tracker_bin, PathBuf::from("/opt/bd"));
        assert_eq!(cfg.status_concurrency, 2);
        assert_eq!(cfg.agent_processes, ["claude", "node"]);
        assert_eq!(cfg.ephemeral_ttl(), chrono::Duration::hours(24));
    }

    #[test]
    fn session_config_carries_prefix_and_timeout() {
        let cfg = CliConfig {
            session_prefix: "gt".into(),
            shell_ready_timeout_secs: 3,
            ..CliConfig::default()
        };
        let sc = cfg.session_config(Some(PathBuf::from("/town")));
        assert_eq!(sc.prefix, "gt");
        assert_eq!(sc.shell_ready_timeout, Duration::from_secs(3));
        assert_eq!(sc.town_root.as_deref(), Some(Path::new("/town")));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "status_concurrency = \"lots\"").unwrap();
        assert!(CliConfig::load_from(&path).is_err());
    }
}
