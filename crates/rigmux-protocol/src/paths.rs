use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::env;

const DEFAULT_STATE_DIR: &str = ".local/state/rigmux";

/// Primary workspace marker, relative to the town root.
pub const TOWN_MARKER: &str = "mayor/town.json";
/// Secondary workspace marker directory.
pub const TOWN_MARKER_DIR: &str = "mayor";
pub const SESSION_INDEX_FILE: &str = "sessions-index.json";

/// Returns the config directory for rigmux.
pub fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("rigmux")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("rigmux")
    } else {
        PathBuf::from("/tmp/rigmux")
    }
}

/// Returns the config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Return the per-account state directory.
///
/// Priority: `$RIGMUX_STATE_DIR`, then `~/.local/state/rigmux`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(env::STATE_DIR) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// Ensure the state directory exists with `0700` permissions.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create state dir {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set state dir permissions {}", path.display()))?;
    }
    Ok(())
}

pub fn session_index_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SESSION_INDEX_FILE)
}

/// Root of all mailboxes in a town.
pub fn mail_dir(town_root: &Path) -> PathBuf {
    town_root.join(".mail")
}

/// Directory holding one park file per agent.
pub fn parked_dir(town_root: &Path) -> PathBuf {
    town_root.join(".runtime").join("parked")
}

pub fn messaging_config_path(town_root: &Path) -> PathBuf {
    town_root.join("config").join("messaging.json")
}

pub fn rig_config_path(town_root: &Path, rig: &str) -> PathBuf {
    town_root.join(rig).join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("sub/state");
        ensure_state_dir(&state).unwrap();
        assert!(state.exists());
    }

    #[cfg(unix)]
    #[test]
    fn state_dir_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("perms");
        ensure_state_dir(&state).unwrap();
        let meta = std::fs::metadata(&state).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn town_relative_paths() {
        let root = Path::new("/town");
        assert_eq!(mail_dir(root), PathBuf::from("/town/.mail"));
        assert_eq!(parked_dir(root), PathBuf::from("/town/.runtime/parked"));
        assert_eq!(
            rig_config_path(root, "rig42"),
            PathBuf::from("/town/rig42/config.json")
        );
    }
}
