use anyhow::Context;
use chrono::{DateTime, Utc};
use rigmux_protocol::paths::session_index_path;
use rigmux_protocol::{DEFAULT_LOCK_TIMEOUT, FileLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::CoordError;

const INDEX_VERSION: u32 = 1;

/// One past agent session, recorded so a successor can find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub session_id: String,
    pub address: String,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

/// Per-account session index shared by every agent process of the account.
///
/// Each read-modify-write holds the exclusive lock on `sessions-index.json.lock`.
#[derive(Debug, Clone)]
pub struct SessionIndex {
    path: PathBuf,
    lock_timeout: Duration,
}

impl SessionIndex {
    pub fn open(state_dir: &Path) -> Self {
        Self {
            path: session_index_path(state_dir),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<IndexFile, CoordError> {
        if !self.path.exists() {
            return Ok(IndexFile::default());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if data.trim().is_empty() {
            return Ok(IndexFile::default());
        }
        Ok(serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", self.path.display()))?)
    }

    fn write(&self, index: &IndexFile) -> Result<(), CoordError> {
        let json = serde_json::to_string_pretty(index).context("failed to encode session index")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Vec<IndexEntry>) -> R) -> Result<R, CoordError> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut index = self.read()?;
        let out = f(&mut index.entries);
        index.version = INDEX_VERSION;
        self.write(&index)?;
        Ok(out)
    }

    /// Add or replace the entry for `entry.session_id`.
    pub fn record(&self, entry: IndexEntry) -> Result<(), CoordError> {
        let id = entry.session_id.clone();
        self.modify(|entries| {
            entries.retain(|e| e.session_id != entry.session_id);
            entries.push(entry);
        })?;
        debug!(session = %id, "session indexed");
        Ok(())
    }

    pub fn forget(&self, session_id: &str) -> Result<bool, CoordError> {
        self.modify(|entries| {
            let before = entries.len();
            entries.retain(|e| e.session_id != session_id);
            entries.len() != before
        })
    }

    /// Entries oldest first, optionally for one address.
    pub fn list(&self, address: Option<&str>) -> Result<Vec<IndexEntry>, CoordError> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut entries: Vec<IndexEntry> = self
            .read()?
            .entries
            .into_iter()
            .filter(|e| address.is_none_or(|a| e.address == a))
            .collect();
        entries.sort_by_key(|e| e.started_at);
        Ok(entries)
    }

    /// Most recent session of `address`: the predecessor to talk to.
    pub fn last(&self, address: &str) -> Result<Option<IndexEntry>, CoordError> {
        Ok(self.list(Some(address))?.pop())
    }
}
