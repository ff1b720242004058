use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rigmux_protocol::lock::with_lock;
use rigmux_protocol::{DEFAULT_LOCK_TIMEOUT, Message, file_key};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const INBOX_FILE: &str = "inbox.jsonl";
const ARCHIVE_FILE: &str = "archive.jsonl";

/// One address's messages, persisted as JSONL in insertion order.
///
/// Every mutation holds the mailbox's advisory lock for its read-modify-write.
#[derive(Debug, Clone)]
pub struct Mailbox {
    address: String,
    dir: PathBuf,
    lock_timeout: Duration,
}

impl Mailbox {
    pub fn open(mail_root: &Path, address: &str) -> Self {
        Self {
            address: address.to_string(),
            dir: mail_root.join(file_key(address)),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.dir.join(INBOX_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE)
    }

    /// All messages in insertion order (oldest first).
    pub fn load(&self) -> Result<Vec<Message>> {
        read_jsonl(&self.inbox_path())
    }

    pub fn append(&self, msg: &Message) -> Result<()> {
        let path = self.inbox_path();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        with_lock(&path, self.lock_timeout, || append_line(&path, msg))?;
        debug!(mailbox = %self.address, id = %msg.id, "message appended");
        Ok(())
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<Message>> {
        let mut msgs = self.load()?;
        msgs.reverse();
        Ok(msgs)
    }

    pub fn list_unread(&self) -> Result<Vec<Message>> {
        Ok(self.list()?.into_iter().filter(|m| !m.read).collect())
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.load()?.into_iter().find(|m| m.id == id))
    }

    /// Messages of one thread, oldest first.
    pub fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|m| m.thread_id == thread_id)
            .collect())
    }

    /// `(total, unread)` in one pass.
    pub fn count(&self) -> Result<(usize, usize)> {
        let msgs = self.load()?;
        Ok(msgs
            .iter()
            .fold((0, 0), |(total, unread), m| (total + 1, unread + usize::from(!m.read))))
    }

    pub fn mark_read(&self, id: &str) -> Result<bool> {
        self.set_read(id, true)
    }

    pub fn mark_unread(&self, id: &str) -> Result<bool> {
        self.set_read(id, false)
    }

    fn set_read(&self, id: &str, read: bool) -> Result<bool> {
        self.update(|msgs| match msgs.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.read = read;
                true
            }
            None => false,
        })
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        self.update(|msgs| {
            let before = msgs.len();
            msgs.retain(|m| m.id != id);
            msgs.len() != before
        })
    }

    /// Move a message from the inbox to `archive.jsonl`.
    ///
    /// The archive line is written under the inbox lock before the inbox is
    /// rewritten; a failed append leaves the inbox untouched.
    pub fn archive(&self, id: &str) -> Result<bool> {
        let archive = self.archive_path();
        self.try_update(|msgs| {
            let Some(pos) = msgs.iter().position(|m| m.id == id) else {
                return Ok(false);
            };
            let mut msg = msgs.remove(pos);
            msg.read = true;
            append_line(&archive, &msg)?;
            Ok(true)
        })
    }

    /// Drop ephemeral messages older than `ttl`. Returns how many were removed.
    pub fn purge_expired_wisps(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - ttl;
        self.update(|msgs| {
            let before = msgs.len();
            msgs.retain(|m| !(m.wisp && m.timestamp < cutoff));
            before - msgs.len()
        })
    }

    /// Locked read-modify-write of the whole inbox.
    pub fn update<T>(&self, f: impl FnOnce(&mut Vec<Message>) -> T) -> Result<T> {
        self.try_update(|msgs| Ok(f(msgs)))
    }

    /// Like [`Mailbox::update`], but an error from `f` leaves the inbox as it was.
    pub fn try_update<T>(&self, f: impl FnOnce(&mut Vec<Message>) -> Result<T>) -> Result<T> {
        let path = self.inbox_path();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        with_lock(&path, self.lock_timeout, || {
            let mut msgs = read_jsonl(&path)?;
            let out = f(&mut msgs)?;
            rewrite(&path, &msgs)?;
            Ok(out)
        })
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Message>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    data.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l)
                .with_context(|| format!("invalid message in {}", path.display()))
        })
        .collect()
}

fn append_line(path: &Path, msg: &Message) -> Result<()> {
    let line = serde_json::to_string(msg)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn rewrite(path: &Path, msgs: &[Message]) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to rewrite {}", path.display()))?;
        for msg in msgs {
            let line = serde_json::to_string(msg)?;
            writeln!(file, "{line}")?;
        }
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rigmux_protocol::{MessageType, Priority};

    pub(crate) fn make_msg(id: &str, minutes: i64) -> Message {
        Message {
            id: id.to_string(),
            from: "mayor/".to_string(),
            to: "rig42/crew/max".to_string(),
            cc: Vec::new(),
            subject: format!("subject {id}"),
            body: "hello".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap(),
            read: false,
            priority: Priority::Normal,
            message_type: MessageType::Notification,
            thread_id: format!("thread-{id}"),
            reply_to: None,
            pinned: false,
            wisp: false,
            claimed_by: None,
            claimed_at: None,
        }
    }

    #[test]
    fn append_and_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Mailbox::open(dir.path(), "rig42/crew/max");
        mb.append(&make_msg("1", 0)).unwrap();
        mb.append(&make_msg("2", 1)).unwrap();
        let ids: Vec<_> = mb.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["2", "1"]);
        assert!(mb.inbox_path().ends_with("rig42_crew_max/inbox.jsonl"));
    }

    #[test]
    fn read_flags_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Mailbox::open(dir.path(), "mayor/");
        for i in 0..3 {
            mb.append(&make_msg(&i.to_string(), i)).unwrap();
        }
        assert_eq!(mb.count().unwrap(), (3, 3));
        assert!(mb.mark_read("1").unwrap());
        assert!(!mb.mark_read("nope").unwrap());
        assert_eq!(mb.count().unwrap(), (3, 2));
        assert_eq!(mb.list_unread().unwrap().len(), 2);
        assert!(mb.mark_unread("1").unwrap());
        assert_eq!(mb.count().unwrap(), (3, 3));
    }

    #[test]
    fn delete_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Mailbox::open(dir.path(), "mayor/");
        mb.append(&make_msg("a", 0)).unwrap();
        mb.append(&make_msg("b", 1)).unwrap();
        assert!(mb.delete("a").unwrap());
        assert!(!mb.delete("a").unwrap());
        assert!(mb.archive("b").unwrap());
        assert_eq!(mb.count().unwrap(), (0, 0));
        let archived = read_jsonl(&mb.archive_path()).unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].read);
    }

    #[test]
    fn failed_archive_keeps_message_in_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Mailbox::open(dir.path(), "mayor/");
        mb.append(&make_msg("a", 0)).unwrap();
        std::fs::create_dir_all(mb.archive_path()).unwrap();
        assert!(mb.archive("a").is_err());
        assert_eq!(mb.count().unwrap(), (1, 1));
        assert!(mb.get("a").unwrap().is_some());
    }

    #[test]
    fn thread_listing_is_chronological() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Mailbox::open(dir.path(), "mayor/");
        for (id, min) in [("x", 0), ("y", 1), ("z", 2)] {
            let mut m = make_msg(id, min);
            m.thread_id = if id == "y" { "other".into() } else { "t1".into() };
            mb.append(&m).unwrap();
        }
        let ids: Vec<_> = mb.list_by_thread("t1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["x", "z"]);
    }

    #[test]
    fn purge_drops_only_expired_wisps() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Mailbox::open(dir.path(), "mayor/");
        let mut old_wisp = make_msg("old", 0);
        old_wisp.wisp = true;
        let mut new_wisp = make_msg("new", 60 * 30);
        new_wisp.wisp = true;
        mb.append(&old_wisp).unwrap();
        mb.append(&new_wisp).unwrap();
        mb.append(&make_msg("keep", 0)).unwrap();
        let now = new_wisp.timestamp + chrono::Duration::minutes(1);
        assert_eq!(mb.purge_expired_wisps(chrono::Duration::hours(24), now).unwrap(), 1);
        assert!(mb.get("old").unwrap().is_none());
        assert!(mb.get("keep").unwrap().is_some());
    }

    #[test]
    fn persistence_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        Mailbox::open(dir.path(), "rig42/witness")
            .append(&make_msg("1", 0))
            .unwrap();
        let mb = Mailbox::open(dir.path(), "rig42/witness");
        assert_eq!(mb.get("1").unwrap().unwrap().body, "hello");
    }
}
