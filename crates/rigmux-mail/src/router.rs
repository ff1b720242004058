use chrono::Utc;
use rigmux_protocol::paths::mail_dir;
use rigmux_protocol::{DEFAULT_LOCK_TIMEOUT, Message, MessageType, Priority};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mailbox::Mailbox;
use crate::messaging::{MessagingConfig, matches_pattern};
use crate::resolver::{AddressResolver, Recipient, RecipientKind, ResolveError, normalize};

/// Subject prefixes that mark a message as ephemeral unless sent `--permanent`.
const WISP_PREFIXES: [&str; 4] = ["POLECAT_STARTED", "POLECAT_DONE", "NUDGE", "START_WORK"];

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{claimant} may not use {target}")]
    NotEligible { claimant: String, target: String },
    #[error("{claimant} already holds {max} claim(s) on queue {queue}")]
    ClaimLimit {
        claimant: String,
        queue: String,
        max: usize,
    },
    #[error("message {id} is claimed by {holder:?}, not {claimant}")]
    NotClaimer {
        id: String,
        claimant: String,
        holder: Option<String>,
    },
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// A message as the sender composes it, before routing.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub message_type: MessageType,
    pub reply_to: Option<String>,
    /// Raise normal priority to high.
    pub notify: bool,
    pub pinned: bool,
    /// Never treat as ephemeral, whatever the subject says.
    pub permanent: bool,
}

impl OutgoingMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub id: String,
    pub to: String,
    pub kind: RecipientKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub thread_id: String,
    pub deliveries: Vec<Delivery>,
    /// Set when `to` could not be resolved and was delivered literally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

pub fn is_wisp_subject(subject: &str) -> bool {
    let upper = subject.trim_start().to_ascii_uppercase();
    WISP_PREFIXES.iter().any(|p| upper.starts_with(p))
}

fn new_message_id() -> String {
    format!("msg-{}", &uuid::Uuid::new_v4().simple().to_string()[..16])
}

fn new_thread_id() -> String {
    format!("thread-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Delivers mail into per-address mailboxes under `<town>/.mail`.
#[derive(Debug, Clone)]
pub struct MailRouter {
    mail_root: PathBuf,
    town_root: Option<PathBuf>,
    config: MessagingConfig,
    lock_timeout: Duration,
}

impl MailRouter {
    /// Router for a town, reading its messaging configuration.
    pub fn for_town(town_root: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(
            mail_dir(town_root),
            Some(town_root.to_path_buf()),
            MessagingConfig::load(town_root)?,
        ))
    }

    pub fn new(mail_root: PathBuf, town_root: Option<PathBuf>, config: MessagingConfig) -> Self {
        Self {
            mail_root,
            town_root,
            config,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn mailbox(&self, address: &str) -> Mailbox {
        Mailbox::open(&self.mail_root, address).with_lock_timeout(self.lock_timeout)
    }

    fn resolver(&self) -> AddressResolver<'_> {
        AddressResolver::new(self.town_root.as_deref(), &self.config)
    }

    /// Resolve `msg.to`, then deliver one copy per direct recipient or one shared copy
    /// per queue/channel. CC recipients get direct copies. Every recipient has its copy
    /// before this returns.
    pub fn send(&self, msg: &OutgoingMessage) -> Result<SendReport, MailError> {
        let thread_id = self.thread_for(msg)?;
        let priority = msg.priority.with_notify(msg.notify);
        let wisp = !msg.permanent && is_wisp_subject(&msg.subject);

        let (recipients, fallback) = match self.resolver().resolve(&msg.to) {
            Ok(rs) => (rs, None),
            Err(err) => {
                warn!(to = %msg.to, error = %err, "address did not resolve, delivering literally");
                (vec![Recipient::direct(msg.to.trim())], Some(err.to_string()))
            }
        };

        let envelope = Message {
            id: String::new(),
            from: msg.from.clone(),
            to: String::new(),
            cc: msg.cc.clone(),
            subject: msg.subject.clone(),
            body: msg.body.clone(),
            timestamp: Utc::now(),
            read: false,
            priority,
            message_type: msg.message_type,
            thread_id: thread_id.clone(),
            reply_to: msg.reply_to.clone(),
            pinned: msg.pinned,
            wisp,
            claimed_by: None,
            claimed_at: None,
        };

        let mut deliveries = Vec::with_capacity(recipients.len() + msg.cc.len());
        for recipient in &recipients {
            deliveries.push(self.deliver(&envelope, recipient.kind, &recipient.address, &recipient.address)?);
        }
        for cc in &msg.cc {
            let address = normalize(cc).unwrap_or_else(|_| cc.trim().to_string());
            if deliveries.iter().any(|d| d.to == address) {
                continue;
            }
            let primary = recipients
                .first()
                .map(|r| r.address.as_str())
                .unwrap_or(msg.to.as_str());
            deliveries.push(self.deliver(&envelope, RecipientKind::Direct, &address, primary)?);
        }

        info!(
            from = %msg.from,
            to = %msg.to,
            thread = %thread_id,
            copies = deliveries.len(),
            "mail sent"
        );
        Ok(SendReport {
            thread_id,
            deliveries,
            fallback,
        })
    }

    fn deliver(&self, envelope: &Message, kind: RecipientKind, mailbox: &str, to: &str) -> Result<Delivery, MailError> {
        let mut copy = envelope.clone();
        copy.id = new_message_id();
        copy.to = to.to_string();
        let mb = self.mailbox(mailbox);
        mb.append(&copy)?;
        if kind == RecipientKind::Channel {
            self.apply_retention(&mb)?;
        }
        debug!(mailbox, id = %copy.id, kind = ?kind, "delivered");
        Ok(Delivery {
            id: copy.id,
            to: mailbox.to_string(),
            kind,
        })
    }

    /// Replies inherit the original's thread, found in the sender's own mailbox.
    fn thread_for(&self, msg: &OutgoingMessage) -> Result<String, MailError> {
        let Some(reply_to) = msg.reply_to.as_deref() else {
            return Ok(new_thread_id());
        };
        let sender = normalize(&msg.from).unwrap_or_else(|_| msg.from.trim().to_string());
        match self.mailbox(&sender).get(reply_to)? {
            Some(original) if !original.thread_id.is_empty() => Ok(original.thread_id),
            _ => {
                debug!(reply_to, sender = %sender, "original not found, starting new thread");
                Ok(new_thread_id())
            }
        }
    }

    fn apply_retention(&self, mb: &Mailbox) -> Result<(), MailError> {
        let name = mb.address().trim_start_matches("channel:");
        let retain = self.config.channels.get(name).map_or(0, |c| c.retain_count);
        if retain == 0 {
            return Ok(());
        }
        let dropped = mb.update(|msgs| {
            let unpinned = msgs.iter().filter(|m| !m.pinned).count();
            let mut excess = unpinned.saturating_sub(retain);
            let before = msgs.len();
            msgs.retain(|m| {
                if excess > 0 && !m.pinned {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
            before - msgs.len()
        })?;
        if dropped > 0 {
            debug!(channel = name, dropped, "channel trimmed");
        }
        Ok(())
    }

    /// Claim the oldest unclaimed message in a queue.
    pub fn claim(&self, queue: &str, claimant: &str) -> Result<Option<Message>, MailError> {
        let cfg = self
            .config
            .queues
            .get(queue)
            .ok_or_else(|| ResolveError::UnknownQueue(queue.to_string()))?;
        let claimant = normalize(claimant).unwrap_or_else(|_| claimant.trim().to_string());
        if !cfg.workers.is_empty() && !cfg.workers.iter().any(|p| matches_pattern(p, &claimant)) {
            return Err(MailError::NotEligible {
                claimant,
                target: format!("queue:{queue}"),
            });
        }
        let max = cfg.max_claims;
        let claimed = self.mailbox(&format!("queue:{queue}")).update(|msgs| {
            let held = msgs
                .iter()
                .filter(|m| m.claimed_by.as_deref() == Some(claimant.as_str()))
                .count();
            if max > 0 && held >= max {
                return Err(MailError::ClaimLimit {
                    claimant: claimant.clone(),
                    queue: queue.to_string(),
                    max,
                });
            }
            Ok(msgs.iter_mut().find(|m| m.claimed_by.is_none()).map(|m| {
                m.claimed_by = Some(claimant.clone());
                m.claimed_at = Some(Utc::now());
                m.clone()
            }))
        })??;
        if let Some(m) = &claimed {
            info!(queue, claimant = %claimant, id = %m.id, "queue message claimed");
        }
        Ok(claimed)
    }

    /// Return a claimed message to the queue. Only the claimer may release it.
    pub fn release(&self, queue: &str, id: &str, claimant: &str) -> Result<(), MailError> {
        if !self.config.queues.contains_key(queue) {
            return Err(ResolveError::UnknownQueue(queue.to_string()).into());
        }
        let claimant = normalize(claimant).unwrap_or_else(|_| claimant.trim().to_string());
        self.mailbox(&format!("queue:{queue}")).update(|msgs| {
            let m = msgs
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| MailError::MessageNotFound(id.to_string()))?;
            if m.claimed_by.as_deref() != Some(claimant.as_str()) {
                return Err(MailError::NotClaimer {
                    id: id.to_string(),
                    claimant: claimant.clone(),
                    holder: m.claimed_by.clone(),
                });
            }
            m.claimed_by = None;
            m.claimed_at = None;
            Ok(())
        })??;
        info!(queue, id, "queue message released");
        Ok(())
    }

    /// Channel messages, newest first, for a reader allowed by the channel's patterns.
    pub fn read_channel(&self, channel: &str, reader: &str) -> Result<Vec<Message>, MailError> {
        let cfg = self
            .config
            .channels
            .get(channel)
            .ok_or_else(|| ResolveError::UnknownChannel(channel.to_string()))?;
        if !cfg.readers.is_empty() && !cfg.readers.iter().any(|p| matches_pattern(p, reader)) {
            return Err(MailError::NotEligible {
                claimant: reader.to_string(),
                target: format!("channel:{channel}"),
            });
        }
        Ok(self.mailbox(&format!("channel:{channel}")).list()?)
    }
}
