use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use chrono::Utc;
use librigmux::SessionControl;
use librigmux::stale::is_stale;
use rigmux_mail::{Mailbox, OutgoingMessage};
use rigmux_protocol::{Message, MessageType, Priority};
use serde_json::json;
use tracing::debug;

use crate::context::{Context, print_json};

/// Send options beyond recipient, subject and body.
pub struct SendFlags {
    pub cc: Vec<String>,
    pub urgent: bool,
    pub priority: Option<u8>,
    pub notify: bool,
    pub reply_to: Option<String>,
    pub message_type: String,
    pub pinned: bool,
    pub permanent: bool,
}

impl SendFlags {
    fn priority(&self) -> Priority {
        if self.urgent {
            return Priority::Urgent;
        }
        self.priority.map(Priority::from_level).unwrap_or_default()
    }
}

pub fn send(ctx: &Context, to: String, subject: String, body: String, flags: SendFlags, json: bool) -> Result<()> {
    if subject.trim().is_empty() {
        bail!("subject must not be empty");
    }
    let caller = ctx.caller()?;
    let message_type: MessageType = flags.message_type.parse().map_err(|e: String| anyhow!(e))?;
    let mut msg = OutgoingMessage::new(caller.to_string(), to, subject, body);
    msg.priority = flags.priority();
    msg.cc = flags.cc;
    msg.notify = flags.notify;
    msg.reply_to = flags.reply_to;
    msg.message_type = message_type;
    msg.pinned = flags.pinned;
    msg.permanent = flags.permanent;

    let report = ctx.router()?.send(&msg)?;
    if json {
        return print_json(&report);
    }
    for d in &report.deliveries {
        println!("sent {} to {}", d.id, d.to);
    }
    if let Some(reason) = &report.fallback {
        println!("note: delivered to '{}' literally ({reason})", msg.to.trim());
    }
    Ok(())
}

fn caller_mailbox(ctx: &Context) -> Result<Mailbox> {
    Ok(ctx.router()?.mailbox(&ctx.caller()?.to_string()))
}

fn print_list(messages: &[Message]) {
    if messages.is_empty() {
        println!("no messages");
        return;
    }
    for m in messages {
        let flag = if m.read { ' ' } else { '*' };
        println!(
            "{flag} {:<20}  {:<22}  {:<16}  {}",
            m.id,
            m.from,
            m.timestamp.format("%m-%d %H:%M"),
            m.subject
        );
    }
}

pub async fn inbox(ctx: &Context, address: Option<&str>, unread: bool, fresh: bool, json: bool) -> Result<()> {
    let address = ctx.address_or_caller(address)?;
    let mailbox = ctx.router()?.mailbox(&address.to_string());
    let mut messages = if unread {
        mailbox.list_unread()?
    } else {
        mailbox.list()?
    };
    if fresh {
        let sessions = ctx.sessions();
        let name = sessions.session_name(&address);
        let created = match sessions.control().session_created(&name).await {
            Ok(created) => created,
            Err(e) => {
                debug!(session = %name, error = %e, "no session start time, nothing is stale");
                None
            }
        };
        messages.retain(|m| !is_stale(m.timestamp, created));
    }
    if json {
        return print_json(&messages);
    }
    print_list(&messages);
    Ok(())
}

pub fn read(ctx: &Context, id: &str, json: bool) -> Result<()> {
    let mailbox = caller_mailbox(ctx)?;
    let Some(msg) = mailbox.get(id)? else {
        bail!("message {id} not found");
    };
    mailbox.mark_read(id)?;
    if json {
        return print_json(&msg);
    }
    println!("From:     {}", msg.from);
    println!("To:       {}", msg.to);
    if !msg.cc.is_empty() {
        println!("Cc:       {}", msg.cc.join(", "));
    }
    println!("Subject:  {}", msg.subject);
    println!("Date:     {}", msg.timestamp.to_rfc3339());
    println!("Priority: {:?}", msg.priority);
    println!("Thread:   {}", msg.thread_id);
    if let Some(reply_to) = &msg.reply_to {
        println!("Reply-To: {reply_to}");
    }
    println!();
    println!("{}", msg.body);
    Ok(())
}

pub fn mark(ctx: &Context, id: &str, read: bool) -> Result<()> {
    let mailbox = caller_mailbox(ctx)?;
    let found = if read {
        mailbox.mark_read(id)?
    } else {
        mailbox.mark_unread(id)?
    };
    if !found {
        bail!("message {id} not found");
    }
    Ok(())
}

pub fn delete(ctx: &Context, id: &str) -> Result<()> {
    if !caller_mailbox(ctx)?.delete(id)? {
        bail!("message {id} not found");
    }
    println!("deleted {id}");
    Ok(())
}

pub fn archive(ctx: &Context, id: &str) -> Result<()> {
    if !caller_mailbox(ctx)?.archive(id)? {
        bail!("message {id} not found");
    }
    println!("archived {id}");
    Ok(())
}

pub fn count(ctx: &Context, address: Option<&str>, json: bool) -> Result<()> {
    let address = ctx.address_or_caller(address)?;
    let (total, unread) = ctx.router()?.mailbox(&address.to_string()).count()?;
    if json {
        return print_json(&json!({ "address": address.to_string(), "total": total, "unread": unread }));
    }
    println!("{total} messages, {unread} unread");
    Ok(())
}

pub fn thread(ctx: &Context, thread_id: &str, json: bool) -> Result<()> {
    let messages = caller_mailbox(ctx)?.list_by_thread(thread_id)?;
    if json {
        return print_json(&messages);
    }
    print_list(&messages);
    Ok(())
}

pub fn claim(ctx: &Context, queue: &str, json: bool) -> Result<()> {
    let caller = ctx.caller()?;
    let claimed = ctx.router()?.claim(queue, &caller.to_string())?;
    if json {
        return print_json(&claimed);
    }
    match claimed {
        Some(m) => {
            println!("claimed {}: {}", m.id, m.subject);
            if !m.body.is_empty() {
                println!();
                println!("{}", m.body);
            }
        }
        None => println!("queue {queue} has nothing to claim"),
    }
    Ok(())
}

pub fn release(ctx: &Context, queue: &str, id: &str) -> Result<()> {
    let caller = ctx.caller()?;
    ctx.router()?.release(queue, id, &caller.to_string())?;
    println!("released {id}");
    Ok(())
}

pub fn channel(ctx: &Context, name: &str, json: bool) -> Result<()> {
    let caller = ctx.caller()?;
    let messages = ctx.router()?.read_channel(name, &caller.to_string())?;
    if json {
        return print_json(&messages);
    }
    print_list(&messages);
    Ok(())
}

pub fn purge(ctx: &Context, ttl: Option<Duration>) -> Result<()> {
    let ttl = match ttl {
        Some(ttl) => chrono::Duration::from_std(ttl).context("ttl out of range")?,
        None => ctx.config.ephemeral_ttl(),
    };
    let dropped = caller_mailbox(ctx)?.purge_expired_wisps(ttl, Utc::now())?;
    println!("purged {dropped} expired messages");
    Ok(())
}
