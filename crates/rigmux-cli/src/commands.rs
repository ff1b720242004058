use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::Utc;
use librigmux::BeaconTopic;
use rigmux_coord::{AwaitConfig, GateCoordinator, IndexEntry, ResumeReport, SignalWaiter};
use rigmux_identity::discover_agents;
use rigmux_protocol::{AwaitReason, Message, Role};
use rigmux_tracker::WorkTracker;
use serde::Serialize;

use crate::context::{Context, agent_home, parse_address, print_json};

/// Subject marker of mail left by a predecessor session.
const HANDOFF_MARKER: &str = "HANDOFF";

/// Show the detected identity.
pub fn role_show(ctx: &Context, json: bool) -> Result<()> {
    let identity = ctx.identity()?;
    if json {
        return print_json(&identity);
    }
    println!("Role:        {}", identity.role);
    println!("Address:     {}", identity.address);
    println!("Source:      {:?}", identity.source);
    println!("Rig:         {}", identity.rig.as_deref().unwrap_or("-"));
    println!("Worker:      {}", identity.worker.as_deref().unwrap_or("-"));
    match &identity.home_dir {
        Some(home) => println!("Home:        {}", home.display()),
        None => println!("Home:        -"),
    }
    match &identity.town_root {
        Some(root) => println!("Town root:   {}", root.display()),
        None => println!("Town root:   -"),
    }
    println!("Work dir:    {}", identity.work_dir.display());
    if identity.mismatch {
        println!(
            "warning: environment says {} but the directory says {}",
            identity.env_role.as_deref().unwrap_or("-"),
            identity.cwd_role.map_or("-", Role::as_str)
        );
    }
    if identity.env_incomplete {
        println!("warning: rig or worker was filled in from the directory");
    }
    Ok(())
}

pub fn role_list() {
    println!("{:<10}  DESCRIPTION", "ROLE");
    for role in Role::ALL {
        println!("{:<10}  {}", role.as_str(), role.description());
    }
}

pub fn role_home(ctx: &Context, address: Option<&str>) -> Result<()> {
    let address = ctx.address_or_caller(address)?;
    let root = ctx.town_root()?;
    println!("{}", agent_home(&root, &address)?.display());
    Ok(())
}

pub fn role_agents(ctx: &Context, json: bool) -> Result<()> {
    let root = ctx.town_root()?;
    let agents = discover_agents(&root)?;
    if json {
        let names: Vec<String> = agents.iter().map(ToString::to_string).collect();
        return print_json(&names);
    }
    for agent in agents {
        println!("{:<10}  {agent}", agent.role().as_str());
    }
    Ok(())
}

/// Make sure the agent's session is up with the agent running in it.
pub async fn session_ensure(ctx: &Context, address: &str, topic: Option<&str>, sender: String) -> Result<()> {
    let mut spec = ctx.launch_spec(parse_address(address)?)?;
    spec.sender = sender;
    spec.topic = topic.map(BeaconTopic::parse);
    let report = ctx.sessions().ensure_session(&spec).await?;
    println!("{}: {:?}", report.session, report.outcome);
    Ok(())
}

pub async fn session_attach(ctx: &Context, address: &str, detached: bool) -> Result<()> {
    let spec = ctx.launch_spec(ctx.session_target(address)?)?;
    let sessions = ctx.sessions();
    let report = sessions.ensure_session(&spec).await?;
    if detached {
        println!("{}", report.session);
        return Ok(());
    }
    sessions.attach(&report.session).await?;
    Ok(())
}

#[derive(Serialize)]
struct SessionStatusView {
    address: String,
    session: String,
    state: librigmux::SessionState,
}

pub async fn session_status(ctx: &Context, address: &str, json: bool) -> Result<()> {
    let address = ctx.session_target(address)?;
    let sessions = ctx.sessions();
    let view = SessionStatusView {
        session: sessions.session_name(&address),
        state: sessions.probe(&address).await?,
        address: address.to_string(),
    };
    if json {
        return print_json(&view);
    }
    println!("{}  {}  {:?}", view.address, view.session, view.state);
    Ok(())
}

pub async fn session_restart(ctx: &Context, address: &str) -> Result<()> {
    let spec = ctx.launch_spec(ctx.session_target(address)?)?;
    let report = ctx.sessions().restart(&spec).await?;
    println!("{}: {:?}", report.session, report.outcome);
    Ok(())
}

pub async fn session_stop(ctx: &Context, address: &str) -> Result<()> {
    let address = ctx.session_target(address)?;
    let sessions = ctx.sessions();
    let name = sessions.session_name(&address);
    if sessions.stop(&address).await? {
        println!("stopped {name}");
    } else {
        println!("{name} is not running");
    }
    Ok(())
}

/// Show the work item pinned to the caller.
pub async fn hook(ctx: &Context, json: bool) -> Result<()> {
    let caller = ctx.caller()?;
    let pinned = ctx.tracker().pinned_for(&caller.to_string()).await?;
    if json {
        return print_json(&pinned);
    }
    let Some(issue) = pinned.first() else {
        println!("nothing on hook for {caller}");
        return Ok(());
    };
    println!("{}  {}", issue.id, issue.title);
    if let Some(formula) = &issue.formula {
        println!("formula: {formula}");
    }
    if !issue.description.is_empty() {
        println!();
        println!("{}", issue.description);
    }
    Ok(())
}

pub async fn park(ctx: &Context, gate: &str, message: Option<&str>, dry_run: bool, json: bool) -> Result<()> {
    let caller = ctx.caller()?;
    let root = ctx.town_root()?;
    let coordinator = GateCoordinator::new(ctx.tracker(), &root, caller.to_string());
    let report = coordinator.park(gate, message, dry_run).await?;
    if json {
        return print_json(&report);
    }
    let parked = &report.parked;
    if report.dry_run {
        println!("would park {} on gate {}", parked.agent_id, parked.gate_id);
    } else {
        println!("parked {} on gate {}", parked.agent_id, parked.gate_id);
    }
    if let Some(bead) = &parked.bead_id {
        println!("  work:    {bead}");
    }
    if let Some(formula) = &parked.formula {
        println!("  formula: {formula}");
    }
    if let Some(context) = &parked.context {
        println!("  context: {}", context.lines().next().unwrap_or_default());
    }
    if !report.dry_run {
        println!("run `rigmux resume` once the gate closes");
    }
    Ok(())
}

#[derive(Serialize)]
struct ResumeView<'a> {
    #[serde(flatten)]
    report: &'a ResumeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    handoff: Option<Vec<Message>>,
}

pub async fn resume(ctx: &Context, status_only: bool, json: bool, handoff: bool) -> Result<()> {
    let caller = ctx.caller()?;
    let root = ctx.town_root()?;
    let coordinator = GateCoordinator::new(ctx.tracker(), &root, caller.to_string());
    let report = if status_only {
        coordinator.status().await?
    } else {
        coordinator.resume().await?
    };
    let handoff = if handoff {
        let inbox = ctx.router()?.mailbox(&caller.to_string()).list()?;
        Some(
            inbox
                .into_iter()
                .filter(|m| m.subject.contains(HANDOFF_MARKER))
                .collect::<Vec<_>>(),
        )
    } else {
        None
    };

    if json {
        return print_json(&ResumeView {
            report: &report,
            handoff,
        });
    }

    let status = &report.status;
    match &status.parked_work {
        None => println!("no parked work"),
        Some(parked) if !status.can_resume => {
            println!("still parked on gate {} (open)", parked.gate_id);
        }
        Some(parked) => {
            let reason = status.close_reason.as_deref().unwrap_or("closed");
            println!("gate {} closed: {reason}", parked.gate_id);
            let verb = if report.resumed { "restored" } else { "ready to restore" };
            match &parked.bead_id {
                Some(bead) => println!("{verb}: {bead}"),
                None => println!("{verb}: no pinned work was saved"),
            }
            if let Some(context) = &parked.context {
                println!();
                println!("{context}");
            }
        }
    }
    if let Some(messages) = handoff {
        if messages.is_empty() {
            println!("no handoff mail");
        }
        for m in messages {
            println!("handoff {}  from {}  {}", m.id, m.from, m.subject);
        }
    }
    Ok(())
}

pub async fn await_signal(ctx: &Context, cfg: &AwaitConfig, quiet: bool, json: bool) -> Result<()> {
    let waiter = SignalWaiter::new(ctx.tracker(), ctx.feed());
    let report = waiter.await_signal(cfg).await?;
    if quiet {
        return Ok(());
    }
    if json {
        return print_json(&report);
    }
    let outcome = &report.outcome;
    match outcome.reason {
        AwaitReason::Signal => {
            println!("[signal] {}", outcome.signal.as_deref().unwrap_or_default());
        }
        AwaitReason::Timeout => println!(
            "[timeout] no activity after {}ms (idle cycles: {})",
            outcome.elapsed_ms, outcome.idle_cycles
        ),
    }
    Ok(())
}

pub async fn reset_idle(ctx: &Context, agent_bead: &str) -> Result<()> {
    SignalWaiter::new(ctx.tracker(), ctx.feed())
        .reset_idle(agent_bead)
        .await?;
    println!("{agent_bead}: idle counter reset");
    Ok(())
}

pub fn seance_record(
    ctx: &Context,
    session_id: String,
    address: Option<&str>,
    work_dir: Option<PathBuf>,
) -> Result<()> {
    if session_id.trim().is_empty() {
        bail!("session id must not be empty");
    }
    let address = ctx.address_or_caller(address)?;
    let entry = IndexEntry {
        session_id,
        address: address.to_string(),
        work_dir: work_dir.unwrap_or_else(|| ctx.cwd().to_path_buf()),
        started_at: Utc::now(),
    };
    ctx.session_index()?.record(entry.clone())?;
    println!("recorded {} for {}", entry.session_id, entry.address);
    Ok(())
}

pub fn seance_forget(ctx: &Context, session_id: &str) -> Result<()> {
    if !ctx.session_index()?.forget(session_id)? {
        bail!("session {session_id} is not in the index");
    }
    println!("forgot {session_id}");
    Ok(())
}

pub fn seance_list(ctx: &Context, address: Option<&str>, json: bool) -> Result<()> {
    let address = address.map(parse_address).transpose()?.map(|a| a.to_string());
    let entries = ctx.session_index()?.list(address.as_deref())?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    println!("{:<38}  {:<24}  STARTED", "SESSION", "ADDRESS");
    for e in entries {
        println!(
            "{:<38}  {:<24}  {}",
            e.session_id,
            e.address,
            e.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn seance_last(ctx: &Context, address: Option<&str>, json: bool) -> Result<()> {
    let address = ctx.address_or_caller(address)?.to_string();
    let last = ctx.session_index()?.last(&address)?;
    if json {
        return print_json(&last);
    }
    match last {
        Some(e) => println!("{}  {}  {}", e.session_id, e.work_dir.display(), e.started_at.to_rfc3339()),
        None => println!("no previous session for {address}"),
    }
    Ok(())
}
