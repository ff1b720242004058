mod commands;
mod config;
mod context;
mod mail;
mod status;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::context::{Context, blocking};

#[derive(Parser)]
#[command(name = "rigmux", about = "Coordination layer for fleets of AI coding agents")]
struct Cli {
    /// Act as this agent address instead of the detected identity
    #[arg(long = "as", global = true, value_name = "ADDRESS")]
    acting_as: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Agent identity and roles
    Role {
        #[command(subcommand)]
        action: RoleAction,
    },

    /// Manage agent sessions in tmux
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show the work item pinned to this agent
    Hook {
        #[arg(long)]
        json: bool,
    },

    /// Send, read and organize agent mail
    Mail {
        #[command(subcommand)]
        action: MailAction,
    },

    /// Suspend current work on an open gate
    Park {
        /// Gate ID
        gate: String,

        /// Notes to restore on resume
        #[arg(short, long)]
        message: Option<String>,

        /// Report what would be saved without saving it
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },

    /// Resume parked work once its gate has closed
    Resume {
        /// Only report whether parked work can resume
        #[arg(long)]
        status: bool,

        #[arg(long)]
        json: bool,

        /// Also list handoff mail in the inbox
        #[arg(long)]
        handoff: bool,
    },

    /// Block until the activity feed signals or the timeout passes
    AwaitSignal {
        /// Flat timeout when no backoff is configured
        #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Base timeout grown by the idle counter
        #[arg(long, value_parser = humantime::parse_duration)]
        backoff_base: Option<Duration>,

        #[arg(long, default_value = "2")]
        backoff_mult: u32,

        /// Upper bound for the backed-off timeout
        #[arg(long, value_parser = humantime::parse_duration)]
        backoff_max: Option<Duration>,

        /// Tracker record holding this agent's idle counter
        #[arg(long)]
        agent_bead: Option<String>,

        /// Print nothing
        #[arg(long)]
        quiet: bool,

        #[arg(long)]
        json: bool,
    },

    /// Idle counter maintenance
    Signal {
        #[command(subcommand)]
        action: SignalAction,
    },

    /// Index of past sessions, for talking to a predecessor
    Seance {
        #[command(subcommand)]
        action: SeanceAction,
    },

    /// Session and mailbox state of every agent in the town
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RoleAction {
    /// Show the detected identity
    Show {
        #[arg(long)]
        json: bool,
    },
    /// List the roles
    List,
    /// Print the home directory of an agent (default: this agent)
    Home {
        address: Option<String>,
    },
    /// List every agent the town layout implies
    Agents {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Make sure the agent's session exists and the agent is running in it
    Ensure {
        address: String,

        /// Startup beacon topic (start, restart, handoff, cold-start, assigned:<id>)
        #[arg(long)]
        topic: Option<String>,

        /// Sender named in the startup beacon
        #[arg(long, default_value = "human")]
        sender: String,
    },
    /// Ensure the session, then attach to it
    Attach {
        /// Agent address or session name
        address: String,

        /// Only ensure and print the session name
        #[arg(long)]
        detached: bool,
    },
    /// Report the session state
    Status {
        /// Agent address or session name
        address: String,

        #[arg(long)]
        json: bool,
    },
    /// Kill and recreate the session
    Restart {
        address: String,
    },
    /// Kill the session
    Stop {
        /// Agent address or session name
        address: String,
    },
}

#[derive(Subcommand)]
enum MailAction {
    /// Send a message
    Send {
        /// Address, list:<name>, queue:<name>, channel:<name> or @group
        to: String,

        #[arg(short, long)]
        subject: String,

        /// Message body
        #[arg(short, long, default_value = "")]
        message: String,

        /// Carbon copy recipients (repeatable)
        #[arg(long)]
        cc: Vec<String>,

        #[arg(long)]
        urgent: bool,

        /// Numeric priority: 0 urgent, 1 high, 2 and above normal
        #[arg(long)]
        priority: Option<u8>,

        /// Raise the priority to at least high
        #[arg(long)]
        notify: bool,

        /// Message ID this replies to
        #[arg(long)]
        reply_to: Option<String>,

        /// notification, task, scavenge, reply or handoff
        #[arg(long = "type", default_value = "notification")]
        message_type: String,

        #[arg(long)]
        pinned: bool,

        /// Never treat as ephemeral, whatever the subject
        #[arg(long)]
        permanent: bool,

        #[arg(long)]
        json: bool,
    },
    /// List messages, newest first
    Inbox {
        /// Mailbox to list (default: this agent)
        address: Option<String>,

        #[arg(long)]
        unread: bool,

        /// Hide messages sent before the current session started
        #[arg(long)]
        fresh: bool,

        #[arg(long)]
        json: bool,
    },
    /// Print a message and mark it read
    Read {
        id: String,

        #[arg(long)]
        json: bool,
    },
    MarkRead {
        id: String,
    },
    MarkUnread {
        id: String,
    },
    Delete {
        id: String,
    },
    /// Move a message to the archive
    Archive {
        id: String,
    },
    /// Total and unread counts
    Count {
        address: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Messages of one thread, oldest first
    Thread {
        thread_id: String,

        #[arg(long)]
        json: bool,
    },
    /// Claim the oldest unclaimed message of a queue
    Claim {
        queue: String,

        #[arg(long)]
        json: bool,
    },
    /// Give a claimed queue message back
    Release {
        queue: String,
        id: String,
    },
    /// Read a broadcast channel
    Channel {
        name: String,

        #[arg(long)]
        json: bool,
    },
    /// Drop expired ephemeral messages
    Purge {
        /// Age after which ephemeral messages are dropped (default from config)
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
    },
}

#[derive(Subcommand)]
enum SignalAction {
    /// Put the idle counter back to zero
    ResetIdle {
        #[arg(long)]
        agent_bead: String,
    },
}

#[derive(Subcommand)]
enum SeanceAction {
    /// Record a session for an agent (default: this agent)
    Record {
        session_id: String,

        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Remove a session from the index
    Forget {
        session_id: String,
    },
    /// List indexed sessions, oldest first
    List {
        address: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Most recent session of an agent (default: this agent)
    Last {
        address: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rigmux=info".parse()?)
                .add_directive("librigmux=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::CliConfig::load()?;
    let ctx = Context::new(config, cli.acting_as)?;

    match cli.command {
        Commands::Role { action } => match action {
            RoleAction::Show { json } => commands::role_show(&ctx, json)?,
            RoleAction::List => commands::role_list(),
            RoleAction::Home { address } => commands::role_home(&ctx, address.as_deref())?,
            RoleAction::Agents { json } => commands::role_agents(&ctx, json)?,
        },
        Commands::Session { action } => match action {
            SessionAction::Ensure {
                address,
                topic,
                sender,
            } => commands::session_ensure(&ctx, &address, topic.as_deref(), sender).await?,
            SessionAction::Attach { address, detached } => {
                commands::session_attach(&ctx, &address, detached).await?
            }
            SessionAction::Status { address, json } => {
                commands::session_status(&ctx, &address, json).await?
            }
            SessionAction::Restart { address } => commands::session_restart(&ctx, &address).await?,
            SessionAction::Stop { address } => commands::session_stop(&ctx, &address).await?,
        },
        Commands::Hook { json } => commands::hook(&ctx, json).await?,
        Commands::Mail { action } => match action {
            MailAction::Send {
                to,
                subject,
                message,
                cc,
                urgent,
                priority,
                notify,
                reply_to,
                message_type,
                pinned,
                permanent,
                json,
            } => {
                let flags = mail::SendFlags {
                    cc,
                    urgent,
                    priority,
                    notify,
                    reply_to,
                    message_type,
                    pinned,
                    permanent,
                };
                blocking(&ctx, move |ctx| mail::send(ctx, to, subject, message, flags, json)).await?
            }
            MailAction::Inbox {
                address,
                unread,
                fresh,
                json,
            } => mail::inbox(&ctx, address.as_deref(), unread, fresh, json).await?,
            MailAction::Read { id, json } => blocking(&ctx, move |ctx| mail::read(ctx, &id, json)).await?,
            MailAction::MarkRead { id } => blocking(&ctx, move |ctx| mail::mark(ctx, &id, true)).await?,
            MailAction::MarkUnread { id } => blocking(&ctx, move |ctx| mail::mark(ctx, &id, false)).await?,
            MailAction::Delete { id } => blocking(&ctx, move |ctx| mail::delete(ctx, &id)).await?,
            MailAction::Archive { id } => blocking(&ctx, move |ctx| mail::archive(ctx, &id)).await?,
            MailAction::Count { address, json } => mail::count(&ctx, address.as_deref(), json)?,
            MailAction::Thread { thread_id, json } => mail::thread(&ctx, &thread_id, json)?,
            MailAction::Claim { queue, json } => {
                blocking(&ctx, move |ctx| mail::claim(ctx, &queue, json)).await?
            }
            MailAction::Release { queue, id } => {
                blocking(&ctx, move |ctx| mail::release(ctx, &queue, &id)).await?
            }
            MailAction::Channel { name, json } => mail::channel(&ctx, &name, json)?,
            MailAction::Purge { ttl } => blocking(&ctx, move |ctx| mail::purge(ctx, ttl)).await?,
        },
        Commands::Park {
            gate,
            message,
            dry_run,
            json,
        } => commands::park(&ctx, &gate, message.as_deref(), dry_run, json).await?,
        Commands::Resume {
            status,
            json,
            handoff,
        } => commands::resume(&ctx, status, json, handoff).await?,
        Commands::AwaitSignal {
            timeout,
            backoff_base,
            backoff_mult,
            backoff_max,
            agent_bead,
            quiet,
            json,
        } => {
            let cfg = rigmux_coord::AwaitConfig {
                timeout,
                backoff_base,
                backoff_mult,
                backoff_max,
                agent_bead,
            };
            commands::await_signal(&ctx, &cfg, quiet, json).await?
        }
        Commands::Signal { action } => match action {
            SignalAction::ResetIdle { agent_bead } => commands::reset_idle(&ctx, &agent_bead).await?,
        },
        Commands::Seance { action } => match action {
            SeanceAction::Record {
                session_id,
                address,
                work_dir,
            } => {
                blocking(&ctx, move |ctx| {
                    commands::seance_record(ctx, session_id, address.as_deref(), work_dir)
                })
                .await?
            }
            SeanceAction::Forget { session_id } => {
                blocking(&ctx, move |ctx| commands::seance_forget(ctx, &session_id)).await?
            }
            SeanceAction::List { address, json } => {
                commands::seance_list(&ctx, address.as_deref(), json)?
            }
            SeanceAction::Last { address, json } => {
                commands::seance_last(&ctx, address.as_deref(), json)?
            }
        },
        Commands::Status { json } => status::run(&ctx, json).await?,
    }

    Ok(())
}
