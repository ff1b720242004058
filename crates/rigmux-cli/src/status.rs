use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use librigmux::SessionState;
use rigmux_identity::discover_agents;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::{Context, print_json};

#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub address: String,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total: usize,
    pub unread: usize,
}

/// Probe every agent of the town at once, at most `status_concurrency` in flight.
pub async fn run(ctx: &Context, json: bool) -> Result<()> {
    let root = ctx.town_root()?;
    let agents = discover_agents(&root)?;
    let sessions = ctx.sessions();
    let router = ctx.router()?;
    let limit = ctx.config.status_concurrency.max(1);

    let rows = Mutex::new(Vec::with_capacity(agents.len()));
    stream::iter(agents.iter().enumerate())
        .for_each_concurrent(limit, |(idx, agent)| {
            let sessions = &sessions;
            let router = &router;
            let rows = &rows;
            async move {
                let address = agent.to_string();
                let (state, error) = match sessions.probe(agent).await {
                    Ok(state) => (Some(state), None),
                    Err(e) => {
                        debug!(agent = %address, error = %e, "probe failed");
                        (None, Some(e.to_string()))
                    }
                };
                let (total, unread) = router.mailbox(&address).count().unwrap_or_else(|e| {
                    debug!(agent = %address, error = %e, "mailbox unreadable");
                    (0, 0)
                });
                let row = AgentStatus {
                    session: sessions.session_name(agent),
                    address,
                    state,
                    error,
                    total,
                    unread,
                };
                rows.lock().await.push((idx, row));
            }
        })
        .await;

    let mut rows = rows.into_inner();
    rows.sort_by_key(|(idx, _)| *idx);
    let rows: Vec<AgentStatus> = rows.into_iter().map(|(_, row)| row).collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("no agents");
        return Ok(());
    }
    println!("{:<24}  {:<28}  {:<14}  MAIL", "AGENT", "SESSION", "STATE");
    for row in rows {
        let state = row.state.map_or_else(|| "unknown".to_string(), |s| format!("{s:?}"));
        println!(
            "{:<24}  {:<28}  {:<14}  {}/{}",
            row.address, row.session, state, row.unread, row.total
        );
    }
    Ok(())
}
