//! Level-by-level startup sequencing.
//!
//! The coordinator starts level 0 immediately, then holds each later
//! level back until every tool in the previous one reports ready. Waiting
//! is event-driven: readiness is re-evaluated after every bus event, with
//! a coarse tick as a fallback for lagged receivers.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ToolConfig;
use crate::deps;
use crate::errors::{Result, SupervisorError};
use crate::events::ToolEvent;
use crate::supervisor::Supervisor;
use crate::tool::{ToolKind, ToolStatus};

/// Fallback re-check period while waiting on a level.
const READINESS_RECHECK: Duration = Duration::from_millis(500);

/// Policy for `start_all_with_dependencies`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartupOptions {
    /// How long to wait for one level to become ready before giving up
    /// with `DependencyTimeout`. `None` waits forever: a dependency that
    /// never comes up holds its dependents back, visibly, until an
    /// operator intervenes.
    pub level_timeout: Option<Duration>,
}

pub(crate) async fn start_all(supervisor: &Supervisor, options: StartupOptions) -> Result<()> {
    let configs: Vec<ToolConfig> = supervisor
        .tools()
        .await
        .into_iter()
        .filter(|t| t.kind == ToolKind::Process)
        .map(|t| t.config)
        .collect();
    let graph = deps::resolve(&configs)?;
    if graph.levels.is_empty() {
        return Ok(());
    }
    info!(
        tools = configs.len(),
        levels = graph.levels.len(),
        "starting tools in dependency order"
    );

    let mut events = supervisor.subscribe();
    for (level_index, level) in graph.levels.iter().enumerate() {
        if level_index > 0 {
            wait_for_level(
                supervisor,
                &graph.levels[level_index - 1],
                level_index - 1,
                &mut events,
                options.level_timeout,
            )
            .await?;
        }
        if supervisor.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        debug!(level = level_index, tools = ?level, "starting level");
        for name in level {
            let Some(index) = supervisor.index_by_name(name).await else {
                continue;
            };
            if let Err(e) = supervisor.start_tool(index).await {
                warn!(tool = %name, error = %e, "tool failed to start");
            }
        }
    }
    Ok(())
}

/// Blocks until every named tool is ready, a waited-on tool fails, the
/// timeout elapses, or shutdown begins.
async fn wait_for_level(
    supervisor: &Supervisor,
    names: &[String],
    level: usize,
    events: &mut broadcast::Receiver<ToolEvent>,
    timeout: Option<Duration>,
) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if supervisor.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let mut pending = Vec::new();
        for name in names {
            let Some(tool) = supervisor.tool_by_name(name).await else {
                continue;
            };
            if matches!(tool.status, ToolStatus::Error | ToolStatus::Stopped) {
                return Err(SupervisorError::DependencyFailed(name.clone()));
            }
            if !supervisor.is_tool_ready(name).await {
                pending.push(name.clone());
            }
        }
        if pending.is_empty() {
            debug!(level, "level ready");
            return Ok(());
        }

        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SupervisorError::DependencyTimeout { level, pending });
                }
                (deadline - now).min(READINESS_RECHECK)
            }
            None => READINESS_RECHECK,
        };
        tokio::select! {
            event = events.recv() => match event {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event bus lagged while waiting; re-evaluating");
                }
                Err(RecvError::Closed) => sleep(wait).await,
            },
            _ = sleep(wait) => {}
        }
    }
}
