//! HTTP health monitoring.
//!
//! Each health-checked tool gets one polling task while its process runs.
//! The state machine is deliberately asymmetric: a tool that has never
//! been up gets `retries` consecutive failures of grace before it is
//! called unhealthy, but a tool that was healthy is marked unhealthy on
//! the very first failed check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::errors::{Result, SupervisorError};
use crate::events::ToolEvent;
use crate::tool::epoch_ms;

/// Hard cap on how long one health request may take; a timeout counts as
/// a failed check.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of one monitored tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No successful check yet.
    Starting,
    /// The last check returned 2xx.
    Healthy,
    /// Ran out of grace while starting, or failed a check while healthy.
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Snapshot of one tool's health.
#[derive(Debug, Clone)]
pub struct ToolHealthState {
    pub status: HealthStatus,
    /// Consecutive failures since the last success or reset.
    pub failure_count: u32,
    /// Completion time of the most recent check, epoch milliseconds.
    pub last_check: Option<u64>,
}

impl ToolHealthState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Starting,
            failure_count: 0,
            last_check: None,
        }
    }
}

/// Applies one check result. Returns the new status if it changed.
fn apply_check_result(
    state: &mut ToolHealthState,
    success: bool,
    retries: u32,
) -> Option<HealthStatus> {
    let previous = state.status;
    state.last_check = Some(epoch_ms());

    if success {
        state.failure_count = 0;
        state.status = HealthStatus::Healthy;
    } else {
        state.failure_count += 1;
        match previous {
            HealthStatus::Starting => {
                if state.failure_count >= retries {
                    state.status = HealthStatus::Unhealthy;
                }
            }
            HealthStatus::Healthy => state.status = HealthStatus::Unhealthy,
            HealthStatus::Unhealthy => {}
        }
    }

    (state.status != previous).then_some(state.status)
}

struct MonitorInner {
    client: reqwest::Client,
    events: broadcast::Sender<ToolEvent>,
    states: Mutex<HashMap<String, ToolHealthState>>,
    configs: Mutex<HashMap<String, HealthCheckConfig>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Supervisor-owned monitor for every tool with a configured health check.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub(crate) fn new(events: broadcast::Sender<ToolEvent>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                client: reqwest::Client::new(),
                events,
                states: Mutex::new(HashMap::new()),
                configs: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a tool's health check. The tool starts in `Starting`
    /// regardless of any previous registration under the same name.
    pub(crate) async fn register(&self, name: &str, config: HealthCheckConfig) {
        self.inner
            .configs
            .lock()
            .await
            .insert(name.to_string(), config);
        self.inner
            .states
            .lock()
            .await
            .insert(name.to_string(), ToolHealthState::new());
    }

    /// Begins periodic checks for a registered tool. No-op when the tool
    /// has no health check or is already being monitored.
    pub(crate) async fn start_monitor(&self, name: &str) {
        let Some(config) = self.inner.configs.lock().await.get(name).cloned() else {
            return;
        };
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.contains_key(name) {
            return;
        }

        debug!(tool = name, url = %config.url, interval_ms = config.interval_ms, "starting health monitor");
        let inner = Arc::clone(&self.inner);
        let tool = name.to_string();
        let interval = Duration::from_millis(config.interval_ms.max(1));
        tasks.insert(
            tool.clone(),
            tokio::spawn(async move {
                loop {
                    sleep(interval).await;
                    run_check(&inner, &tool, &config).await;
                }
            }),
        );
    }

    /// Stops periodic checks for a tool, leaving its last state readable.
    pub(crate) async fn stop_monitor(&self, name: &str) {
        if let Some(task) = self.inner.tasks.lock().await.remove(name) {
            task.abort();
            debug!(tool = name, "stopped health monitor");
        }
    }

    /// Runs one out-of-band check immediately.
    pub async fn check_now(&self, name: &str) -> Result<()> {
        let config = self
            .inner
            .configs
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::ToolNotFound(name.to_string()))?;
        run_check(&self.inner, name, &config).await;
        Ok(())
    }

    /// Forces a tool back to `Starting` with a zeroed failure count, used
    /// after a restart so the new process gets its grace period back.
    pub async fn reset(&self, name: &str) -> Result<()> {
        let mut states = self.inner.states.lock().await;
        let state = states
            .get_mut(name)
            .ok_or_else(|| SupervisorError::ToolNotFound(name.to_string()))?;
        let changed = state.status != HealthStatus::Starting;
        *state = ToolHealthState::new();
        drop(states);

        if changed {
            debug!(tool = name, "health state reset");
            let _ = self.inner.events.send(ToolEvent::HealthChanged {
                name: name.to_string(),
                status: HealthStatus::Starting,
            });
        }
        Ok(())
    }

    /// Health of one tool, if it has a check configured.
    pub async fn health_state(&self, name: &str) -> Option<ToolHealthState> {
        self.inner.states.lock().await.get(name).cloned()
    }

    /// Snapshot of every tool's health, keyed by tool name.
    pub async fn all_states(&self) -> HashMap<String, ToolHealthState> {
        self.inner.states.lock().await.clone()
    }

    /// Aborts every polling task and forgets all registrations.
    pub(crate) async fn clear(&self) {
        for (_, task) in self.inner.tasks.lock().await.drain() {
            task.abort();
        }
        self.inner.configs.lock().await.clear();
        self.inner.states.lock().await.clear();
    }

    /// Aborts every polling task, keeping last-known states readable.
    pub(crate) async fn shutdown(&self) {
        for (_, task) in self.inner.tasks.lock().await.drain() {
            task.abort();
        }
    }
}

async fn run_check(inner: &MonitorInner, name: &str, config: &HealthCheckConfig) {
    let response = inner
        .client
        .get(&config.url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await;
    let success = match &response {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            debug!(tool = name, error = %e, "health request failed");
            false
        }
    };

    let mut states = inner.states.lock().await;
    let Some(state) = states.get_mut(name) else {
        return;
    };
    let changed = apply_check_result(state, success, config.retries);
    let failures = state.failure_count;
    drop(states);

    if !success {
        warn!(tool = name, failures, retries = config.retries, "health check failed");
    }
    if let Some(status) = changed {
        info!(tool = name, status = status.as_str(), "health status changed");
        let _ = inner.events.send(ToolEvent::HealthChanged {
            name: name.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str) -> HealthCheckConfig {
        HealthCheckConfig {
            url: format!("http://127.0.0.1:1/{name}"),
            interval_ms: 3000,
            retries: 3,
        }
    }

    #[test]
    fn starting_tool_gets_retries_of_grace() {
        let mut state = ToolHealthState::new();
        assert_eq!(apply_check_result(&mut state, false, 3), None);
        assert_eq!(apply_check_result(&mut state, false, 3), None);
        assert_eq!(
            apply_check_result(&mut state, false, 3),
            Some(HealthStatus::Unhealthy)
        );
        assert_eq!(state.failure_count, 3);
    }

    #[test]
    fn healthy_tool_flips_after_one_failure() {
        let mut state = ToolHealthState::new();
        assert_eq!(
            apply_check_result(&mut state, true, 3),
            Some(HealthStatus::Healthy)
        );
        assert_eq!(
            apply_check_result(&mut state, false, 3),
            Some(HealthStatus::Unhealthy)
        );
        assert_eq!(state.failure_count, 1);
    }

    #[test]
    fn success_resets_failure_count_and_recovers() {
        let mut state = ToolHealthState::new();
        apply_check_result(&mut state, false, 5);
        apply_check_result(&mut state, false, 5);
        assert_eq!(state.failure_count, 2);
        assert_eq!(
            apply_check_result(&mut state, true, 5),
            Some(HealthStatus::Healthy)
        );
        assert_eq!(state.failure_count, 0);

        apply_check_result(&mut state, false, 5);
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert_eq!(
            apply_check_result(&mut state, true, 5),
            Some(HealthStatus::Healthy)
        );
    }

    #[test]
    fn unhealthy_stays_unhealthy_on_further_failures() {
        let mut state = ToolHealthState::new();
        apply_check_result(&mut state, false, 1);
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert_eq!(apply_check_result(&mut state, false, 1), None);
        assert_eq!(state.failure_count, 2);
    }

    #[tokio::test]
    async fn reset_returns_tool_to_starting_and_emits() {
        let (tx, mut rx) = broadcast::channel(8);
        let monitor = HealthMonitor::new(tx);
        monitor.register("api", check("api")).await;

        {
            let mut states = monitor.inner.states.lock().await;
            let state = states.get_mut("api").unwrap();
            apply_check_result(state, true, 3);
        }

        monitor.reset("api").await.unwrap();
        let state = monitor.health_state("api").await.unwrap();
        assert_eq!(state.status, HealthStatus::Starting);
        assert_eq!(state.failure_count, 0);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ToolEvent::HealthChanged {
                status: HealthStatus::Starting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reset_unknown_tool_is_an_error() {
        let (tx, _rx) = broadcast::channel(8);
        let monitor = HealthMonitor::new(tx);
        assert!(matches!(
            monitor.reset("ghost").await,
            Err(SupervisorError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn all_states_returns_a_snapshot() {
        let (tx, _rx) = broadcast::channel(8);
        let monitor = HealthMonitor::new(tx);
        monitor.register("api", check("api")).await;

        let mut copy = monitor.all_states().await;
        copy.get_mut("api").unwrap().failure_count = 99;

        assert_eq!(
            monitor.health_state("api").await.unwrap().failure_count,
            0
        );
    }
}
