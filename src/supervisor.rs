//! Process supervision core.
//!
//! The `Supervisor` owns the tool registry: it spawns child processes,
//! wires their output into per-tool log buffers, tracks lifecycle status,
//! drives graceful shutdown, and publishes every observable change on a
//! broadcast bus. It is cheap to clone; clones share one registry.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ansi::{ansi_segments, AnsiState};
use crate::config::{Config, ConfigSource, ToolConfig};
use crate::deps;
use crate::errors::{Result, SupervisorError};
use crate::events::ToolEvent;
use crate::health::HealthMonitor;
use crate::logs::LogLine;
use crate::pidfile::{self, PidFileEntry, PidRegistry};
use crate::startup::{self, StartupOptions};
use crate::tool::{epoch_ms, ToolId, ToolKind, ToolState, ToolStatus};

/// Capacity of the broadcast bus; slow subscribers lag rather than block.
const EVENT_BUS_CAPACITY: usize = 256;

/// Delay between a tool entering `Running` and its first out-of-band
/// health check, so the check isn't racing process startup.
const HEALTH_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How often the per-tool exit watcher polls for a finished child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Whether the supervisor is accepting work or tearing down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    ShuttingDown,
}

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;

/// Timeouts for the staged stop sequence: interrupt, then terminate, then
/// kill. A zero stage is skipped entirely.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    /// Milliseconds to wait for exit after the interrupt signal.
    pub interrupt_ms: u64,
    /// Milliseconds to wait for exit after the terminate signal.
    pub term_ms: u64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            interrupt_ms: 2000,
            term_ms: 2000,
        }
    }
}

impl StopPolicy {
    fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_ms)
    }

    fn term_timeout(&self) -> Duration {
        Duration::from_millis(self.term_ms)
    }

    fn interrupt_enabled(&self) -> bool {
        self.interrupt_ms > 0
    }

    fn term_enabled(&self) -> bool {
        self.term_ms > 0
    }
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Interrupt,
    Terminate,
}

struct Registry {
    tools: Vec<ToolState>,
    max_log_lines: usize,
}

impl Registry {
    fn position(&self, id: ToolId) -> Option<usize> {
        self.tools.iter().position(|t| t.id == id)
    }

    fn position_by_name(&self, name: &str) -> Option<usize> {
        self.tools.iter().position(|t| t.config.name == name)
    }
}

struct SupervisorInner {
    /// Tool registry. Lock order: `registry` before `handles`, always.
    registry: Mutex<Registry>,
    /// Live children by tool id. Leaf lock: never acquire `registry`
    /// while holding it.
    handles: Mutex<HashMap<ToolId, Child>>,
    events: broadcast::Sender<ToolEvent>,
    health: HealthMonitor,
    pids: PidRegistry,
    stop_policy: StopPolicy,
    state: AtomicU8,
    next_id: AtomicU64,
    config_source: Mutex<Option<Box<dyn ConfigSource>>>,
}

impl SupervisorInner {
    fn emit(&self, event: ToolEvent) {
        let _ = self.events.send(event);
    }

    fn next_tool_id(&self) -> ToolId {
        ToolId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Flips `Running -> ShuttingDown`. Returns `false` for the loser of a
    /// shutdown race.
    fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Appends one already-decoded line to a tool's buffer.
    async fn append_line(&self, id: ToolId, line: LogLine) {
        let index = {
            let mut registry = self.registry.lock().await;
            let Some(index) = registry.position(id) else {
                return;
            };
            let tool = &mut registry.tools[index];
            tool.logs.push(line);
            tool.log_version += 1;
            index
        };
        self.emit(ToolEvent::LogAppended { id, index });
    }
}

/// Supervises a set of long-running child processes.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(pids: PidRegistry, stop_policy: StopPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let health = HealthMonitor::new(events.clone());
        Self {
            inner: Arc::new(SupervisorInner {
                registry: Mutex::new(Registry {
                    tools: Vec::new(),
                    max_log_lines: crate::config::UiSettings::default().max_log_lines,
                }),
                handles: Mutex::new(HashMap::new()),
                events,
                health,
                pids,
                stop_policy,
                state: AtomicU8::new(STATE_RUNNING),
                next_id: AtomicU64::new(0),
                config_source: Mutex::new(None),
            }),
        }
    }

    /// Builds the tool registry from a validated configuration without
    /// spawning anything. Tools from a previous `initialize` are dropped
    /// wholesale; running sets are swapped with [`reload`](Self::reload).
    ///
    /// Scans the PID registry for survivors of a previous run first:
    /// orphans are terminated when `processes.cleanup_orphans` is set,
    /// otherwise surfaced as warnings. Returns a snapshot of the registry.
    pub async fn initialize(&self, config: Config) -> Result<Vec<ToolState>> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let config = config.validate()?;
        deps::resolve(&config.tools)?;

        self.scan_orphans(config.processes.cleanup_orphans).await;

        self.inner.health.clear().await;
        for tool in &config.tools {
            if let Some(hc) = &tool.health_check {
                self.inner.health.register(&tool.name, hc.clone()).await;
            }
        }

        let mut registry = self.inner.registry.lock().await;
        registry.max_log_lines = config.ui.max_log_lines;
        let max_log_lines = registry.max_log_lines;
        registry.tools = config
            .tools
            .into_iter()
            .map(|tc| {
                ToolState::new(
                    self.inner.next_tool_id(),
                    tc,
                    ToolKind::Process,
                    max_log_lines,
                )
            })
            .collect();
        info!(tools = registry.tools.len(), "initialized tool registry");
        Ok(registry.tools.clone())
    }

    /// Appends a non-spawning registry entry that only collects log lines
    /// on behalf of an internal subsystem. Virtual tools always sit after
    /// the real tools and are excluded from dependency resolution and
    /// health checks.
    pub async fn create_virtual_tool(&self, name: &str) -> (ToolId, usize) {
        let mut registry = self.inner.registry.lock().await;
        let id = self.inner.next_tool_id();
        let config = ToolConfig {
            name: name.to_string(),
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            cleanup: Vec::new(),
            description: None,
            health_check: None,
            ui: None,
            depends_on: Vec::new(),
        };
        let max_log_lines = registry.max_log_lines;
        registry
            .tools
            .push(ToolState::new(id, config, ToolKind::Virtual, max_log_lines));
        let index = registry.tools.len() - 1;
        debug!(tool = name, index, "created virtual tool");
        (id, index)
    }

    /// Spawns the process for the tool at `index`.
    ///
    /// A no-op when the index is invalid, the tool is virtual, the tool is
    /// already running or stopping, or the supervisor is shutting down.
    /// Spawn failure marks the tool `Error`, appends a log line describing
    /// it, and returns the error; sibling tools are unaffected.
    pub async fn start_tool(&self, index: usize) -> Result<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        let inner = &self.inner;
        let mut registry = inner.registry.lock().await;
        // Shutdown can complete between the gate above and acquiring the
        // lock; a spawn after that point would never be stopped.
        if self.is_shutting_down() {
            return Ok(());
        }
        let Some(tool) = registry.tools.get(index) else {
            return Ok(());
        };
        if tool.kind != ToolKind::Process {
            return Ok(());
        }
        if matches!(tool.status, ToolStatus::Running | ToolStatus::ShuttingDown) {
            return Ok(());
        }
        let id = tool.id;
        let config = tool.config.clone();

        let mut command = Command::new(&config.command);
        command.args(&config.args);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        if !config.env.is_empty() {
            command.envs(&config.env);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let tool = &mut registry.tools[index];
                tool.status = ToolStatus::Error;
                tool.exit_code = None;
                tool.logs.push(LogLine::plain(
                    format!("failed to spawn {}: {e}", config.command),
                    true,
                ));
                tool.log_version += 1;
                drop(registry);
                error!(tool = %config.name, error = %e, "failed to spawn process");
                inner.emit(ToolEvent::StatusChanged {
                    id,
                    index,
                    status: ToolStatus::Error,
                    exit_code: None,
                });
                inner.emit(ToolEvent::LogAppended { id, index });
                return Err(SupervisorError::Spawn {
                    name: config.name,
                    source: e,
                });
            }
        };

        let pid = child.id();
        let start_time = epoch_ms();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        inner.handles.lock().await.insert(id, child);

        let tool = &mut registry.tools[index];
        tool.status = ToolStatus::Running;
        tool.pid = pid;
        tool.start_time = Some(start_time);
        tool.exit_code = None;
        tool.log_version += 1;
        drop(registry);

        if let Some(stdout) = stdout {
            tokio::spawn(read_stream(Arc::clone(inner), id, stdout, false));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(read_stream(Arc::clone(inner), id, stderr, true));
        }
        tokio::spawn(watch_exit(Arc::clone(inner), id, pid));

        if let Some(pid) = pid {
            let entry = PidFileEntry {
                tool_index: index,
                tool_name: config.name.clone(),
                pid,
                start_time,
                command: config.command.clone(),
                args: config.args.clone(),
                cwd: config
                    .cwd
                    .clone()
                    .unwrap_or_else(|| std::env::current_dir().unwrap_or_default()),
            };
            if let Err(e) = inner.pids.update(entry) {
                warn!(tool = %config.name, error = %e, "failed to record pid");
            }
        }

        info!(tool = %config.name, pid = ?pid, "started process");
        inner.emit(ToolEvent::StatusChanged {
            id,
            index,
            status: ToolStatus::Running,
            exit_code: None,
        });

        if config.health_check.is_some() {
            inner.health.start_monitor(&config.name).await;
            let inner = Arc::clone(inner);
            let name = config.name.clone();
            tokio::spawn(async move {
                sleep(HEALTH_SETTLE_DELAY).await;
                let still_running = {
                    let registry = inner.registry.lock().await;
                    registry
                        .position(id)
                        .map(|i| registry.tools[i].status == ToolStatus::Running)
                        .unwrap_or(false)
                };
                if still_running {
                    let _ = inner.health.check_now(&name).await;
                }
            });
        }

        Ok(())
    }

    /// Stops the tool at `index` if it is running: staged signal
    /// escalation per the [`StopPolicy`], then the tool's `cleanup` shell
    /// commands in order, then status `Stopped` and PID registry removal.
    ///
    /// A no-op when the tool isn't running (including when another stop is
    /// already in flight).
    pub async fn stop_tool(&self, index: usize) -> Result<()> {
        let (id, config, pid, child) = {
            let mut registry = self.inner.registry.lock().await;
            let Some(tool) = registry.tools.get(index) else {
                return Ok(());
            };
            if tool.status != ToolStatus::Running {
                return Ok(());
            }
            let id = tool.id;
            let child = self.inner.handles.lock().await.remove(&id);
            let tool = &mut registry.tools[index];
            tool.status = ToolStatus::ShuttingDown;
            tool.log_version += 1;
            (id, tool.config.clone(), tool.pid, child)
        };
        self.inner.emit(ToolEvent::StatusChanged {
            id,
            index,
            status: ToolStatus::ShuttingDown,
            exit_code: None,
        });
        self.finish_stop(id, config, pid, child).await;
        Ok(())
    }

    /// Stops the tool if it is running, then starts it again. The old
    /// process's exit is observed before the new spawn, so the recorded
    /// pid is always fresh. Health state returns to `Starting`.
    pub async fn restart_tool(&self, index: usize) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let tool = self.tool(index).await;
        self.stop_tool(index).await?;
        if let Some(tool) = &tool {
            if tool.config.health_check.is_some() {
                let _ = self.inner.health.reset(&tool.config.name).await;
            }
        }
        self.start_tool(index).await
    }

    /// Appends `text` to a tool's log buffer, one entry per line, decoding
    /// ANSI sequences. Used by virtual tools and explicit user actions.
    pub async fn add_log_to_tool(&self, index: usize, text: &str) {
        let id = {
            let registry = self.inner.registry.lock().await;
            match registry.tools.get(index) {
                Some(tool) => tool.id,
                None => return,
            }
        };
        let mut state = AnsiState::default();
        for line in text.lines() {
            let segments = ansi_segments(line, &mut state);
            self.inner
                .append_line(id, LogLine { segments, is_stderr: false })
                .await;
        }
    }

    /// Empties a tool's log buffer. Evicted lines still count toward the
    /// trim count, so global line numbers stay monotonic.
    pub async fn clear_logs(&self, index: usize) {
        let id = {
            let mut registry = self.inner.registry.lock().await;
            let Some(tool) = registry.tools.get_mut(index) else {
                return;
            };
            tool.logs.clear();
            tool.log_version += 1;
            tool.id
        };
        self.inner.emit(ToolEvent::LogsCleared { id, index });
    }

    /// Starts every tool in dependency order, level by level. See
    /// [`StartupOptions`] for the per-level wait policy.
    pub async fn start_all_with_dependencies(&self, options: StartupOptions) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        startup::start_all(self, options).await
    }

    /// Supervisor-wide graceful shutdown: stops every running or waiting
    /// tool concurrently, then deletes the PID registry file. Idempotent;
    /// a second call while shutdown is in progress returns immediately.
    pub async fn cleanup(&self) {
        if !self.inner.begin_shutdown() {
            debug!("shutdown already in progress");
            return;
        }
        info!("shutting down");
        self.inner.emit(ToolEvent::ShutdownStarted);
        self.inner.health.shutdown().await;
        self.stop_all().await;
        if let Err(e) = self.inner.pids.clear() {
            warn!(error = %e, "failed to clear pid file");
        }
        self.inner.emit(ToolEvent::ShutdownFinished);
        info!("shutdown complete");
    }

    /// Stops all current tools, re-reads configuration through the
    /// configured [`ConfigSource`], rebuilds the registry with the new
    /// tool set (virtual tools are carried over, appended after the new
    /// real tools with their ids and logs intact), and starts everything
    /// per the dependency coordinator.
    pub async fn reload(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let config = {
            let source = self.inner.config_source.lock().await;
            let Some(source) = source.as_ref() else {
                return Err(SupervisorError::Config(
                    "no configuration source set".into(),
                ));
            };
            source.load()?
        };
        let config = config.validate()?;
        deps::resolve(&config.tools)?;
        info!(tools = config.tools.len(), "reloading configuration");

        self.stop_all().await;

        self.inner.health.clear().await;
        for tool in &config.tools {
            if let Some(hc) = &tool.health_check {
                self.inner.health.register(&tool.name, hc.clone()).await;
            }
        }

        {
            let mut registry = self.inner.registry.lock().await;
            registry.max_log_lines = config.ui.max_log_lines;
            let max_log_lines = registry.max_log_lines;
            let virtuals: Vec<ToolState> = registry
                .tools
                .iter()
                .filter(|t| t.kind == ToolKind::Virtual)
                .cloned()
                .collect();
            let mut tools: Vec<ToolState> = config
                .tools
                .into_iter()
                .map(|tc| {
                    ToolState::new(
                        self.inner.next_tool_id(),
                        tc,
                        ToolKind::Process,
                        max_log_lines,
                    )
                })
                .collect();
            tools.extend(virtuals);
            registry.tools = tools;
        }

        self.start_all_with_dependencies(StartupOptions::default())
            .await
    }

    /// A new receiver on the event bus. Dropping it unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ToolEvent> {
        self.inner.events.subscribe()
    }

    /// Sets the source `reload()` pulls configuration from.
    pub async fn set_config_source(&self, source: Box<dyn ConfigSource>) {
        *self.inner.config_source.lock().await = Some(source);
    }

    /// Snapshot of every tool.
    pub async fn tools(&self) -> Vec<ToolState> {
        self.inner.registry.lock().await.tools.clone()
    }

    /// Snapshot of the tool at `index`.
    pub async fn tool(&self, index: usize) -> Option<ToolState> {
        self.inner.registry.lock().await.tools.get(index).cloned()
    }

    /// Snapshot of the first tool with the given name.
    pub async fn tool_by_name(&self, name: &str) -> Option<ToolState> {
        let registry = self.inner.registry.lock().await;
        registry
            .position_by_name(name)
            .map(|i| registry.tools[i].clone())
    }

    /// Snapshot of the tool with the given id.
    pub async fn tool_by_id(&self, id: ToolId) -> Option<ToolState> {
        let registry = self.inner.registry.lock().await;
        registry.position(id).map(|i| registry.tools[i].clone())
    }

    /// Current positional index of the tool with the given id.
    pub async fn index_of(&self, id: ToolId) -> Option<usize> {
        self.inner.registry.lock().await.position(id)
    }

    pub(crate) async fn index_by_name(&self, name: &str) -> Option<usize> {
        self.inner.registry.lock().await.position_by_name(name)
    }

    /// Whether a tool counts as ready for dependency purposes: `Running`
    /// when it has no health check, `Healthy` when it does.
    pub async fn is_tool_ready(&self, name: &str) -> bool {
        let Some(tool) = self.tool_by_name(name).await else {
            return false;
        };
        if tool.status != ToolStatus::Running {
            return false;
        }
        if tool.config.health_check.is_none() {
            return true;
        }
        matches!(
            self.inner.health.health_state(name).await,
            Some(state) if state.status == crate::health::HealthStatus::Healthy
        )
    }

    pub fn state(&self) -> SupervisorState {
        if self.inner.state.load(Ordering::SeqCst) == STATE_SHUTTING_DOWN {
            SupervisorState::ShuttingDown
        } else {
            SupervisorState::Running
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == SupervisorState::ShuttingDown
    }

    /// The health monitor, for health snapshots and out-of-band checks.
    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    /// The PID registry this supervisor persists spawned processes to.
    pub fn pid_registry(&self) -> &PidRegistry {
        &self.inner.pids
    }

    /// Marks every running or waiting real tool `ShuttingDown`, then runs
    /// each one's stop sequence concurrently and awaits them all.
    async fn stop_all(&self) {
        let targets: Vec<(usize, ToolId, ToolConfig, Option<u32>)> = {
            let mut registry = self.inner.registry.lock().await;
            let mut out = Vec::new();
            for (index, tool) in registry.tools.iter_mut().enumerate() {
                if tool.kind != ToolKind::Process {
                    continue;
                }
                if !matches!(tool.status, ToolStatus::Running | ToolStatus::Waiting) {
                    continue;
                }
                tool.status = ToolStatus::ShuttingDown;
                tool.log_version += 1;
                out.push((index, tool.id, tool.config.clone(), tool.pid));
            }
            out
        };
        for (index, id, ..) in &targets {
            self.inner.emit(ToolEvent::StatusChanged {
                id: *id,
                index: *index,
                status: ToolStatus::ShuttingDown,
                exit_code: None,
            });
        }

        let mut stops = JoinSet::new();
        for (_, id, config, pid) in targets {
            let supervisor = self.clone();
            stops.spawn(async move {
                let child = supervisor.inner.handles.lock().await.remove(&id);
                supervisor.finish_stop(id, config, pid, child).await;
            });
        }
        while let Some(res) = stops.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "stop task failed");
            }
        }
    }

    /// Completes a claimed stop: staged termination, cleanup commands,
    /// final bookkeeping. The caller has already taken the child handle
    /// and set the status to `ShuttingDown`.
    async fn finish_stop(&self, id: ToolId, config: ToolConfig, pid: Option<u32>, child: Option<Child>) {
        self.inner.health.stop_monitor(&config.name).await;

        let had_process = child.is_some();
        let exit_code = match child {
            Some(child) => staged_stop(self.inner.stop_policy, child, pid).await,
            None => None,
        };

        if had_process {
            self.run_cleanup_commands(id, &config).await;
        }

        let index = {
            let mut registry = self.inner.registry.lock().await;
            let Some(index) = registry.position(id) else {
                return;
            };
            let tool = &mut registry.tools[index];
            tool.status = ToolStatus::Stopped;
            if had_process {
                tool.exit_code = exit_code;
            }
            tool.pid = None;
            tool.start_time = None;
            tool.log_version += 1;
            index
        };
        self.inner.emit(ToolEvent::StatusChanged {
            id,
            index,
            status: ToolStatus::Stopped,
            exit_code,
        });
        if let Err(e) = self.inner.pids.remove(index) {
            warn!(tool = %config.name, error = %e, "failed to remove pid entry");
        }
        if had_process {
            info!(tool = %config.name, exit_code = ?exit_code, "stopped process");
        }
    }

    /// Runs a tool's cleanup command lines sequentially. Output and
    /// failures land in the tool's log; nothing here is fatal.
    async fn run_cleanup_commands(&self, id: ToolId, config: &ToolConfig) {
        for line in &config.cleanup {
            let mut parts = match shell_words::split(line) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(tool = %config.name, command = %line, error = %e, "invalid cleanup command");
                    self.inner
                        .append_line(
                            id,
                            LogLine::plain(format!("invalid cleanup command: {e}"), true),
                        )
                        .await;
                    continue;
                }
            };
            if parts.is_empty() {
                continue;
            }
            debug!(tool = %config.name, command = %line, "running cleanup command");
            let program = parts.remove(0);
            let mut command = Command::new(program);
            command.args(parts);
            if let Some(cwd) = &config.cwd {
                command.current_dir(cwd);
            }
            if !config.env.is_empty() {
                command.envs(&config.env);
            }
            match command.output().await {
                Ok(output) => {
                    for out_line in String::from_utf8_lossy(&output.stdout).lines() {
                        self.inner
                            .append_line(id, LogLine::plain(format!("[cleanup] {out_line}"), false))
                            .await;
                    }
                    for err_line in String::from_utf8_lossy(&output.stderr).lines() {
                        self.inner
                            .append_line(id, LogLine::plain(format!("[cleanup] {err_line}"), true))
                            .await;
                    }
                    if !output.status.success() {
                        warn!(tool = %config.name, command = %line, status = %output.status, "cleanup command failed");
                        self.inner
                            .append_line(
                                id,
                                LogLine::plain(
                                    format!("cleanup command exited {}: {line}", output.status),
                                    true,
                                ),
                            )
                            .await;
                    }
                }
                Err(e) => {
                    warn!(tool = %config.name, command = %line, error = %e, "cleanup command failed to run");
                    self.inner
                        .append_line(
                            id,
                            LogLine::plain(format!("cleanup command failed: {e}"), true),
                        )
                        .await;
                }
            }
        }
    }

    /// Handles PID registry entries left behind by a previous run.
    async fn scan_orphans(&self, cleanup_orphans: bool) {
        let orphans = self.inner.pids.find_orphans();
        for entry in &orphans {
            if cleanup_orphans {
                info!(tool = %entry.tool_name, pid = entry.pid, "terminating orphaned process");
                if !pidfile::terminate_pid(entry.pid).await {
                    warn!(tool = %entry.tool_name, pid = entry.pid, "failed to terminate orphaned process");
                }
            } else {
                warn!(
                    tool = %entry.tool_name,
                    pid = entry.pid,
                    "orphaned process from a previous run is still alive"
                );
            }
        }
        // Stale entries would collide with this run's indices.
        if let Err(e) = self.inner.pids.clear() {
            warn!(error = %e, "failed to clear pid file");
        }
    }
}

/// Interrupt, terminate, kill: each stage signals and then waits up to its
/// timeout for the process to exit; a disabled stage is skipped. Returns
/// the exit code observed by whichever stage won.
async fn staged_stop(policy: StopPolicy, mut child: Child, pid: Option<u32>) -> Option<i32> {
    if policy.interrupt_enabled() {
        if let Some(pid) = pid {
            send_stop_signal(pid, StopSignal::Interrupt);
        }
        if let Some(status) = wait_for_exit(&mut child, policy.interrupt_timeout()).await {
            return status.code();
        }
    }
    if policy.term_enabled() {
        if let Some(pid) = pid {
            send_stop_signal(pid, StopSignal::Terminate);
        }
        if let Some(status) = wait_for_exit(&mut child, policy.term_timeout()).await {
            return status.code();
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill process");
    }
    match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "failed to reap process");
            None
        }
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    if timeout.is_zero() {
        return None;
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(error = %e, "error while awaiting process exit");
            None
        }
        Err(_) => None,
    }
}

#[cfg(unix)]
fn send_stop_signal(pid: u32, signal: StopSignal) {
    let sig = match signal {
        StopSignal::Interrupt => libc::SIGINT,
        StopSignal::Terminate => libc::SIGTERM,
    };
    unsafe {
        let pid = pid as i32;
        // Signal the whole process group first, then the pid directly for
        // children that left the group.
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_stop_signal(pid: u32, _signal: StopSignal) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // Windows has no SIGINT/SIGTERM; CTRL_BREAK is the closest console
    // signal we can emit to a process group.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_stop_signal(_pid: u32, _signal: StopSignal) {}

/// Reads one output stream line by line into the tool's log buffer,
/// carrying ANSI state across lines. Lines are read as raw bytes and
/// decoded lossily, so output after invalid UTF-8 keeps flowing. Ends at
/// stream EOF; a read error is recorded as a final log line.
async fn read_stream<R>(inner: Arc<SupervisorInner>, id: ToolId, reader: R, is_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut state = AnsiState::default();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let segments = ansi_segments(&line, &mut state);
                inner.append_line(id, LogLine { segments, is_stderr }).await;
            }
            Err(e) => {
                warn!(error = %e, "failed to read process output");
                let notice = format!("failed to read process output: {e}");
                inner.append_line(id, LogLine::plain(notice, is_stderr)).await;
                return;
            }
        }
    }
}

/// Watches one spawned child for exit. An exit observed while the tool is
/// still `Running` is unexpected: the watcher records it, frees the
/// handle, and stops the health monitor. Exits during a stop sequence are
/// left for the stop path to observe. The task ends as soon as the handle
/// leaves the map or the tool runs under a different pid (a restart
/// replaced the child it was watching).
async fn watch_exit(inner: Arc<SupervisorInner>, id: ToolId, pid: Option<u32>) {
    loop {
        sleep(EXIT_POLL_INTERVAL).await;

        let mut registry = inner.registry.lock().await;
        let mut handles = inner.handles.lock().await;
        let Some(index) = registry.position(id) else {
            handles.remove(&id);
            return;
        };
        if registry.tools[index].status != ToolStatus::Running
            || registry.tools[index].pid != pid
        {
            return;
        }
        let Some(child) = handles.get_mut(&id) else {
            return;
        };
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "failed to poll process");
                return;
            }
        };

        handles.remove(&id);
        drop(handles);
        let code = status.code();
        let tool = &mut registry.tools[index];
        tool.status = if code == Some(0) {
            ToolStatus::Stopped
        } else {
            ToolStatus::Error
        };
        tool.exit_code = code;
        tool.pid = None;
        tool.start_time = None;
        let line = match code {
            Some(c) => format!("process exited with code {c}"),
            None => "process terminated by signal".to_string(),
        };
        tool.logs.push(LogLine::plain(line, code != Some(0)));
        tool.log_version += 1;
        let new_status = tool.status;
        let name = tool.config.name.clone();
        drop(registry);

        if code == Some(0) {
            info!(tool = %name, "process exited");
        } else {
            warn!(tool = %name, exit_code = ?code, "process exited unexpectedly");
        }
        inner.emit(ToolEvent::StatusChanged {
            id,
            index,
            status: new_status,
            exit_code: code,
        });
        inner.emit(ToolEvent::LogAppended { id, index });
        inner.health.stop_monitor(&name).await;
        if let Err(e) = inner.pids.remove(index) {
            warn!(tool = %name, error = %e, "failed to remove pid entry");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UiSettings;
    use tempfile::TempDir;

    fn tool_config(name: &str, deps: &[&str]) -> ToolConfig {
        ToolConfig {
            name: name.to_string(),
            command: "true".to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            cleanup: Vec::new(),
            description: None,
            health_check: None,
            ui: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn config(tools: Vec<ToolConfig>) -> Config {
        Config {
            tools,
            processes: Default::default(),
            ui: UiSettings::default(),
        }
    }

    fn supervisor(dir: &TempDir) -> Supervisor {
        Supervisor::new(
            PidRegistry::new(dir.path().join("processes.json")),
            StopPolicy::default(),
        )
    }

    struct StaticSource(Config);

    impl ConfigSource for StaticSource {
        fn load(&self) -> Result<Config> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn initialize_builds_waiting_entries_without_spawning() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let tools = sup
            .initialize(config(vec![tool_config("a", &[]), tool_config("b", &["a"])]))
            .await
            .unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.status == ToolStatus::Waiting));
        assert!(tools.iter().all(|t| t.pid.is_none()));
        assert_ne!(tools[0].id, tools[1].id);
    }

    #[tokio::test]
    async fn initialize_rejects_dependency_cycles() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let err = sup
            .initialize(config(vec![
                tool_config("a", &["b"]),
                tool_config("b", &["a"]),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::DependencyCycle { .. }));
    }

    #[tokio::test]
    async fn virtual_tools_append_after_real_tools_and_never_start() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.initialize(config(vec![tool_config("a", &[])]))
            .await
            .unwrap();
        let (id, index) = sup.create_virtual_tool("api-server").await;
        assert_eq!(index, 1);

        sup.start_tool(index).await.unwrap();
        let tool = sup.tool_by_id(id).await.unwrap();
        assert_eq!(tool.kind, ToolKind::Virtual);
        assert_eq!(tool.status, ToolStatus::Waiting);
    }

    #[tokio::test]
    async fn start_and_stop_out_of_range_are_noops() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.initialize(config(vec![tool_config("a", &[])]))
            .await
            .unwrap();
        sup.start_tool(42).await.unwrap();
        sup.stop_tool(42).await.unwrap();
        sup.stop_tool(0).await.unwrap();
        assert_eq!(sup.tool(0).await.unwrap().status, ToolStatus::Waiting);
    }

    #[tokio::test]
    async fn add_and_clear_logs_bump_version_and_emit() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.initialize(config(vec![tool_config("a", &[])]))
            .await
            .unwrap();
        let mut events = sup.subscribe();

        sup.add_log_to_tool(0, "one\ntwo").await;
        let tool = sup.tool(0).await.unwrap();
        assert_eq!(tool.logs.len(), 2);
        assert_eq!(tool.log_version, 2);

        sup.clear_logs(0).await;
        let tool = sup.tool(0).await.unwrap();
        assert!(tool.logs.is_empty());
        assert_eq!(tool.log_trim_count(), 2);
        assert_eq!(tool.log_version, 3);

        assert!(matches!(
            events.try_recv().unwrap(),
            ToolEvent::LogAppended { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ToolEvent::LogAppended { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ToolEvent::LogsCleared { .. }
        ));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_terminal() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.initialize(config(vec![tool_config("a", &[])]))
            .await
            .unwrap();
        let mut events = sup.subscribe();

        sup.cleanup().await;
        sup.cleanup().await;

        assert_eq!(sup.state(), SupervisorState::ShuttingDown);
        assert_eq!(sup.tool(0).await.unwrap().status, ToolStatus::Stopped);

        let mut started = 0;
        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ToolEvent::ShutdownStarted => started += 1,
                ToolEvent::ShutdownFinished => finished += 1,
                _ => {}
            }
        }
        assert_eq!(started, 1);
        assert_eq!(finished, 1);

        sup.start_tool(0).await.unwrap();
        assert_eq!(sup.tool(0).await.unwrap().status, ToolStatus::Stopped);
        assert!(matches!(
            sup.initialize(config(vec![])).await,
            Err(SupervisorError::ShuttingDown)
        ));
    }

    // A start that slips past a finished shutdown would spawn a process
    // nothing ever stops. A spawn attempt here would surface as Err(Spawn)
    // and an Error status, since the command does not exist.
    #[tokio::test]
    async fn start_after_cleanup_does_not_attempt_a_spawn() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let mut cfg = config(vec![tool_config("a", &[])]);
        cfg.tools[0].command = "/nonexistent/definitely-not-a-binary".to_string();
        sup.initialize(cfg).await.unwrap();

        sup.cleanup().await;

        sup.start_tool(0).await.unwrap();
        let tool = sup.tool(0).await.unwrap();
        assert_eq!(tool.status, ToolStatus::Stopped);
        assert!(tool.pid.is_none());
        assert!(matches!(
            sup.restart_tool(0).await,
            Err(SupervisorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn reload_swaps_tools_and_carries_virtuals() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.initialize(config(vec![tool_config("old", &[])]))
            .await
            .unwrap();
        let (virtual_id, _) = sup.create_virtual_tool("sink").await;
        sup.add_log_to_tool(1, "kept").await;

        sup.set_config_source(Box::new(StaticSource(config(vec![tool_config(
            "new",
            &[],
        )]))))
        .await;
        sup.reload().await.unwrap();

        let tools = sup.tools().await;
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].config.name, "new");
        assert_eq!(tools[1].id, virtual_id);
        assert_eq!(tools[1].logs.len(), 1);
        assert_eq!(sup.index_of(virtual_id).await, Some(1));
    }

    #[tokio::test]
    async fn reload_without_a_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        assert!(matches!(
            sup.reload().await,
            Err(SupervisorError::Config(_))
        ));
    }
}
