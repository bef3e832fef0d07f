//! Data structures for tracking tool state.
//!
//! A "tool" is one user-declared long-running child process under
//! supervision, or a virtual entry that only collects log lines on behalf
//! of an internal subsystem.

use crate::config::ToolConfig;
use crate::logs::LogBuffer;

/// Durable identity of one registry entry.
///
/// Ids are assigned once per supervisor and never reused. The positional
/// registry index is a presentation concern: stable within one tool set,
/// but it shifts when `reload()` swaps the set, while the id of a carried
/// entry does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolId(pub(crate) u64);

impl ToolId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Whether a registry entry maps to a real OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Spawns and supervises an OS process.
    Process,
    /// Log sink only; never spawns and is excluded from dependency
    /// resolution and health checks.
    Virtual,
}

/// The current lifecycle status of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// Not started yet (initial state).
    Waiting,
    /// Process is alive.
    Running,
    /// Stopped on request.
    Stopped,
    /// Spawn failed or the process exited unexpectedly.
    Error,
    /// A supervisor-wide shutdown is stopping this tool.
    ShuttingDown,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Waiting => "waiting",
            ToolStatus::Running => "running",
            ToolStatus::Stopped => "stopped",
            ToolStatus::Error => "error",
            ToolStatus::ShuttingDown => "shutting-down",
        }
    }
}

/// Runtime state of a single tool.
///
/// Accessors hand out clones of this; the live OS process handle is held
/// separately by the supervisor and is never part of a snapshot.
#[derive(Debug, Clone)]
pub struct ToolState {
    /// Durable identity.
    pub id: ToolId,
    /// The configuration this entry was built from.
    pub config: ToolConfig,
    /// Real process or virtual log sink.
    pub kind: ToolKind,
    /// Current lifecycle status.
    pub status: ToolStatus,
    /// Process ID while a process is alive.
    pub pid: Option<u32>,
    /// Spawn time in epoch milliseconds, set only while a process is alive.
    pub start_time: Option<u64>,
    /// Exit code of the last run.
    pub exit_code: Option<i32>,
    /// Buffer containing the tool's output.
    pub logs: LogBuffer,
    /// Bumped on every log append or status/exit-code change, for cheap
    /// "did anything change" polling.
    pub log_version: u64,
}

impl ToolState {
    pub fn new(id: ToolId, config: ToolConfig, kind: ToolKind, max_log_lines: usize) -> Self {
        Self {
            id,
            config,
            kind,
            status: ToolStatus::Waiting,
            pid: None,
            start_time: None,
            exit_code: None,
            logs: LogBuffer::new(max_log_lines),
            log_version: 0,
        }
    }

    /// Lines evicted from the front of the log buffer so far.
    pub fn log_trim_count(&self) -> u64 {
        self.logs.trim_count()
    }
}

/// Milliseconds since the unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
