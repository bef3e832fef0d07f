//! Event definitions for the supervisor's broadcast bus.
//!
//! Every observable change is published as a `ToolEvent`. Subscribers hold
//! a `tokio::sync::broadcast::Receiver`; dropping the receiver is the
//! unsubscribe. Events carry the durable tool id alongside the positional
//! index so consumers can key state off whichever suits them.

use crate::health::HealthStatus;
use crate::tool::{ToolId, ToolStatus};

/// A change broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// A tool's lifecycle status changed.
    StatusChanged {
        id: ToolId,
        index: usize,
        status: ToolStatus,
        /// Exit code recorded with this transition, if any.
        exit_code: Option<i32>,
    },
    /// A log line was appended to a tool's buffer.
    LogAppended { id: ToolId, index: usize },
    /// A tool's log buffer was cleared.
    LogsCleared { id: ToolId, index: usize },
    /// A health-checked tool's health state changed.
    HealthChanged { name: String, status: HealthStatus },
    /// Supervisor-wide shutdown began.
    ShutdownStarted,
    /// Supervisor-wide shutdown finished; every tool has stopped.
    ShutdownFinished,
}
