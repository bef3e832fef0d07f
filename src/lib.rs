//! Supervision engine for long-running developer tools.
//!
//! Feed it a validated [`Config`] and it gives each declared tool a
//! lifecycle: dependency-ordered startup, stdout/stderr capture into
//! bounded per-tool log buffers, HTTP health polling, staged graceful
//! stop, and crash/orphan recovery through a persisted PID registry.
//! Terminal rendering, CLI parsing, and config file formats live in the
//! embedding application, not here.

pub mod ansi;
pub mod config;
pub mod deps;
pub mod errors;
pub mod events;
pub mod health;
pub mod logs;
pub mod pidfile;
pub mod startup;
pub mod supervisor;
pub mod tool;

pub use config::{Config, ConfigSource, HealthCheckConfig, ToolConfig};
pub use errors::{Result, SupervisorError};
pub use events::ToolEvent;
pub use health::{HealthMonitor, HealthStatus, ToolHealthState};
pub use logs::{LogBuffer, LogLine, SegmentColor, TextAttrs, TextSegment};
pub use pidfile::{PidFileData, PidFileEntry, PidRegistry};
pub use startup::StartupOptions;
pub use supervisor::{StopPolicy, Supervisor, SupervisorState};
pub use tool::{ToolId, ToolKind, ToolState, ToolStatus};
