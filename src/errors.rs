use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid tool '{name}': {reason}")]
    InvalidTool { name: String, reason: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("timed out waiting for level {level} to become ready; still pending: {}", pending.join(", "))]
    DependencyTimeout { level: usize, pending: Vec<String> },

    #[error("dependency '{0}' failed before becoming ready")]
    DependencyFailed(String),

    #[error("failed to spawn process for tool {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
