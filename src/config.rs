//! Configuration model for the supervision engine.
//!
//! Tool definitions are produced by an external loader (TOML, CLI flags,
//! whatever the embedding application uses); this module defines the
//! validated shapes the engine consumes, their defaults, and the
//! [`ConfigSource`] seam `reload()` pulls fresh configuration through.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::errors::{Result, SupervisorError};

/// Top-level input to [`Supervisor::initialize`](crate::Supervisor::initialize).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Tools to supervise, in declaration order.
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    /// Process-management behavior.
    #[serde(default)]
    pub processes: ProcessesConfig,
    /// Settings consumed by the engine on behalf of its UI.
    #[serde(default)]
    pub ui: UiSettings,
}

/// Configuration for a single supervised tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    /// Display name of the tool; must be unique and non-empty.
    pub name: String,
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the process.
    pub cwd: Option<PathBuf>,
    /// Environment variables layered over the supervisor's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Shell command lines run sequentially after the process stops.
    #[serde(default)]
    pub cleanup: Vec<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// HTTP health check configuration.
    pub health_check: Option<HealthCheckConfig>,
    /// Link surfaced in the UI next to the tool.
    pub ui: Option<UiLink>,
    /// Names of tools that must be ready before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// HTTP health check for one tool.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Endpoint polled with GET; any 2xx counts as healthy.
    pub url: String,
    /// Poll interval in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive failures tolerated while starting before the tool is
    /// reported unhealthy.
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

/// Display metadata forwarded to the UI layer untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct UiLink {
    pub label: Option<String>,
    pub url: Option<String>,
}

/// Process-management behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessesConfig {
    /// Terminate orphaned processes left behind by a previous supervisor
    /// run instead of only warning about them.
    #[serde(default)]
    pub cleanup_orphans: bool,
}

/// Engine-relevant UI settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UiSettings {
    /// Maximum number of log lines kept in memory per tool.
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
}

fn default_health_interval_ms() -> u64 {
    3000
}

fn default_health_retries() -> u32 {
    3
}

fn default_max_log_lines() -> usize {
    1000
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            cleanup_orphans: false,
        }
    }
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            max_log_lines: default_max_log_lines(),
        }
    }
}

impl Config {
    /// Validates tool definitions and sanitizes dependency references.
    ///
    /// Empty or duplicate tool names are fatal. Dependency references to
    /// unknown tools and self-references are dropped with a warning; a
    /// genuine dependency cycle is caught later by the resolver.
    pub fn validate(mut self) -> Result<Self> {
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(SupervisorError::InvalidTool {
                    name: tool.name.clone(),
                    reason: "name must not be empty".into(),
                });
            }
            if !seen.insert(tool.name.clone()) {
                return Err(SupervisorError::InvalidTool {
                    name: tool.name.clone(),
                    reason: "duplicate tool name".into(),
                });
            }
        }

        let names: HashSet<String> = self.tools.iter().map(|t| t.name.clone()).collect();
        for tool in &mut self.tools {
            tool.depends_on.retain(|dep| {
                if dep == &tool.name {
                    warn!(tool = %tool.name, "ignoring self-referencing dependency");
                    false
                } else if !names.contains(dep) {
                    warn!(tool = %tool.name, dependency = %dep, "ignoring unknown dependency");
                    false
                } else {
                    true
                }
            });
        }

        Ok(self)
    }
}

/// Source of validated configuration, used by `reload()`.
///
/// The engine never parses config files itself; the embedding application
/// implements this trait over whatever format it uses.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config>;
}
