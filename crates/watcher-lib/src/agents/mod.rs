//! Output agents
//!
//! An output agent turns log targets into the native configuration of a
//! log shipping integration. Agents accumulate targets in memory and only
//! touch their output files on [`OutputAgent::flush`].

mod appdynamics;
mod scalyr;
mod symlinker;

pub use appdynamics::{AppDynamicsAgent, AppDynamicsSettings};
pub use scalyr::{
    ScalyrAgent, ScalyrSettings, JWT_REDACTION_RULE, SCALYR_ANNOTATION_PARSER,
    SCALYR_ANNOTATION_REDACTION_RULES, SCALYR_ANNOTATION_SAMPLING_RULES,
};
pub use symlinker::{sanitize, Symlinker, SymlinkerSettings};

use crate::error::{AgentError, SettingsError};
use crate::models::LogTarget;
use crate::settings::{ClusterSettings, WatcherConfig};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Capability surface shared by every log shipping integration.
///
/// Agents are only driven from the watch loop, but must be `Send + Sync` so
/// the loop can run on a spawned task.
pub trait OutputAgent: Send + Sync {
    /// Identity used in logs and metrics
    fn name(&self) -> &'static str;

    /// Whether the agent has not flushed successfully yet
    fn first_run(&self) -> bool;

    /// Register or refresh the entry for `target.id`. Idempotent.
    fn add_log_target(&mut self, target: &LogTarget) -> Result<(), AgentError>;

    /// Drop the entry for `container_id` and release its files
    fn remove_log_target(&mut self, container_id: &str) -> Result<(), AgentError>;

    /// Persist the accumulated state when it differs from the applied one
    fn flush(&mut self) -> Result<(), AgentError>;
}

/// Built-in agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentKind {
    AppDynamics,
    Scalyr,
    Symlinker,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::AppDynamics, AgentKind::Scalyr, AgentKind::Symlinker];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::AppDynamics => "appdynamics",
            AgentKind::Scalyr => "scalyr",
            AgentKind::Symlinker => "symlinker",
        }
    }

    /// Parse a comma separated agent list such as `scalyr, symlinker`
    pub fn parse_list(value: &str) -> Result<BTreeSet<AgentKind>, SettingsError> {
        let kinds = value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(AgentKind::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;

        if kinds.is_empty() {
            return Err(SettingsError::NoAgents {
                supported: supported_agents(),
            });
        }

        Ok(kinds)
    }

    /// Read the agent's environment settings
    pub fn load_settings(&self) -> Result<AgentSettings, SettingsError> {
        Ok(match self {
            AgentKind::AppDynamics => AgentSettings::AppDynamics(AppDynamicsSettings::from_env(None)?),
            AgentKind::Scalyr => AgentSettings::Scalyr(ScalyrSettings::from_env(None)?),
            AgentKind::Symlinker => AgentSettings::Symlinker(SymlinkerSettings::from_env(None)?),
        })
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| SettingsError::UnsupportedAgent {
                name,
                supported: supported_agents(),
            })
    }
}

fn supported_agents() -> String {
    AgentKind::ALL
        .iter()
        .map(AgentKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Environment settings of one configured agent
#[derive(Debug, Clone)]
pub enum AgentSettings {
    AppDynamics(AppDynamicsSettings),
    Scalyr(ScalyrSettings),
    Symlinker(SymlinkerSettings),
}

/// Construct every configured agent.
///
/// Called at startup and again whenever the watcher configuration changes.
pub fn build_agents(
    settings: &[AgentSettings],
    cluster: &ClusterSettings,
    watcher_config: &WatcherConfig,
) -> Result<Vec<Box<dyn OutputAgent>>, AgentError> {
    settings
        .iter()
        .map(|agent| -> Result<Box<dyn OutputAgent>, AgentError> {
            let agent: Box<dyn OutputAgent> = match agent {
                AgentSettings::AppDynamics(s) => Box::new(AppDynamicsAgent::new(s, cluster)?),
                AgentSettings::Scalyr(s) => Box::new(ScalyrAgent::new(s, cluster, watcher_config)?),
                AgentSettings::Symlinker(s) => Box::new(Symlinker::new(s)?),
            };
            Ok(agent)
        })
        .collect()
}

/// Replace `path` with `contents` through a sibling temporary file
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, contents)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(())
}

/// Remove a directory tree; a missing directory is not an error
pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// True if `path` is a symlink, whether or not its target exists
pub(crate) fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
