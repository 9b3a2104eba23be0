//! Error types shared across the watcher
//!
//! Errors are grouped by the scope they are contained in: a single
//! container entry, a single output agent, a whole reconciliation tick,
//! or process startup.

use std::path::PathBuf;

/// Configuration errors that make startup impossible
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("No log processing agents specified, supported agents are {supported}")]
    NoAgents { supported: String },

    #[error("Unsupported agent supplied: {name}. Supported log processing agents are {supported}")]
    UnsupportedAgent { name: String, supported: String },

    #[error("Failed to load {scope} settings: {source}")]
    Load {
        scope: &'static str,
        #[source]
        source: config::ConfigError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure to scan the container metadata root
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to read containers directory {path}: {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pod lookup failures
#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("Cannot find pod: {namespace}/{name}")]
    PodNotFound { namespace: String, name: String },

    #[error("Pod lookup for {namespace}/{name} timed out")]
    Timeout { namespace: String, name: String },

    #[error("Pod lookup request failed: {0}")]
    Request(String),

    #[error("Kubernetes client configuration failed: {0}")]
    Client(String),
}

/// Errors raised by an output agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{agent} watcher agent initialization failed. {reason}")]
    Init { agent: &'static str, reason: String },

    #[error("{agent} watcher agent failed to {action} {path}: {source}")]
    Io {
        agent: &'static str,
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{agent} watcher agent failed to render configuration: {source}")]
    Render {
        agent: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{agent} watcher agent failed to render job file: {source}")]
    RenderYaml {
        agent: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{agent} watcher agent failed to write {failed} job files")]
    PartialFlush { agent: &'static str, failed: usize },
}

impl AgentError {
    pub(crate) fn io(
        agent: &'static str,
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        AgentError::Io {
            agent,
            action,
            path: path.into(),
            source,
        }
    }
}

/// Errors escaping a reconciliation tick
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Watch loop is missing {0}")]
    Incomplete(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = KubeError::PodNotFound {
            namespace: "default".to_string(),
            name: "pod-1".to_string(),
        };
        assert_eq!(error.to_string(), "Cannot find pod: default/pod-1");

        let error = AgentError::Init {
            agent: "Scalyr",
            reason: "Env variable WATCHER_SCALYR_DEST_PATH must be set.".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Scalyr watcher agent initialization failed. Env variable WATCHER_SCALYR_DEST_PATH must be set."
        );
    }

    #[test]
    fn test_watcher_error_from_agent_error() {
        let error: WatcherError = AgentError::PartialFlush {
            agent: "AppDynamics",
            failed: 2,
        }
        .into();
        assert!(matches!(error, WatcherError::Agent(_)));
        assert!(error.to_string().contains("2 job files"));
    }
}
