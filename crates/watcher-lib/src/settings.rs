//! Watcher settings
//!
//! Settings are assembled once at startup and passed by reference into the
//! watch loop and every output agent constructor. The only part that can
//! change at runtime is the [`WatcherConfig`] file, which the loop re-reads
//! on every tick.

use crate::error::SettingsError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;
use url::Url;

pub const DEFAULT_CONTAINERS_PATH: &str = "/mnt/containers/";
pub const DEFAULT_CLUSTER_ENVIRONMENT: &str = "production";
pub const DEFAULT_CLUSTER_ALIAS: &str = "none";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Cluster wide identity, mostly set via the Kubernetes downward API
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSettings {
    pub cluster_id: Option<String>,
    pub node_name: Option<String>,
    pub environment: String,
    pub alias: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            cluster_id: None,
            node_name: None,
            environment: DEFAULT_CLUSTER_ENVIRONMENT.to_string(),
            alias: DEFAULT_CLUSTER_ALIAS.to_string(),
        }
    }
}

/// Settings of the watch loop itself
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Containers directory mounted from the host
    pub containers_path: PathBuf,
    /// Sleep interval between reconciliation ticks
    pub interval: Duration,
    /// URL of an API proxy; the service account is used when unset
    pub kube_url: Option<Url>,
    /// Pod labels required before a container is followed
    pub strict_labels: Vec<String>,
    /// Hot-reloadable watcher configuration file
    pub config_file: Option<PathBuf>,
    pub cluster: ClusterSettings,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            containers_path: PathBuf::from(DEFAULT_CONTAINERS_PATH),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            kube_url: None,
            strict_labels: Vec::new(),
            config_file: None,
            cluster: ClusterSettings::default(),
        }
    }
}

/// Split a comma separated list, dropping blanks
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Contents of the hot-reloadable watcher configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Raw Scalyr sampling rules, validated by the Scalyr agent
    #[serde(default)]
    pub scalyr_sampling_rules: Vec<serde_json::Value>,

    /// Any other key, kept so that every change triggers an agent reload
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Read the watcher configuration file.
///
/// A missing path means an empty configuration; unreadable files are
/// logged and treated the same way.
pub fn load_watcher_config(path: Option<&Path>) -> WatcherConfig {
    let Some(path) = path else {
        return WatcherConfig::default();
    };

    let loaded = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Yaml))
        .build()
        .and_then(|config| config.try_deserialize::<WatcherConfig>());

    match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot read watcher configuration file");
            WatcherConfig::default()
        }
    }
}

/// Deserialize prefixed environment variables into a settings struct.
///
/// `source` replaces the process environment, which keeps tests free of
/// global state.
pub fn load_env_settings<T: DeserializeOwned>(
    scope: &'static str,
    prefix: &str,
    source: Option<config::Map<String, String>>,
) -> Result<T, SettingsError> {
    config::Config::builder()
        .add_source(config::Environment::with_prefix(prefix).source(source))
        .build()
        .and_then(|config| config.try_deserialize::<T>())
        .map_err(|source| SettingsError::Load { scope, source })
}
