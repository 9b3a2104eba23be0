//! Command line and environment configuration

use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use watcher_lib::settings::{
    parse_list, ClusterSettings, WatcherSettings, DEFAULT_CLUSTER_ALIAS,
    DEFAULT_CLUSTER_ENVIRONMENT, DEFAULT_CONTAINERS_PATH, DEFAULT_INTERVAL_SECS,
};
use watcher_lib::{AgentKind, SettingsError};

/// Watch new containers on the node and generate log shipping configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "kube-log-watcher", version, about)]
pub struct Cli {
    /// Containers directory path mounted from the host
    #[arg(short = 'c', long, env = "WATCHER_CONTAINERS_PATH", default_value = DEFAULT_CONTAINERS_PATH)]
    pub containers_path: PathBuf,

    /// Comma separated log processing agents: appdynamics, scalyr, symlinker
    #[arg(short = 'a', long, env = "WATCHER_AGENTS")]
    pub agents: Option<String>,

    /// Kubernetes cluster id
    #[arg(short = 'i', long, env = "WATCHER_CLUSTER_ID")]
    pub cluster_id: Option<String>,

    /// URL of an API proxy; the in-cluster service account is used otherwise
    #[arg(short = 'u', long, env = "WATCHER_KUBE_URL")]
    pub kube_url: Option<Url>,

    /// Comma separated pod labels required before a container is followed
    #[arg(long, env = "WATCHER_STRICT_LABELS", default_value = "")]
    pub strict_labels: String,

    /// Sleep interval between ticks, in seconds
    #[arg(long, env = "WATCHER_INTERVAL", default_value_t = DEFAULT_INTERVAL_SECS)]
    pub interval: u64,

    #[arg(short = 'v', long, env = "WATCHER_DEBUG")]
    pub verbose: bool,

    /// Hot-reloaded YAML watcher configuration file
    #[arg(long = "config", env = "WATCHER_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Port of the probe and metrics server; disabled when unset
    #[arg(long, env = "WATCHER_API_PORT")]
    pub api_port: Option<u16>,

    #[arg(long, env = "CLUSTER_NODE_NAME")]
    pub node_name: Option<String>,

    #[arg(long, env = "CLUSTER_ENVIRONMENT", default_value = DEFAULT_CLUSTER_ENVIRONMENT)]
    pub cluster_environment: String,

    #[arg(long, env = "CLUSTER_ALIAS", default_value = DEFAULT_CLUSTER_ALIAS)]
    pub cluster_alias: String,
}

impl Cli {
    pub fn agent_kinds(&self) -> Result<BTreeSet<AgentKind>, SettingsError> {
        AgentKind::parse_list(self.agents.as_deref().unwrap_or_default())
    }

    pub fn watcher_settings(&self) -> Result<WatcherSettings, SettingsError> {
        if self.interval == 0 {
            return Err(SettingsError::Invalid(
                "interval must be at least one second".to_string(),
            ));
        }

        Ok(WatcherSettings {
            containers_path: self.containers_path.clone(),
            interval: Duration::from_secs(self.interval),
            kube_url: self.kube_url.clone(),
            strict_labels: parse_list(&self.strict_labels),
            config_file: self.config_file.clone(),
            cluster: ClusterSettings {
                cluster_id: self.cluster_id.clone(),
                node_name: self.node_name.clone(),
                environment: self.cluster_environment.clone(),
                alias: self.cluster_alias.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["kube-log-watcher"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["-a", "scalyr"]);
        let settings = cli.watcher_settings().unwrap();

        assert_eq!(settings.containers_path, PathBuf::from(DEFAULT_CONTAINERS_PATH));
        assert_eq!(settings.interval, Duration::from_secs(60));
        assert!(settings.strict_labels.is_empty());
        assert_eq!(settings.kube_url, None);
        assert_eq!(settings.cluster.environment, "production");
        assert_eq!(settings.cluster.alias, "none");
        assert_eq!(cli.api_port, None);
    }

    #[test]
    fn test_full_command_line() {
        let cli = parse(&[
            "-c",
            "/var/lib/docker/containers",
            "-a",
            "scalyr, symlinker",
            "-i",
            "kube-cluster",
            "-u",
            "http://localhost:8001",
            "--strict-labels",
            "team,owner",
            "--interval",
            "30",
            "--config",
            "/etc/watcher/config.yaml",
            "--node-name",
            "node-1",
        ]);
        let settings = cli.watcher_settings().unwrap();

        assert_eq!(settings.containers_path, PathBuf::from("/var/lib/docker/containers"));
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert_eq!(settings.strict_labels, vec!["team", "owner"]);
        assert_eq!(settings.kube_url.unwrap().as_str(), "http://localhost:8001/");
        assert_eq!(settings.config_file, Some(PathBuf::from("/etc/watcher/config.yaml")));
        assert_eq!(settings.cluster.cluster_id.as_deref(), Some("kube-cluster"));
        assert_eq!(settings.cluster.node_name.as_deref(), Some("node-1"));

        let kinds: Vec<AgentKind> = cli.agent_kinds().unwrap().into_iter().collect();
        assert_eq!(kinds, vec![AgentKind::Scalyr, AgentKind::Symlinker]);
    }

    #[test]
    fn test_agents_are_required() {
        let cli = parse(&[]);
        assert!(matches!(cli.agent_kinds(), Err(SettingsError::NoAgents { .. })));

        let cli = parse(&["-a", "fluentd"]);
        assert!(matches!(cli.agent_kinds(), Err(SettingsError::UnsupportedAgent { .. })));
    }

    #[test]
    fn test_invalid_values() {
        let cli = parse(&["-a", "scalyr", "--interval", "0"]);
        assert!(cli.watcher_settings().is_err());

        let argv = ["kube-log-watcher", "-u", "not a url"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
