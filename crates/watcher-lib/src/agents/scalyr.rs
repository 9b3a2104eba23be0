//! Scalyr agent
//!
//! Maintains the Scalyr agent JSON configuration with one log entry per
//! watched container. Each log is exposed through a friendly symlink
//! `<dest>/<container id>/<application>-<version>.log`.

use super::{is_symlink, remove_dir_if_exists, write_atomically, OutputAgent};
use crate::error::{AgentError, SettingsError};
use crate::models::LogTarget;
use crate::settings::{load_env_settings, ClusterSettings, WatcherConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const NAME: &str = "Scalyr";

pub const SCALYR_CONFIG_PATH: &str = "/etc/scalyr-agent-2/agent.json";

/// `[{"container": "my-container", "parser": "my-custom-parser"}]`
pub const SCALYR_ANNOTATION_PARSER: &str = "kubernetes-log-watcher/scalyr-parser";
/// `[{"container": "my-container", "sampling-rules": [{"match_expression": "...", "sampling_rate": "0"}]}]`
pub const SCALYR_ANNOTATION_SAMPLING_RULES: &str = "kubernetes-log-watcher/scalyr-sampling-rules";
/// `[{"container": "my-container", "redaction-rules": [{"match_expression": "..."}]}]`
pub const SCALYR_ANNOTATION_REDACTION_RULES: &str = "kubernetes-log-watcher/scalyr-redaction-rules";

pub const JWT_REDACTION_RULE: (&str, &str) = (
    r"eyJ[a-zA-Z0-9/+_=-]{5,}\.eyJ[a-zA-Z0-9/+_=-]{5,}\.[a-zA-Z0-9/+_=-]{5,}",
    "+++JWT_TOKEN_REDACTED+++",
);

const SCALYR_DEFAULT_PARSER: &str = "json";
const JOURNALD_MONITOR_MODULE: &str = "scalyr_agent.builtin_monitors.journald_monitor";

/// Scalyr agent settings, read from `WATCHER_SCALYR_*`
#[derive(Debug, Clone, Deserialize)]
pub struct ScalyrSettings {
    pub api_key_file: Option<PathBuf>,
    pub dest_path: Option<PathBuf>,
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    pub server: Option<String>,
    /// `parser[=alias],...`; `*` enables JSON line parsing for every parser
    #[serde(default)]
    pub parse_lines_json: String,
    #[serde(default)]
    pub enable_profiling: bool,
    #[serde(default)]
    pub journald: bool,
    pub journald_path: Option<String>,
    #[serde(default = "empty_json_object")]
    pub journald_attributes: String,
    #[serde(default = "empty_json_object")]
    pub journald_extra_fields: String,
    #[serde(default = "default_write_rate")]
    pub journald_write_rate: u64,
    #[serde(default = "default_write_burst")]
    pub journald_write_burst: u64,
}

fn default_config_path() -> PathBuf {
    PathBuf::from(SCALYR_CONFIG_PATH)
}

fn empty_json_object() -> String {
    "{}".to_string()
}

fn default_write_rate() -> u64 {
    10_000
}

fn default_write_burst() -> u64 {
    200_000
}

impl Default for ScalyrSettings {
    fn default() -> Self {
        Self {
            api_key_file: None,
            dest_path: None,
            config_path: default_config_path(),
            server: None,
            parse_lines_json: String::new(),
            enable_profiling: false,
            journald: false,
            journald_path: None,
            journald_attributes: empty_json_object(),
            journald_extra_fields: empty_json_object(),
            journald_write_rate: default_write_rate(),
            journald_write_burst: default_write_burst(),
        }
    }
}

impl ScalyrSettings {
    pub fn from_env(source: Option<config::Map<String, String>>) -> Result<Self, SettingsError> {
        load_env_settings("Scalyr", "WATCHER_SCALYR", source)
    }
}

/// Sampling rule from the watcher configuration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SamplingRule {
    application: Option<String>,
    component: Option<String>,
    probability: Option<f64>,
    /// Serialized sampling annotation applied when the rule matches
    value: String,
}

impl SamplingRule {
    fn parse_all(raw: &[Value]) -> Vec<SamplingRule> {
        raw.iter()
            .filter_map(|value| match SamplingRule::parse(value) {
                Ok(rule) => Some(rule),
                Err(reason) => {
                    warn!(rule = %value, reason = %reason, "Cannot parse sampling rule");
                    None
                }
            })
            .collect()
    }

    fn parse(value: &Value) -> Result<SamplingRule, String> {
        let rule: SamplingRule = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;

        if let Some(probability) = rule.probability {
            if !(0.0..=1.0).contains(&probability) {
                return Err("`probability` must be between 0 and 1".to_string());
            }
        }
        serde_json::from_str::<Value>(&rule.value).map_err(|e| e.to_string())?;

        Ok(rule)
    }

    fn matches(&self, target: &LogTarget) -> bool {
        if let Some(application) = &self.application {
            if *application != target.application {
                return false;
            }
        }
        if let Some(component) = &self.component {
            if target.component.as_deref() != Some(component.as_str()) {
                return false;
            }
        }
        if let Some(probability) = self.probability {
            // Stable per container so that a container stays in or out of the sample
            let bucket = crc32fast::hash(target.container_id.as_bytes()) % 100 + 1;
            if f64::from(bucket) > probability * 100.0 {
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct JournaldMonitor {
    module: &'static str,
    monitor_log_write_rate: u64,
    monitor_log_max_write_burst: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    journal_path: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    attributes: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    extra_fields: serde_json::Map<String, Value>,
}

impl JournaldMonitor {
    fn from_settings(settings: &ScalyrSettings) -> Result<Option<Self>, AgentError> {
        if !settings.journald {
            return Ok(None);
        }

        let object = |raw: &str, variable: &str| {
            serde_json::from_str::<serde_json::Map<String, Value>>(raw).map_err(|e| AgentError::Init {
                agent: NAME,
                reason: format!("{} must be a JSON object: {}", variable, e),
            })
        };

        Ok(Some(Self {
            module: JOURNALD_MONITOR_MODULE,
            monitor_log_write_rate: settings.journald_write_rate,
            monitor_log_max_write_burst: settings.journald_write_burst,
            journal_path: settings.journald_path.clone(),
            attributes: object(&settings.journald_attributes, "WATCHER_SCALYR_JOURNALD_ATTRIBUTES")?,
            extra_fields: object(&settings.journald_extra_fields, "WATCHER_SCALYR_JOURNALD_EXTRA_FIELDS")?,
        }))
    }
}

/// One entry of the `logs` list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalyrLog {
    pub path: PathBuf,
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_rules: Option<Value>,
    pub redaction_rules: Vec<Value>,
    pub parse_lines_as_json: bool,
}

#[derive(Serialize)]
struct ScalyrConfigDocument<'a> {
    api_key: &'a str,
    implicit_metric_monitor: bool,
    implicit_agent_process_metrics_monitor: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    scalyr_server: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    enable_profiling: bool,
    server_attributes: &'a BTreeMap<String, String>,
    logs: Vec<&'a ScalyrLog>,
    monitors: Vec<&'a JournaldMonitor>,
}

/// What was last written to the config file
#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedState {
    paths: BTreeSet<PathBuf>,
    api_key: String,
}

pub struct ScalyrAgent {
    api_key_file: PathBuf,
    dest_path: PathBuf,
    config_path: PathBuf,
    server: Option<String>,
    enable_profiling: bool,
    json_parsers: BTreeMap<String, String>,
    journald: Option<JournaldMonitor>,
    server_attributes: BTreeMap<String, String>,
    sampling_rules: Vec<SamplingRule>,
    logs: BTreeMap<String, ScalyrLog>,
    applied: Option<AppliedState>,
}

impl ScalyrAgent {
    pub fn new(
        settings: &ScalyrSettings,
        cluster: &ClusterSettings,
        watcher_config: &WatcherConfig,
    ) -> Result<Self, AgentError> {
        let init_error = |reason: String| AgentError::Init { agent: NAME, reason };

        let (Some(api_key_file), Some(dest_path)) = (&settings.api_key_file, &settings.dest_path)
        else {
            return Err(init_error(
                "Env variables WATCHER_SCALYR_API_KEY_FILE and WATCHER_SCALYR_DEST_PATH must be set."
                    .to_string(),
            ));
        };

        let config_dir = settings.config_path.parent().unwrap_or(Path::new("/"));
        if !config_dir.is_dir() {
            return Err(init_error(format!(
                "{} config path does not exist.",
                settings.config_path.display()
            )));
        }
        if !api_key_file.is_file() {
            return Err(init_error(format!(
                "{} API key file does not exist.",
                api_key_file.display()
            )));
        }
        if !dest_path.is_dir() {
            return Err(init_error(format!(
                "{} destination path does not exist.",
                dest_path.display()
            )));
        }

        let watched = fs::read_dir(dest_path)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0);
        info!(count = watched, "Scalyr watcher agent found watched containers");

        let mut server_attributes = BTreeMap::new();
        if let Some(cluster_id) = &cluster.cluster_id {
            server_attributes.insert("serverHost".to_string(), cluster_id.clone());
            server_attributes.insert("cluster".to_string(), cluster_id.clone());
        }
        server_attributes.insert("cluster_environment".to_string(), cluster.environment.clone());
        server_attributes.insert("environment".to_string(), cluster.environment.clone());
        server_attributes.insert("cluster_alias".to_string(), cluster.alias.clone());
        server_attributes.insert(
            "node".to_string(),
            cluster.node_name.clone().unwrap_or_else(|| "unknown".to_string()),
        );
        server_attributes.insert("parser".to_string(), SCALYR_DEFAULT_PARSER.to_string());

        let agent = Self {
            api_key_file: api_key_file.clone(),
            dest_path: dest_path.clone(),
            config_path: settings.config_path.clone(),
            server: settings.server.clone(),
            enable_profiling: settings.enable_profiling,
            json_parsers: json_parsers_mapping(&settings.parse_lines_json),
            journald: JournaldMonitor::from_settings(settings)?,
            server_attributes,
            sampling_rules: SamplingRule::parse_all(&watcher_config.scalyr_sampling_rules),
            logs: BTreeMap::new(),
            applied: None,
        };

        info!("Scalyr watcher agent initialization complete!");
        Ok(agent)
    }

    /// Current log entries keyed by container id
    pub fn logs(&self) -> &BTreeMap<String, ScalyrLog> {
        &self.logs
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Create the friendly symlink for the target's log file.
    ///
    /// Returns `None` when the source log is gone or the link cannot be made.
    fn link_log_file(&self, target: &LogTarget) -> Option<PathBuf> {
        if !target.log_file_path.exists() {
            return None;
        }

        let parent = self.dest_path.join(&target.id);
        let link = parent.join(target.friendly_log_name());

        let linked = fs::create_dir_all(&parent).and_then(|_| {
            if is_symlink(&link) {
                Ok(())
            } else {
                std::os::unix::fs::symlink(&target.log_file_path, &link)
            }
        });

        match linked {
            Ok(()) => Some(link),
            Err(e) => {
                warn!(container_id = %target.id, link = %link.display(), error = %e, "Scalyr watcher agent failed to adjust log path");
                None
            }
        }
    }

    fn parser_for(&self, annotations: &BTreeMap<String, String>, target: &LogTarget) -> (String, bool) {
        let parser = container_annotation(annotations, target, SCALYR_ANNOTATION_PARSER, "parser")
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| SCALYR_DEFAULT_PARSER.to_string());

        if let Some(alias) = self.json_parsers.get(&parser) {
            (alias.clone(), true)
        } else {
            let parse_all = self.json_parsers.contains_key("*");
            (parser, parse_all)
        }
    }

    fn attributes_for(&self, target: &LogTarget, parser: String) -> BTreeMap<String, String> {
        let candidates = [
            ("application", Some(target.application.clone())),
            ("component", target.component.clone()),
            ("environment", Some(target.environment.clone())),
            ("version", Some(target.version.clone())),
            ("release", Some(target.release.clone())),
            ("pod", Some(target.pod_name.clone())),
            ("namespace", Some(target.namespace.clone())),
            ("container", Some(target.container_name.clone())),
            ("container_id", Some(target.container_id.clone())),
            ("parser", Some(parser)),
        ];

        // Only keep values not already carried by the server attributes
        candidates
            .into_iter()
            .filter_map(|(key, value)| {
                let value = value.filter(|v| !v.is_empty())?;
                if self.server_attributes.get(key) == Some(&value) {
                    None
                } else {
                    Some((key.to_string(), value))
                }
            })
            .collect()
    }

    fn render(&self, api_key: &str) -> Result<Vec<u8>, AgentError> {
        let document = ScalyrConfigDocument {
            api_key,
            implicit_metric_monitor: false,
            implicit_agent_process_metrics_monitor: false,
            scalyr_server: self.server.as_deref(),
            enable_profiling: self.enable_profiling,
            server_attributes: &self.server_attributes,
            logs: self.logs.values().collect(),
            monitors: self.journald.iter().collect(),
        };

        serde_json::to_vec_pretty(&document).map_err(|source| AgentError::Render { agent: NAME, source })
    }
}

impl OutputAgent for ScalyrAgent {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_run(&self) -> bool {
        self.applied.is_none()
    }

    fn add_log_target(&mut self, target: &LogTarget) -> Result<(), AgentError> {
        let Some(path) = self.link_log_file(target) else {
            warn!(
                container = %target.container_name,
                pod = %target.pod_name,
                "Scalyr watcher agent skipped log config for container"
            );
            return Ok(());
        };

        let mut annotations = target.pod_annotations.clone();
        let (parser, parse_lines_as_json) = self.parser_for(&annotations, target);
        let attributes = self.attributes_for(target, parser);

        if let Some(rule) = self.sampling_rules.iter().find(|rule| rule.matches(target)) {
            warn!(
                container_id = %target.container_id,
                application = %target.application,
                component = ?target.component,
                "Overwriting container sampling annotation"
            );
            annotations.insert(SCALYR_ANNOTATION_SAMPLING_RULES.to_string(), rule.value.clone());
        }

        let log = ScalyrLog {
            path,
            attributes,
            sampling_rules: container_annotation(
                &annotations,
                target,
                SCALYR_ANNOTATION_SAMPLING_RULES,
                "sampling-rules",
            ),
            redaction_rules: redaction_rules(&annotations, target),
            parse_lines_as_json,
        };

        self.logs.insert(target.id.clone(), log);
        Ok(())
    }

    fn remove_log_target(&mut self, container_id: &str) -> Result<(), AgentError> {
        if self.logs.remove(container_id).is_none() {
            warn!(container_id = %container_id, "Failed to remove log target");
        }

        let container_dir = self.dest_path.join(container_id);
        if let Err(e) = remove_dir_if_exists(&container_dir) {
            warn!(path = %container_dir.display(), error = %e, "Scalyr watcher agent failed to remove container directory");
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), AgentError> {
        let api_key = fs::read_to_string(&self.api_key_file)
            .map_err(|e| AgentError::io(NAME, "read API key file", &self.api_key_file, e))?
            .trim()
            .to_string();

        let desired = AppliedState {
            paths: self.logs.values().map(|log| log.path.clone()).collect(),
            api_key,
        };

        let previous = self.applied.as_ref();
        if previous == Some(&desired) {
            debug!("Scalyr watcher agent config unchanged");
            return Ok(());
        }

        let (added, removed) = match previous {
            Some(previous) => {
                if previous.api_key != desired.api_key {
                    info!("Scalyr API key updated");
                }
                (
                    desired.paths.difference(&previous.paths).count(),
                    previous.paths.difference(&desired.paths).count(),
                )
            }
            None => (desired.paths.len(), 0),
        };

        let rendered = self.render(&desired.api_key)?;
        write_atomically(&self.config_path, &rendered)
            .map_err(|e| AgentError::io(NAME, "write config file", &self.config_path, e))?;

        info!(
            config_path = %self.config_path.display(),
            added,
            removed,
            "Scalyr watcher agent updated config file"
        );

        self.applied = Some(desired);
        Ok(())
    }
}

fn json_parsers_mapping(parameter: &str) -> BTreeMap<String, String> {
    parameter
        .split(',')
        .filter_map(|parser| {
            let (key, value) = parser.split_once('=').unwrap_or((parser, parser));
            let (key, value) = (key.trim(), value.trim());
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Look up `result_key` of this container's entry in a JSON list annotation
fn container_annotation(
    annotations: &BTreeMap<String, String>,
    target: &LogTarget,
    annotation_key: &str,
    result_key: &str,
) -> Option<Value> {
    let raw = annotations.get(annotation_key)?;

    let candidates = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(candidates)) => candidates,
        Ok(other) => {
            warn!(
                annotation = %annotation_key,
                pod = %target.pod_name,
                found = %other,
                "Scalyr watcher agent found invalid annotation, expected a list"
            );
            return None;
        }
        Err(e) => {
            warn!(
                annotation = %annotation_key,
                container = %target.container_name,
                pod = %target.pod_name,
                error = %e,
                "Scalyr watcher agent failed to load annotation"
            );
            return None;
        }
    };

    candidates
        .iter()
        .find(|candidate| candidate.get("container").and_then(Value::as_str) == Some(target.container_name.as_str()))
        .and_then(|candidate| candidate.get(result_key).cloned())
}

fn redaction_rules(annotations: &BTreeMap<String, String>, target: &LogTarget) -> Vec<Value> {
    let mut rules = match container_annotation(annotations, target, SCALYR_ANNOTATION_REDACTION_RULES, "redaction-rules") {
        None => Vec::new(),
        Some(Value::Array(rules)) => rules,
        Some(other) => {
            warn!(
                pod = %target.pod_name,
                container = %target.container_name,
                found = %other,
                "Scalyr watcher agent found invalid redaction rule annotation, expected a list"
            );
            Vec::new()
        }
    };

    let (match_expression, replacement) = JWT_REDACTION_RULE;
    rules.push(serde_json::json!({
        "match_expression": match_expression,
        "replacement": replacement,
    }));
    rules
}
