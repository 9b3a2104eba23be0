//! Core data models for the log watcher

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Image tag used when the runtime image reference carries none
pub const DEFAULT_IMAGE_VERSION: &str = "latest";

/// Container runtime metadata as stored in `config.v2.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Config", default)]
    pub config: RuntimeConfig,
}

/// The `Config` section of the container runtime metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Image", default)]
    pub image: Option<String>,
    #[serde(rename = "Labels", default)]
    pub labels: Option<BTreeMap<String, String>>,
}

impl RuntimeConfig {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or_default()
    }

    /// Value of the first label whose key ends with `suffix`.
    ///
    /// Runtime labels are namespaced, e.g. `io.kubernetes.pod.name`.
    pub fn label_value(&self, suffix: &str) -> Option<&str> {
        self.labels
            .as_ref()?
            .iter()
            .find(|(key, _)| key.ends_with(suffix))
            .map(|(_, value)| value.as_str())
    }

    /// Split `registry/repository[:tag]` into image name and version
    pub fn image_parts(&self) -> (String, String) {
        let name = self.image().rsplit('/').next().unwrap_or_default();
        let parts: Vec<&str> = name.split(':').collect();

        let image = parts.first().copied().unwrap_or_default().to_string();
        let version = if parts.len() > 1 {
            parts[parts.len() - 1].to_string()
        } else {
            DEFAULT_IMAGE_VERSION.to_string()
        };

        (image, version)
    }
}

/// A container found on the mounted runtime directory
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub config: ContainerConfig,
    pub log_file: PathBuf,
}

impl ContainerDescriptor {
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.config.config
    }
}

/// Labels and annotations of the pod owning a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Normalized description of a container log handed to output agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTarget {
    /// Container id, unique within one reconciliation tick
    pub id: String,
    pub container_id: String,
    pub container_name: String,
    pub container_path: PathBuf,
    pub log_file_path: PathBuf,
    pub log_file_name: String,
    pub image: String,
    pub image_version: String,
    pub application: String,
    pub component: Option<String>,
    pub environment: String,
    pub version: String,
    pub release: String,
    pub cluster_id: Option<String>,
    pub pod_name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
}

impl LogTarget {
    /// Human readable log file name: `<application>-<version>.log`
    pub fn friendly_log_name(&self) -> String {
        let application = [self.application.as_str(), self.pod_name.as_str()]
            .into_iter()
            .find(|value| !value.is_empty())
            .unwrap_or("none");
        let version = if self.version.is_empty() {
            "none"
        } else {
            self.version.as_str()
        };

        format!("{}-{}.log", application, version)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A target as built for container `container-1` of pod `pod-1`
    pub fn log_target(id: &str, log_file_path: impl Into<PathBuf>) -> LogTarget {
        let log_file_path = log_file_path.into();
        LogTarget {
            id: id.to_string(),
            container_id: id.to_string(),
            container_name: "app-1-container-1".to_string(),
            container_path: log_file_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default(),
            log_file_name: format!("{}-json.log", id),
            log_file_path,
            image: "app-1".to_string(),
            image_version: "v1".to_string(),
            application: "app-1".to_string(),
            component: None,
            environment: "production".to_string(),
            version: "v1".to_string(),
            release: "2016".to_string(),
            cluster_id: Some("kube-cluster".to_string()),
            pod_name: "pod-1".to_string(),
            namespace: "default".to_string(),
            node_name: Some("node-1".to_string()),
            pod_labels: BTreeMap::new(),
            pod_annotations: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(image: &str) -> RuntimeConfig {
        RuntimeConfig {
            image: Some(image.to_string()),
            labels: Some(BTreeMap::from([
                ("io.kubernetes.pod.name".to_string(), "pod-1".to_string()),
                ("io.kubernetes.pod.namespace".to_string(), "kube".to_string()),
                ("io.kubernetes.container.name".to_string(), "cont-1".to_string()),
            ])),
        }
    }

    #[test]
    fn test_label_value_by_suffix() {
        let config = runtime("nginx");
        assert_eq!(config.label_value("pod.name"), Some("pod-1"));
        assert_eq!(config.label_value("pod.namespace"), Some("kube"));
        assert_eq!(config.label_value("container.name"), Some("cont-1"));
        assert_eq!(config.label_value("pod.uid"), None);

        let unlabeled = RuntimeConfig::default();
        assert_eq!(unlabeled.label_value("pod.name"), None);
    }

    #[test]
    fn test_image_parts() {
        assert_eq!(
            runtime("registry.example.org/team/app:1.2.3").image_parts(),
            ("app".to_string(), "1.2.3".to_string())
        );
        assert_eq!(
            runtime("registry.example.org:5000/app").image_parts(),
            ("app".to_string(), "latest".to_string())
        );
        assert_eq!(
            runtime("nginx").image_parts(),
            ("nginx".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_container_config_parses_null_labels() {
        let config: ContainerConfig =
            serde_json::from_str(r#"{"Config": {"Image": "nginx", "Labels": null}}"#).unwrap();
        assert_eq!(config.config.image(), "nginx");
        assert!(config.config.labels.is_none());

        let config: ContainerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ContainerConfig::default());
    }

    #[test]
    fn test_friendly_log_name() {
        let mut target = fixtures::log_target("c1", "/mnt/containers/c1/c1-json.log");
        target.application = "svc".to_string();
        target.version = "1.2".to_string();
        assert_eq!(target.friendly_log_name(), "svc-1.2.log");

        target.application = String::new();
        target.version = String::new();
        assert_eq!(target.friendly_log_name(), "pod-1-none.log");

        target.pod_name = String::new();
        assert_eq!(target.friendly_log_name(), "none-none.log");
    }
}
