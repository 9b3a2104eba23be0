//! Log target building
//!
//! Turns a discovered container and the metadata of its pod into a
//! [`LogTarget`], or an explicit [`SkipReason`].

use crate::error::KubeError;
use crate::models::{ContainerDescriptor, LogTarget};
use crate::pods::{is_pause_container, PodResolver, DEFAULT_NAMESPACE};
use crate::settings::WatcherSettings;
use std::path::PathBuf;
use tracing::{error, warn};

pub const APP_LABEL: &str = "application";
pub const COMPONENT_LABEL: &str = "component";
pub const ENVIRONMENT_LABEL: &str = "environment";
pub const VERSION_LABEL: &str = "version";
pub const RELEASE_LABEL: &str = "release";

/// Why a container produced no log target
#[derive(Debug, thiserror::Error)]
pub enum SkipReason {
    #[error("pause container")]
    PauseContainer,

    #[error("container has no pod name label")]
    NoPodName,

    #[error("pod {pod} cannot be resolved: {source}")]
    PodUnresolved {
        pod: String,
        #[source]
        source: KubeError,
    },

    #[error("labels {required} are required in pod {pod}")]
    MissingLabels { pod: String, required: String },
}

impl SkipReason {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::PauseContainer => "pause_container",
            SkipReason::NoPodName => "no_pod_name",
            SkipReason::PodUnresolved { .. } => "pod_unresolved",
            SkipReason::MissingLabels { .. } => "missing_labels",
        }
    }

    /// True when the pod lookup failed for any reason other than a missing pod
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            SkipReason::PodUnresolved {
                source: KubeError::Request(_) | KubeError::Client(_) | KubeError::Timeout { .. },
                ..
            }
        )
    }
}

/// Builds log targets for newly discovered containers
pub struct LogTargetBuilder<'a> {
    resolver: &'a dyn PodResolver,
    settings: &'a WatcherSettings,
}

impl<'a> LogTargetBuilder<'a> {
    pub fn new(resolver: &'a dyn PodResolver, settings: &'a WatcherSettings) -> Self {
        Self { resolver, settings }
    }

    /// Build the target for a single container
    pub async fn build(&self, container: &ContainerDescriptor) -> Result<LogTarget, SkipReason> {
        let runtime = container.runtime();

        if is_pause_container(runtime) {
            return Err(SkipReason::PauseContainer);
        }

        let pod_name = runtime
            .label_value("pod.name")
            .ok_or(SkipReason::NoPodName)?
            .to_string();
        let container_name = runtime
            .label_value("container.name")
            .unwrap_or_default()
            .to_string();
        let namespace = runtime
            .label_value("pod.namespace")
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();

        let pod = self
            .resolver
            .get_pod(&pod_name, &namespace)
            .await
            .map_err(|source| SkipReason::PodUnresolved {
                pod: pod_name.clone(),
                source,
            })?;

        let strict_labels = &self.settings.strict_labels;
        if strict_labels
            .iter()
            .any(|label| !pod.labels.contains_key(label))
        {
            return Err(SkipReason::MissingLabels {
                pod: pod_name,
                required: strict_labels.join(","),
            });
        }

        let label = |key: &str| pod.labels.get(key).cloned();
        let (image, image_version) = runtime.image_parts();
        let cluster = &self.settings.cluster;

        Ok(LogTarget {
            id: container.id.clone(),
            container_id: container.id.clone(),
            container_name,
            container_path: self.settings.containers_path.join(&container.id),
            log_file_name: container
                .log_file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            log_file_path: PathBuf::from(&container.log_file),
            image,
            image_version,
            application: label(APP_LABEL).unwrap_or_default(),
            component: label(COMPONENT_LABEL),
            environment: label(ENVIRONMENT_LABEL).unwrap_or_else(|| cluster.environment.clone()),
            version: label(VERSION_LABEL).unwrap_or_default(),
            release: label(RELEASE_LABEL).unwrap_or_default(),
            cluster_id: cluster.cluster_id.clone(),
            pod_name,
            namespace,
            node_name: cluster.node_name.clone(),
            pod_labels: pod.labels,
            pod_annotations: pod.annotations,
        })
    }

    /// Build targets for a batch, skipping containers that cannot be followed.
    ///
    /// Returns the targets and the skip reasons, one per skipped container.
    pub async fn build_all(
        &self,
        containers: &[&ContainerDescriptor],
    ) -> (Vec<LogTarget>, Vec<SkipReason>) {
        let mut targets = Vec::with_capacity(containers.len());
        let mut skipped = Vec::new();

        for container in containers {
            match self.build(container).await {
                Ok(target) => targets.push(target),
                Err(reason) => {
                    log_skip(container, &reason);
                    skipped.push(reason);
                }
            }
        }

        (targets, skipped)
    }
}

fn log_skip(container: &ContainerDescriptor, reason: &SkipReason) {
    match reason {
        SkipReason::PauseContainer => {}
        SkipReason::PodUnresolved { source, pod } if reason.is_lookup_failure() => {
            error!(container_id = %container.id, pod = %pod, error = %source, "Failed to get pod");
        }
        _ => {
            warn!(container_id = %container.id, reason = %reason, "Skipping container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerConfig, PodMetadata, RuntimeConfig};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};

    struct StaticPods(HashMap<(String, String), PodMetadata>);

    #[async_trait]
    impl PodResolver for StaticPods {
        async fn get_pod(&self, name: &str, namespace: &str) -> Result<PodMetadata, KubeError> {
            self.0
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| KubeError::PodNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
        }
    }

    fn pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> ((String, String), PodMetadata) {
        let metadata = PodMetadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::from([("owner".to_string(), "team-a".to_string())]),
        };
        ((namespace.to_string(), name.to_string()), metadata)
    }

    fn pods(entries: Vec<((String, String), PodMetadata)>) -> StaticPods {
        StaticPods(entries.into_iter().collect())
    }

    fn container(id: &str, pod: &str, image: &str) -> ContainerDescriptor {
        ContainerDescriptor {
            id: id.to_string(),
            config: ContainerConfig {
                config: RuntimeConfig {
                    image: Some(image.to_string()),
                    labels: Some(BTreeMap::from([
                        ("io.kubernetes.pod.name".to_string(), pod.to_string()),
                        ("io.kubernetes.pod.namespace".to_string(), "default".to_string()),
                        ("io.kubernetes.container.name".to_string(), format!("{}-main", id)),
                    ])),
                },
            },
            log_file: PathBuf::from(format!("/mnt/containers/{id}/{id}-json.log")),
        }
    }

    fn settings() -> WatcherSettings {
        let mut settings = WatcherSettings::default();
        settings.cluster.cluster_id = Some("kube-cluster".to_string());
        settings.cluster.node_name = Some("node-1".to_string());
        settings
    }

    #[tokio::test]
    async fn test_build_target_fields() {
        let resolver = pods(vec![pod("default", "p1", &[("application", "svc"), ("version", "1.2")])]);
        let settings = settings();
        let builder = LogTargetBuilder::new(&resolver, &settings);

        let target = builder
            .build(&container("c1", "p1", "registry.example.org/svc:1.2"))
            .await
            .unwrap();

        assert_eq!(target.id, "c1");
        assert_eq!(target.application, "svc");
        assert_eq!(target.version, "1.2");
        assert_eq!(target.component, None);
        assert_eq!(target.release, "");
        assert_eq!(target.environment, "production");
        assert_eq!(target.pod_name, "p1");
        assert_eq!(target.namespace, "default");
        assert_eq!(target.container_name, "c1-main");
        assert_eq!(target.image, "svc");
        assert_eq!(target.image_version, "1.2");
        assert_eq!(target.cluster_id.as_deref(), Some("kube-cluster"));
        assert_eq!(target.node_name.as_deref(), Some("node-1"));
        assert_eq!(target.container_path, PathBuf::from("/mnt/containers/c1"));
        assert_eq!(target.log_file_name, "c1-json.log");
        assert_eq!(target.pod_annotations["owner"], "team-a");
        assert_eq!(target.friendly_log_name(), "svc-1.2.log");
    }

    #[tokio::test]
    async fn test_build_target_environment_label_wins() {
        let resolver = pods(vec![pod("default", "p1", &[("environment", "staging")])]);
        let settings = settings();
        let builder = LogTargetBuilder::new(&resolver, &settings);

        let target = builder.build(&container("c1", "p1", "app")).await.unwrap();
        assert_eq!(target.environment, "staging");
        assert_eq!(target.application, "");
        assert_eq!(target.image_version, "latest");
    }

    #[tokio::test]
    async fn test_build_skips_pause_container() {
        let resolver = pods(vec![pod("default", "p1", &[])]);
        let settings = settings();
        let builder = LogTargetBuilder::new(&resolver, &settings);

        let result = builder
            .build(&container("c1", "p1", "gcr.io/google_containers/pause-123"))
            .await;
        assert!(matches!(result, Err(SkipReason::PauseContainer)));
    }

    #[tokio::test]
    async fn test_build_skips_unknown_pod() {
        let resolver = pods(vec![]);
        let settings = settings();
        let builder = LogTargetBuilder::new(&resolver, &settings);

        let result = builder.build(&container("c1", "p1", "app")).await;
        assert!(matches!(
            result,
            Err(SkipReason::PodUnresolved {
                source: KubeError::PodNotFound { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_lookup_failures_exclude_missing_pods() {
        let unresolved = |source: KubeError| SkipReason::PodUnresolved {
            pod: "p1".to_string(),
            source,
        };

        assert!(unresolved(KubeError::Timeout {
            namespace: "default".to_string(),
            name: "p1".to_string(),
        })
        .is_lookup_failure());
        assert!(unresolved(KubeError::Request("connection refused".to_string())).is_lookup_failure());
        assert!(unresolved(KubeError::Client("no token".to_string())).is_lookup_failure());
        assert!(!unresolved(KubeError::PodNotFound {
            namespace: "default".to_string(),
            name: "p1".to_string(),
        })
        .is_lookup_failure());
        assert!(!SkipReason::NoPodName.is_lookup_failure());
    }

    #[tokio::test]
    async fn test_build_enforces_strict_labels() {
        let resolver = pods(vec![
            pod("default", "p1", &[("application", "svc")]),
            pod("default", "p2", &[("application", "svc"), ("team", "logging")]),
        ]);
        let mut settings = settings();
        settings.strict_labels = vec!["team".to_string()];
        let builder = LogTargetBuilder::new(&resolver, &settings);

        let result = builder.build(&container("c1", "p1", "app")).await;
        assert!(matches!(result, Err(SkipReason::MissingLabels { .. })));

        assert!(builder.build(&container("c2", "p2", "app")).await.is_ok());
    }

    #[tokio::test]
    async fn test_build_all_continues_after_skips() {
        let resolver = pods(vec![
            pod("default", "pod-1", &[("application", "app-1"), ("version", "v1")]),
            pod("default", "pod-4", &[("application", "app-2"), ("version", "v1")]),
        ]);
        let settings = settings();
        let builder = LogTargetBuilder::new(&resolver, &settings);

        let containers = [
            container("cont-1", "pod-1", "app-1:v1"),
            container("cont-2", "pod-1", "gcr.io/google_containers/pause-123"),
            container("cont-3", "pod-2", "app-1"),
            container("cont-5", "pod-4", "app-2"),
        ];
        let refs: Vec<&ContainerDescriptor> = containers.iter().collect();

        let (targets, skipped) = builder.build_all(&refs).await;

        let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["cont-1", "cont-5"]);
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[0].kind(), "pause_container");
        assert_eq!(skipped[1].kind(), "pod_unresolved");
    }
}
