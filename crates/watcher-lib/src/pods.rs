//! Pod metadata resolution
//!
//! Pods are looked up by name and namespace either through the in-cluster
//! Kubernetes API (service account) or through an API proxy that handles
//! authentication on our behalf.

use crate::error::KubeError;
use crate::models::{PodMetadata, RuntimeConfig};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Upper bound for a single pod lookup
pub const POD_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

const PODS_PATH: &str = "api/v1/namespaces/{namespace}/pods/{name}";

const PAUSE_IMAGE_PREFIXES: &[&str] = &[
    "gcr.io/google_containers/pause",
    "k8s.gcr.io/pause",
    "registry.k8s.io/pause",
];

const SANDBOX_TYPE_LABEL: &str = "io.kubernetes.docker.type";

const USER_AGENT: &str = concat!("kube-log-watcher/", env!("CARGO_PKG_VERSION"));

/// Returns true if the runtime config belongs to a Kubernetes pause (sandbox) container
pub fn is_pause_container(config: &RuntimeConfig) -> bool {
    let image = config.image();
    PAUSE_IMAGE_PREFIXES
        .iter()
        .any(|prefix| image.starts_with(prefix))
        || config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SANDBOX_TYPE_LABEL))
            .is_some_and(|kind| kind == "podsandbox")
}

/// Looks up pod labels and annotations
#[async_trait]
pub trait PodResolver: Send + Sync {
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<PodMetadata, KubeError>;
}

/// Create the resolver matching the configured access mode
pub async fn create_resolver(kube_url: Option<&Url>) -> Result<Arc<dyn PodResolver>, KubeError> {
    match kube_url {
        Some(url) => {
            info!(kube_url = %url, "Resolving pods through API proxy");
            Ok(Arc::new(ProxyPodResolver::new(url.clone())?))
        }
        None => {
            info!("Resolving pods with in-cluster service account");
            Ok(Arc::new(KubeApiPodResolver::in_cluster()?))
        }
    }
}

/// Resolver using the Kubernetes API with the pod's service account
pub struct KubeApiPodResolver {
    client: kube::Client,
    timeout: Duration,
}

impl KubeApiPodResolver {
    pub fn in_cluster() -> Result<Self, KubeError> {
        let config =
            kube::Config::incluster().map_err(|e| KubeError::Client(e.to_string()))?;
        let client =
            kube::Client::try_from(config).map_err(|e| KubeError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeout: POD_LOOKUP_TIMEOUT,
        })
    }
}

#[async_trait]
impl PodResolver for KubeApiPodResolver {
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<PodMetadata, KubeError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let pod = tokio::time::timeout(self.timeout, pods.get_opt(name))
            .await
            .map_err(|_| KubeError::Timeout {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?
            .map_err(|e| KubeError::Request(e.to_string()))?
            .ok_or_else(|| KubeError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        debug!(pod = %name, namespace = %namespace, "Resolved pod");

        Ok(PodMetadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: pod.metadata.labels.unwrap_or_default(),
            annotations: pod.metadata.annotations.unwrap_or_default(),
        })
    }
}

/// Resolver going through an API proxy URL
pub struct ProxyPodResolver {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Default, Deserialize)]
struct PodDocument {
    #[serde(default)]
    metadata: PodDocumentMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PodDocumentMetadata {
    labels: Option<BTreeMap<String, String>>,
    annotations: Option<BTreeMap<String, String>>,
}

impl ProxyPodResolver {
    pub fn new(base_url: Url) -> Result<Self, KubeError> {
        let client = reqwest::Client::builder()
            .timeout(POD_LOOKUP_TIMEOUT)
            .user_agent(USER_AGENT)
            .no_proxy()
            .build()
            .map_err(|e| KubeError::Client(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn pod_url(&self, name: &str, namespace: &str) -> Result<Url, KubeError> {
        let path = PODS_PATH
            .replace("{namespace}", namespace)
            .replace("{name}", name);
        self.base_url
            .join(&path)
            .map_err(|e| KubeError::Request(format!("invalid pod url: {}", e)))
    }
}

#[async_trait]
impl PodResolver for ProxyPodResolver {
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<PodMetadata, KubeError> {
        let url = self.pod_url(name, namespace)?;
        let not_found = || KubeError::PodNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                KubeError::Timeout {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            } else {
                KubeError::Request(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(not_found());
        }
        if !response.status().is_success() {
            return Err(KubeError::Request(format!(
                "API proxy returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KubeError::Request(e.to_string()))?;

        // Proxies may answer with a pod list instead of a single object
        let document = match body.get("items") {
            Some(items) => items.get(0).cloned().ok_or_else(not_found)?,
            None => body,
        };
        let pod: PodDocument =
            serde_json::from_value(document).map_err(|e| KubeError::Request(e.to_string()))?;

        Ok(PodMetadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: pod.metadata.labels.unwrap_or_default(),
            annotations: pod.metadata.annotations.unwrap_or_default(),
        })
    }
}
