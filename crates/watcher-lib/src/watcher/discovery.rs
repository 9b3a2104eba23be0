//! Container discovery
//!
//! Scans the containers directory mounted from the host. Every immediate
//! subdirectory is a container id holding a `config.v2.json` runtime
//! metadata file and a `<id>-json.log` log file.

use crate::error::DiscoveryError;
use crate::models::{ContainerConfig, ContainerDescriptor};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

pub const CONTAINER_CONFIG_FILE: &str = "config.v2.json";

/// Log file name the runtime uses for a container
pub fn log_file_name(container_id: &str) -> String {
    format!("{}-json.log", container_id)
}

/// Return the containers found under `containers_path`.
///
/// Directories missing either file belong to containers still starting or
/// already torn down and are skipped silently. A malformed metadata file
/// only skips its own container.
pub async fn discover_containers(
    containers_path: &Path,
) -> Result<Vec<ContainerDescriptor>, DiscoveryError> {
    let mut entries =
        fs::read_dir(containers_path)
            .await
            .map_err(|source| DiscoveryError::ReadRoot {
                path: containers_path.to_path_buf(),
                source,
            })?;

    let mut containers = Vec::new();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(source) => {
                return Err(DiscoveryError::ReadRoot {
                    path: containers_path.to_path_buf(),
                    source,
                })
            }
        };

        let container_path = entry.path();
        if !fs::metadata(&container_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            continue;
        }

        let container_id = entry.file_name().to_string_lossy().into_owned();
        if let Some(container) = read_container(&container_path, container_id).await {
            containers.push(container);
        }
    }

    info!(count = containers.len(), "Collected configs for containers");

    Ok(containers)
}

async fn read_container(container_path: &Path, container_id: String) -> Option<ContainerDescriptor> {
    let config_path = container_path.join(CONTAINER_CONFIG_FILE);
    let log_file = container_path.join(log_file_name(&container_id));

    if !is_file(&config_path).await || !is_file(&log_file).await {
        debug!(container_id = %container_id, "Container directory incomplete, skipping");
        return None;
    }

    let raw = match fs::read(&config_path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(container_id = %container_id, error = %e, "Failed while retrieving config for container");
            return None;
        }
    };

    let document = match serde_json::from_slice::<serde_json::Value>(&raw) {
        Ok(document) => document,
        Err(e) => {
            warn!(container_id = %container_id, error = %e, "Malformed config for container");
            return None;
        }
    };

    // An empty document carries no metadata yet
    if document.as_object().map_or(true, |fields| fields.is_empty()) {
        debug!(container_id = %container_id, "Empty config for container, skipping");
        return None;
    }

    match serde_json::from_value::<ContainerConfig>(document) {
        Ok(config) => {
            debug!(container_id = %container_id, "Successfully collected config for container");
            Some(ContainerDescriptor {
                id: container_id,
                config,
                log_file,
            })
        }
        Err(e) => {
            warn!(container_id = %container_id, error = %e, "Malformed config for container");
            None
        }
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}
