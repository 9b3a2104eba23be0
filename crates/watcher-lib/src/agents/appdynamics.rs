//! AppDynamics agent
//!
//! Writes one analytics job file per container so the AppDynamics machine
//! agent ships that container's log.

use super::OutputAgent;
use crate::error::{AgentError, SettingsError};
use crate::models::LogTarget;
use crate::settings::{load_env_settings, ClusterSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const NAME: &str = "AppDynamics";

pub const APP_NAME_LABEL: &str = "appdynamics_app";
pub const TIER_NAME_LABEL: &str = "appdynamics_tier";

/// AppDynamics agent settings, read from `WATCHER_APPDYNAMICS_*`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppDynamicsSettings {
    pub dest_path: Option<PathBuf>,
}

impl AppDynamicsSettings {
    pub fn from_env(source: Option<config::Map<String, String>>) -> Result<Self, SettingsError> {
        load_env_settings("AppDynamics", "WATCHER_APPDYNAMICS", source)
    }
}

const JOB_FORMAT_VERSION: u32 = 2;

/// Analytics job file read by the machine agent
#[derive(Debug, Serialize)]
struct JobDocument {
    version: u32,
    enabled: bool,
    source: JobSource,
    fields: JobFields,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSource {
    #[serde(rename = "type")]
    kind: &'static str,
    path: String,
    name_glob: String,
    start_at_end: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobFields {
    app_name: Option<String>,
    tier_name: Option<String>,
    cluster: Option<String>,
    node: Option<String>,
    namespace: String,
    pod: String,
    container: String,
    container_id: String,
    application: String,
    version: String,
}

#[derive(Debug, Clone, PartialEq)]
struct JobFile {
    path: PathBuf,
    contents: String,
}

pub struct AppDynamicsAgent {
    dest_path: PathBuf,
    cluster_id: Option<String>,
    jobs: BTreeMap<String, JobFile>,
    first_run: bool,
}

impl AppDynamicsAgent {
    pub fn new(settings: &AppDynamicsSettings, cluster: &ClusterSettings) -> Result<Self, AgentError> {
        let Some(dest_path) = &settings.dest_path else {
            return Err(AgentError::Init {
                agent: NAME,
                reason: "Env variable WATCHER_APPDYNAMICS_DEST_PATH must be set.".to_string(),
            });
        };

        if !dest_path.is_dir() {
            return Err(AgentError::Init {
                agent: NAME,
                reason: format!("{} destination path does not exist.", dest_path.display()),
            });
        }

        info!("AppDynamics watcher agent initialization complete!");

        Ok(Self {
            dest_path: dest_path.clone(),
            cluster_id: cluster.cluster_id.clone(),
            jobs: BTreeMap::new(),
            first_run: true,
        })
    }

    pub fn job_file_path(&self, container_id: &str) -> PathBuf {
        self.dest_path
            .join(format!("container-{}-jobfile.job", container_id))
    }

    fn render(&self, target: &LogTarget) -> Result<String, AgentError> {
        let label = |key: &str| target.pod_labels.get(key).cloned();

        let job = JobDocument {
            version: JOB_FORMAT_VERSION,
            enabled: true,
            source: JobSource {
                kind: "file",
                path: target.container_path.to_string_lossy().into_owned(),
                name_glob: target.log_file_name.clone(),
                start_at_end: false,
            },
            fields: JobFields {
                app_name: label(APP_NAME_LABEL),
                tier_name: label(TIER_NAME_LABEL),
                cluster: self.cluster_id.clone(),
                node: target.node_name.clone(),
                namespace: target.namespace.clone(),
                pod: target.pod_name.clone(),
                container: target.container_name.clone(),
                container_id: target.container_id.clone(),
                application: target.application.clone(),
                version: target.version.clone(),
            },
        };

        serde_yaml::to_string(&job).map_err(|source| AgentError::RenderYaml { agent: NAME, source })
    }
}

impl OutputAgent for AppDynamicsAgent {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_run(&self) -> bool {
        self.first_run
    }

    fn add_log_target(&mut self, target: &LogTarget) -> Result<(), AgentError> {
        let job = JobFile {
            path: self.job_file_path(&target.id),
            contents: self.render(target)?,
        };
        self.jobs.insert(target.id.clone(), job);
        Ok(())
    }

    fn remove_log_target(&mut self, container_id: &str) -> Result<(), AgentError> {
        if self.jobs.remove(container_id).is_none() {
            warn!(container_id = %container_id, "Failed to remove log target");
        }

        let job_file = self.job_file_path(container_id);
        match fs::remove_file(&job_file) {
            Ok(()) => {
                debug!(container_id = %container_id, "AppDynamics watcher agent removed container job file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::io(NAME, "remove job file", job_file, e)),
        }
    }

    fn flush(&mut self) -> Result<(), AgentError> {
        let mut failed = 0;

        for job in self.jobs.values() {
            if !self.first_run && job.path.exists() {
                continue;
            }

            match fs::write(&job.path, &job.contents) {
                Ok(()) => debug!(job_file = %job.path.display(), "AppDynamics watcher agent updated job file"),
                Err(e) => {
                    warn!(job_file = %job.path.display(), error = %e, "AppDynamics watcher agent failed to write job file");
                    failed += 1;
                }
            }
        }

        self.first_run = false;

        if failed > 0 {
            return Err(AgentError::PartialFlush { agent: NAME, failed });
        }
        Ok(())
    }
}
