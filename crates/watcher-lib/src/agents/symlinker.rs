//! Symlinker agent
//!
//! Creates one symlink per container log with all metadata embedded in the
//! link path, for shippers that only watch a directory tree. No
//! configuration file is written.

use super::{is_symlink, remove_dir_if_exists, OutputAgent};
use crate::error::{AgentError, SettingsError};
use crate::models::LogTarget;
use crate::settings::load_env_settings;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const NAME: &str = "Symlinker";

/// Symlinker settings, read from `WATCHER_SYMLINK_*`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymlinkerSettings {
    pub dir: Option<PathBuf>,
}

impl SymlinkerSettings {
    pub fn from_env(source: Option<config::Map<String, String>>) -> Result<Self, SettingsError> {
        load_env_settings("Symlinker", "WATCHER_SYMLINK", source)
    }
}

/// Replace every character outside `[a-zA-Z0-9_-]` with `_`
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

pub struct Symlinker {
    symlink_dir: PathBuf,
    first_run: bool,
}

impl Symlinker {
    pub fn new(settings: &SymlinkerSettings) -> Result<Self, AgentError> {
        let Some(symlink_dir) = &settings.dir else {
            return Err(AgentError::Init {
                agent: NAME,
                reason: "Env variable WATCHER_SYMLINK_DIR must be set".to_string(),
            });
        };

        if !symlink_dir.is_dir() {
            return Err(AgentError::Init {
                agent: NAME,
                reason: format!("Symlink base directory {} does not exist", symlink_dir.display()),
            });
        }

        info!("Symlinker watcher agent initialized");
        Ok(Self {
            symlink_dir: symlink_dir.clone(),
            first_run: true,
        })
    }

    fn container_dir(&self, container_id: &str) -> PathBuf {
        self.symlink_dir.join(sanitize(container_id))
    }

    /// `<dir>/<id>/<app>/<component>/<namespace>/<env>/<version>/<container>/<pod>.log`
    pub fn link_path(&self, target: &LogTarget) -> PathBuf {
        let component = target
            .component
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&target.application);
        let version = if target.version.is_empty() { "none" } else { &target.version };

        let mut link = self.container_dir(&target.container_id);
        for segment in [
            target.application.as_str(),
            component,
            target.namespace.as_str(),
            target.environment.as_str(),
            version,
            target.container_name.as_str(),
        ] {
            link.push(sanitize(segment));
        }
        link.push(format!("{}.log", sanitize(&target.pod_name)));
        link
    }
}

impl OutputAgent for Symlinker {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_run(&self) -> bool {
        self.first_run
    }

    fn add_log_target(&mut self, target: &LogTarget) -> Result<(), AgentError> {
        debug!(container_id = %target.id, "Symlinker: add_log_target called");

        if !target.log_file_path.exists() {
            warn!(container_id = %target.id, log_file = %target.log_file_path.display(), "Symlinker: log file does not exist, skipping");
            return Ok(());
        }

        let top_dir = self.container_dir(&target.container_id);
        let link = self.link_path(target);

        if top_dir.exists() {
            if is_symlink(&link) && fs::read_link(&link).ok().as_deref() == Some(target.log_file_path.as_path()) {
                debug!(container_id = %target.id, "Symlinker: link already exists. Nothing to be done.");
                return Ok(());
            }

            info!(container_id = %target.id, "Symlinker: metadata has changed. Creating new symlink.");
            remove_dir_if_exists(&top_dir).map_err(|e| AgentError::io(NAME, "remove directory", &top_dir, e))?;
        }

        if let Some(link_dir) = link.parent() {
            fs::create_dir_all(link_dir).map_err(|e| AgentError::io(NAME, "create directory", link_dir, e))?;
        }
        std::os::unix::fs::symlink(&target.log_file_path, &link)
            .map_err(|e| AgentError::io(NAME, "create symlink", &link, e))?;

        debug!(link = %link.display(), log_file = %target.log_file_path.display(), "Symlinker: created symlink");
        Ok(())
    }

    fn remove_log_target(&mut self, container_id: &str) -> Result<(), AgentError> {
        let link_dir = self.container_dir(container_id);
        remove_dir_if_exists(&link_dir).map_err(|e| AgentError::io(NAME, "remove link directory", &link_dir, e))?;
        debug!(path = %link_dir.display(), "Symlinker: removed directory");
        Ok(())
    }

    /// Prune container directories without a live link
    fn flush(&mut self) -> Result<(), AgentError> {
        let entries = fs::read_dir(&self.symlink_dir)
            .map_err(|e| AgentError::io(NAME, "read directory", &self.symlink_dir, e))?;

        for entry in entries.filter_map(Result::ok) {
            let container_dir = entry.path();
            if !container_dir.is_dir() || has_live_link(&container_dir) {
                continue;
            }

            debug!(path = %container_dir.display(), "Symlinker: pruning container directory without live link");
            remove_dir_if_exists(&container_dir)
                .map_err(|e| AgentError::io(NAME, "remove directory", &container_dir, e))?;
        }

        self.first_run = false;
        Ok(())
    }
}

/// True if any `*.log` below `dir` resolves to an existing file
fn has_live_link(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };

    entries.filter_map(Result::ok).any(|entry| {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            has_live_link(&path)
        } else {
            path.extension().is_some_and(|ext| ext == "log") && path.exists()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::log_target;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        agent: Symlinker,
        target: LogTarget,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let container_dir = dir.path().join("containers/container-1");
        fs::create_dir_all(&container_dir).unwrap();
        fs::write(container_dir.join("container-1-json.log"), "foo").unwrap();
        fs::create_dir_all(dir.path().join("links")).unwrap();

        let mut target = log_target("container-1", container_dir.join("container-1-json.log"));
        target.application = "app/with/slashes".to_string();
        target.component = Some("comp with spaces".to_string());
        target.environment = "test".to_string();
        target.version = "v1.5".to_string();
        target.pod_name = "pod-123".to_string();

        let agent = Symlinker::new(&SymlinkerSettings {
            dir: Some(dir.path().join("links")),
        })
        .unwrap();

        Fixture { dir, agent, target }
    }

    fn expected_link(fixture: &Fixture) -> PathBuf {
        fixture
            .dir
            .path()
            .join("links/container-1/app_with_slashes/comp_with_spaces/default/test/v1_5/app-1-container-1/pod-123.log")
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("app/with/slashes"), "app_with_slashes");
        assert_eq!(sanitize("v1.5"), "v1_5");
        assert_eq!(sanitize("keep-this_one9"), "keep-this_one9");
    }

    #[test]
    fn test_new_requires_existing_dir() {
        assert!(Symlinker::new(&SymlinkerSettings::default()).is_err());
        assert!(Symlinker::new(&SymlinkerSettings {
            dir: Some(PathBuf::from("/nonexistent/links")),
        })
        .is_err());
    }

    #[test]
    fn test_settings_from_env() {
        let source = config::Map::from([("WATCHER_SYMLINK_DIR".to_string(), "/var/log/links".to_string())]);
        let settings = SymlinkerSettings::from_env(Some(source)).unwrap();
        assert_eq!(settings.dir, Some(PathBuf::from("/var/log/links")));
    }

    #[test]
    fn test_first_run_cleared_by_successful_flush() {
        let mut fx = fixture();
        let target = fx.target.clone();
        assert!(fx.agent.first_run());

        fx.agent.add_log_target(&target).unwrap();
        assert!(fx.agent.first_run());

        fx.agent.flush().unwrap();
        assert!(!fx.agent.first_run());
    }

    #[test]
    fn test_failed_flush_keeps_first_run() {
        let mut fx = fixture();
        fs::remove_dir_all(fx.dir.path().join("links")).unwrap();

        assert!(fx.agent.flush().is_err());
        assert!(fx.agent.first_run());
    }

    #[test]
    fn test_add_log_target() {
        let mut fx = fixture();
        let target = fx.target.clone();

        fx.agent.add_log_target(&target).unwrap();
        fx.agent.flush().unwrap();

        let link = expected_link(&fx);
        assert!(is_symlink(&link));
        assert_eq!(fs::read_to_string(&link).unwrap(), "foo");
    }

    #[test]
    fn test_add_log_target_twice() {
        let mut fx = fixture();
        let target = fx.target.clone();

        fx.agent.add_log_target(&target).unwrap();
        fx.agent.add_log_target(&target).unwrap();

        assert_eq!(fs::read_to_string(expected_link(&fx)).unwrap(), "foo");
    }

    #[test]
    fn test_changed_metadata_replaces_link() {
        let mut fx = fixture();
        let mut target = fx.target.clone();
        fx.agent.add_log_target(&target).unwrap();

        target.version = "v2".to_string();
        fx.agent.add_log_target(&target).unwrap();

        assert!(!expected_link(&fx).exists());
        assert!(is_symlink(&fx.agent.link_path(&target)));
    }

    #[test]
    fn test_component_and_version_fallbacks() {
        let fx = fixture();
        let mut target = fx.target.clone();
        target.component = None;
        target.version = String::new();

        let link = fx.agent.link_path(&target);
        assert!(link.ends_with("container-1/app_with_slashes/app_with_slashes/default/test/none/app-1-container-1/pod-123.log"));
    }

    #[test]
    fn test_remove_log_target() {
        let mut fx = fixture();
        let target = fx.target.clone();
        fx.agent.add_log_target(&target).unwrap();

        fx.agent.remove_log_target(&target.id).unwrap();
        assert!(!fx.dir.path().join("links/container-1").exists());

        // Removing a container that was never linked is fine
        fx.agent.remove_log_target("container-unknown").unwrap();
    }

    #[test]
    fn test_add_missing_source_is_skipped() {
        let mut fx = fixture();
        let target = log_target("container-2", fx.dir.path().join("containers/container-2/container-2-json.log"));

        fx.agent.add_log_target(&target).unwrap();
        assert!(!fx.dir.path().join("links/container-2").exists());
    }

    #[test]
    fn test_flush_prunes_dangling_links() {
        let mut fx = fixture();
        let target = fx.target.clone();
        fx.agent.add_log_target(&target).unwrap();
        fs::create_dir_all(fx.dir.path().join("links/empty-container/app")).unwrap();

        fx.agent.flush().unwrap();
        assert!(fx.dir.path().join("links/container-1").exists());
        assert!(!fx.dir.path().join("links/empty-container").exists());

        fs::remove_file(&target.log_file_path).unwrap();
        fx.agent.flush().unwrap();
        assert!(!fx.dir.path().join("links/container-1").exists());
    }
}
