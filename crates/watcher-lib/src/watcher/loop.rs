//! Reconciliation loop
//!
//! Every tick re-reads the watcher configuration, discovers containers,
//! builds targets for the containers not watched yet and applies the delta
//! to each output agent. One tick runs at a time.

use super::discovery::discover_containers;
use super::targets::LogTargetBuilder;
use crate::agents::OutputAgent;
use crate::error::{AgentError, WatcherError};
use crate::health::{components, HealthRegistry};
use crate::models::{ContainerDescriptor, LogTarget};
use crate::observability::{StructuredLogger, WatcherMetrics};
use crate::pods::PodResolver;
use crate::settings::{load_watcher_config, WatcherConfig, WatcherSettings};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Builds the full set of output agents for a watcher configuration
pub type AgentFactory =
    Box<dyn Fn(&WatcherConfig) -> Result<Vec<Box<dyn OutputAgent>>, AgentError> + Send + Sync>;

/// Consecutive failed ticks after which the loop reports itself unhealthy
pub const UNHEALTHY_AFTER_FAILED_TICKS: u32 = 3;

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing watched yet: after startup or a configuration reload
    Bootstrap,
    Steady,
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub discovered: usize,
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed_agents: Vec<&'static str>,
    pub reloaded: bool,
}

/// Containers to add and to remove on this tick
#[derive(Debug)]
pub struct ContainerDelta<'a> {
    pub new: Vec<&'a ContainerDescriptor>,
    pub stale: BTreeSet<String>,
}

/// Split the discovered containers against the watched set
pub fn container_delta<'a>(
    watched: &BTreeSet<String>,
    containers: &'a [ContainerDescriptor],
) -> ContainerDelta<'a> {
    let new = containers
        .iter()
        .filter(|container| !watched.contains(&container.id))
        .collect();

    let existing: BTreeSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
    let stale = watched
        .iter()
        .filter(|id| !existing.contains(id.as_str()))
        .cloned()
        .collect();

    ContainerDelta { new, stale }
}

/// Apply additions and removals to every agent, then flush each one.
///
/// Agents are isolated: a failure is logged and the next agent is still
/// driven. Flush runs even if adding or removing failed. Returns the names
/// of the agents that failed.
pub fn sync_agents(
    agents: &mut [Box<dyn OutputAgent>],
    targets: &[LogTarget],
    stale: &BTreeSet<String>,
) -> Vec<&'static str> {
    let mut failed = Vec::new();

    for agent in agents.iter_mut() {
        let name = agent.name();
        let mut ok = true;

        if let Err(e) = apply_delta(agent.as_mut(), targets, stale) {
            error!(agent = name, error = %e, "Failed to sync log config with agent");
            ok = false;
        }

        if let Err(e) = agent.flush() {
            error!(agent = name, error = %e, "Failed to flush log config with agent");
            ok = false;
        }

        if !ok {
            failed.push(name);
        }
    }

    failed
}

fn apply_delta(
    agent: &mut dyn OutputAgent,
    targets: &[LogTarget],
    stale: &BTreeSet<String>,
) -> Result<(), AgentError> {
    for target in targets {
        agent.add_log_target(target)?;
    }
    for container_id in stale {
        agent.remove_log_target(container_id)?;
    }
    Ok(())
}

/// The reconciliation loop
pub struct WatchLoop {
    settings: WatcherSettings,
    resolver: Arc<dyn PodResolver>,
    agent_factory: AgentFactory,
    agents: Vec<Box<dyn OutputAgent>>,
    watcher_config: WatcherConfig,
    watched: BTreeSet<String>,
    phase: Phase,
    health: HealthRegistry,
    metrics: WatcherMetrics,
    logger: StructuredLogger,
}

impl WatchLoop {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn watched(&self) -> &BTreeSet<String> {
        &self.watched
    }

    pub fn agent_names(&self) -> Vec<&'static str> {
        self.agents.iter().map(|agent| agent.name()).collect()
    }

    /// Run one reconciliation tick
    pub async fn tick(&mut self) -> Result<TickSummary, WatcherError> {
        let start = Instant::now();
        let reloaded = self.reload_config()?;

        let containers = discover_containers(&self.settings.containers_path).await?;
        self.metrics.set_containers_discovered(containers.len());

        let delta = container_delta(&self.watched, &containers);
        let builder = LogTargetBuilder::new(self.resolver.as_ref(), &self.settings);
        let (targets, skipped) = builder.build_all(&delta.new).await;

        for reason in &skipped {
            self.metrics.inc_targets_skipped(reason.kind());
        }

        let failed_agents = sync_agents(&mut self.agents, &targets, &delta.stale);
        for agent in &failed_agents {
            self.metrics.inc_agent_errors(agent);
        }

        self.watched.extend(targets.iter().map(|target| target.id.clone()));
        self.watched.retain(|id| !delta.stale.contains(id));

        if self.phase == Phase::Bootstrap {
            debug!(watched = self.watched.len(), "First sync pass complete");
            self.phase = Phase::Steady;
            self.health.set_ready(true).await;
        }

        let summary = TickSummary {
            discovered: containers.len(),
            added: targets.len(),
            removed: delta.stale.len(),
            skipped: skipped.len(),
            failed_agents,
            reloaded,
        };

        self.record(&summary, start.elapsed()).await;
        Ok(summary)
    }

    /// Rebuild every agent when the watcher configuration changed.
    ///
    /// On failure the previous configuration is kept, so the reload is
    /// attempted again on the next tick.
    fn reload_config(&mut self) -> Result<bool, WatcherError> {
        let latest = load_watcher_config(self.settings.config_file.as_deref());
        if latest == self.watcher_config {
            return Ok(false);
        }

        info!("Reloading agents with new configuration");
        self.agents = (self.agent_factory)(&latest)?;
        self.watcher_config = latest;
        self.watched.clear();
        self.phase = Phase::Bootstrap;

        self.metrics.inc_config_reloads();
        self.logger.log_agents_reloaded(self.agents.len());
        Ok(true)
    }

    async fn record(&self, summary: &TickSummary, elapsed: Duration) {
        self.metrics.observe_tick_duration(elapsed.as_secs_f64());
        self.metrics.set_containers_watched(self.watched.len());
        self.metrics.inc_targets_added(summary.added);
        self.metrics.inc_targets_removed(summary.removed);

        self.health.set_healthy(components::WATCH_LOOP).await;
        if summary.failed_agents.is_empty() {
            self.health.set_healthy(components::AGENTS).await;
        } else {
            self.health
                .set_degraded(
                    components::AGENTS,
                    format!("Agents failed: {}", summary.failed_agents.join(", ")),
                )
                .await;
        }

        self.logger.log_sync(
            summary.added,
            summary.removed,
            summary.skipped,
            &summary.failed_agents,
        );
    }

    async fn record_failure(&self, error: &WatcherError, failed_ticks: u32) {
        self.metrics.inc_tick_errors();

        let message = format!("{} consecutive failed ticks, last error: {}", failed_ticks, error);
        if failed_ticks >= UNHEALTHY_AFTER_FAILED_TICKS {
            self.health.set_unhealthy(components::WATCH_LOOP, message).await;
        } else {
            self.health.set_degraded(components::WATCH_LOOP, message).await;
        }
    }

    /// Tick until `shutdown` fires.
    ///
    /// A failed tick is retried after half the interval. The loop turns
    /// degraded on the first failure and unhealthy after
    /// [`UNHEALTHY_AFTER_FAILED_TICKS`] failures in a row. Shutdown is
    /// honoured mid-tick and while sleeping.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            containers_path = %self.settings.containers_path.display(),
            "Starting watch loop"
        );

        let mut failed_ticks = 0;

        loop {
            let outcome = tokio::select! {
                result = self.tick() => Some(result),
                _ = shutdown.recv() => None,
            };

            let delay = match outcome {
                None => break,
                Some(Ok(_)) => {
                    failed_ticks = 0;
                    self.settings.interval
                }
                Some(Err(e)) => {
                    failed_ticks += 1;
                    let delay = self.settings.interval / 2;
                    error!(error = %e, failed_ticks, retry_secs = delay.as_secs_f64(), "Failed to sync containers, retrying");
                    self.record_failure(&e, failed_ticks).await;
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Shutting down watch loop");
    }
}

/// Builder for [`WatchLoop`]
pub struct WatchLoopBuilder {
    settings: WatcherSettings,
    resolver: Option<Arc<dyn PodResolver>>,
    agent_factory: Option<AgentFactory>,
    health: HealthRegistry,
    metrics: Option<WatcherMetrics>,
    logger: Option<StructuredLogger>,
}

impl WatchLoopBuilder {
    pub fn new(settings: WatcherSettings) -> Self {
        Self {
            settings,
            resolver: None,
            agent_factory: None,
            health: HealthRegistry::new(),
            metrics: None,
            logger: None,
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn PodResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn agent_factory(mut self, factory: AgentFactory) -> Self {
        self.agent_factory = Some(factory);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn metrics(mut self, metrics: WatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Load the watcher configuration and construct the agents.
    ///
    /// Agent construction errors are returned as is: at startup they are
    /// fatal.
    pub fn build(self) -> Result<WatchLoop, WatcherError> {
        let resolver = self.resolver.ok_or(WatcherError::Incomplete("pod resolver"))?;
        let agent_factory = self
            .agent_factory
            .ok_or(WatcherError::Incomplete("agent factory"))?;

        let watcher_config = load_watcher_config(self.settings.config_file.as_deref());
        let agents = agent_factory(&watcher_config)?;

        let logger = self.logger.unwrap_or_else(|| {
            StructuredLogger::new(
                self.settings
                    .cluster
                    .node_name
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            )
        });

        Ok(WatchLoop {
            settings: self.settings,
            resolver,
            agent_factory,
            agents,
            watcher_config,
            watched: BTreeSet::new(),
            phase: Phase::Bootstrap,
            health: self.health,
            metrics: self.metrics.unwrap_or_default(),
            logger,
        })
    }
}
