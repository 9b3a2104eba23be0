//! Observability for the log watcher
//!
//! Provides:
//! - Prometheus metrics for reconciliation ticks and agent failures
//! - Structured logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Tick durations are dominated by pod lookups
const TICK_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<WatcherMetricsInner> = OnceLock::new();

struct WatcherMetricsInner {
    tick_duration_seconds: Histogram,
    containers_discovered: IntGauge,
    containers_watched: IntGauge,
    targets_added: IntCounter,
    targets_removed: IntCounter,
    targets_skipped: IntCounterVec,
    agent_errors: IntCounterVec,
    tick_errors: IntCounter,
    config_reloads: IntCounter,
}

impl WatcherMetricsInner {
    fn new() -> Self {
        Self {
            tick_duration_seconds: register_histogram!(
                "kube_log_watcher_tick_duration_seconds",
                "Time spent in one reconciliation tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            containers_discovered: register_int_gauge!(
                "kube_log_watcher_containers_discovered",
                "Containers found in the containers directory on the last tick"
            )
            .expect("Failed to register containers_discovered"),

            containers_watched: register_int_gauge!(
                "kube_log_watcher_containers_watched",
                "Containers currently in the watched set"
            )
            .expect("Failed to register containers_watched"),

            targets_added: register_int_counter!(
                "kube_log_watcher_targets_added_total",
                "Log targets handed to the output agents"
            )
            .expect("Failed to register targets_added_total"),

            targets_removed: register_int_counter!(
                "kube_log_watcher_targets_removed_total",
                "Stale containers removed from the output agents"
            )
            .expect("Failed to register targets_removed_total"),

            targets_skipped: register_int_counter_vec!(
                "kube_log_watcher_targets_skipped_total",
                "New containers that produced no log target",
                &["reason"]
            )
            .expect("Failed to register targets_skipped_total"),

            agent_errors: register_int_counter_vec!(
                "kube_log_watcher_agent_errors_total",
                "Errors raised by output agents",
                &["agent"]
            )
            .expect("Failed to register agent_errors_total"),

            tick_errors: register_int_counter!(
                "kube_log_watcher_tick_errors_total",
                "Reconciliation ticks aborted by an error"
            )
            .expect("Failed to register tick_errors_total"),

            config_reloads: register_int_counter!(
                "kube_log_watcher_config_reloads_total",
                "Agent reloads caused by a watcher configuration change"
            )
            .expect("Failed to register config_reloads_total"),
        }
    }
}

/// Handle to the process wide watcher metrics; clones share the same metrics
#[derive(Clone)]
pub struct WatcherMetrics {
    _private: (),
}

impl Default for WatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(WatcherMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &WatcherMetricsInner {
        GLOBAL_METRICS.get_or_init(WatcherMetricsInner::new)
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
    }

    pub fn set_containers_discovered(&self, count: usize) {
        self.inner().containers_discovered.set(count as i64);
    }

    pub fn set_containers_watched(&self, count: usize) {
        self.inner().containers_watched.set(count as i64);
    }

    pub fn inc_targets_added(&self, count: usize) {
        self.inner().targets_added.inc_by(count as u64);
    }

    pub fn inc_targets_removed(&self, count: usize) {
        self.inner().targets_removed.inc_by(count as u64);
    }

    pub fn inc_targets_skipped(&self, reason: &str) {
        self.inner().targets_skipped.with_label_values(&[reason]).inc();
    }

    pub fn inc_agent_errors(&self, agent: &str) {
        self.inner().agent_errors.with_label_values(&[agent]).inc();
    }

    pub fn inc_tick_errors(&self) {
        self.inner().tick_errors.inc();
    }

    pub fn inc_config_reloads(&self) {
        self.inner().config_reloads.inc();
    }

    pub fn tick_errors(&self) -> u64 {
        self.inner().tick_errors.get()
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for watcher lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, agents: &[&str]) {
        info!(
            event = "watcher_started",
            node = %self.node_name,
            watcher_version = %version,
            agents = %agents.join(","),
            "Kubernetes log watcher started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "watcher_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Kubernetes log watcher shutting down"
        );
    }

    pub fn log_agents_reloaded(&self, agents: usize) {
        info!(
            event = "agents_reloaded",
            node = %self.node_name,
            agents,
            "Watcher configuration changed, agents reloaded"
        );
    }

    /// Log the outcome of one reconciliation tick
    pub fn log_sync(&self, added: usize, removed: usize, skipped: usize, failed_agents: &[&str]) {
        if failed_agents.is_empty() {
            info!(
                event = "sync_complete",
                node = %self.node_name,
                added,
                removed,
                skipped,
                "Synced containers with log agents"
            );
        } else {
            warn!(
                event = "sync_complete",
                node = %self.node_name,
                added,
                removed,
                skipped,
                failed_agents = %failed_agents.join(","),
                "Synced containers with log agents, some agents failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watcher_metrics() {
        let metrics = WatcherMetrics::new();

        metrics.observe_tick_duration(0.2);
        metrics.set_containers_discovered(3);
        metrics.set_containers_watched(2);
        metrics.inc_targets_added(2);
        metrics.inc_targets_removed(1);
        metrics.inc_targets_skipped("pause_container");
        metrics.inc_agent_errors("Scalyr");
        metrics.inc_tick_errors();
        metrics.inc_config_reloads();

        // Handles share the global instance
        let other = WatcherMetrics::new();
        other.inc_config_reloads();
        assert!(metrics.inner().config_reloads.get() >= 2);
        assert!(other.tick_errors() >= 1);
    }

    #[test]
    fn test_encode_exposes_watcher_metrics() {
        let metrics = WatcherMetrics::new();
        metrics.inc_targets_skipped("missing_labels");

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("kube_log_watcher_tick_errors_total"));
        assert!(text.contains("kube_log_watcher_targets_skipped_total{reason=\"missing_labels\"}"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("node-1");
        assert_eq!(logger.node_name, "node-1");
    }
}
