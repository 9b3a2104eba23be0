//! Kubernetes log watcher
//!
//! Runs as a DaemonSet on each node: watches the containers started on the
//! node and keeps the configuration of the log shipping agents in sync.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watcher_lib::{
    api,
    build_agents,
    health::{components, HealthRegistry},
    observability::{StructuredLogger, WatcherMetrics},
    pods, AgentKind, AgentSettings, WatchLoopBuilder, WatcherConfig,
};

mod config;

const WATCHER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json())
        .init();

    info!("Starting kube-log-watcher");

    let settings = cli.watcher_settings()?;
    let agent_settings = cli
        .agent_kinds()?
        .iter()
        .map(AgentKind::load_settings)
        .collect::<Result<Vec<AgentSettings>, _>>()?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::WATCH_LOOP).await;
    health_registry.register(components::AGENTS).await;

    let metrics = WatcherMetrics::new();
    let logger = StructuredLogger::new(
        settings
            .cluster
            .node_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    );

    let resolver = pods::create_resolver(settings.kube_url.as_ref()).await?;

    let cluster = settings.cluster.clone();
    let watch_loop = WatchLoopBuilder::new(settings)
        .resolver(resolver)
        .agent_factory(Box::new(move |watcher_config: &WatcherConfig| {
            build_agents(&agent_settings, &cluster, watcher_config)
        }))
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .logger(logger.clone())
        .build()?;

    logger.log_startup(WATCHER_VERSION, &watch_loop.agent_names());

    if let Some(port) = cli.api_port {
        let state = Arc::new(api::AppState::new(health_registry, metrics));
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, state).await {
                error!(error = %e, "Probe server stopped");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        logger.log_shutdown(reason);
        let _ = shutdown_tx.send(());
    });

    watch_loop.run(shutdown_rx).await;

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT received";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT received",
        _ = terminate.recv() => "SIGTERM received",
    }
}
