//! Kubernetes log watcher library
//!
//! This crate provides the core functionality for:
//! - Container discovery on the node's runtime directory
//! - Pod metadata resolution through the Kubernetes API
//! - Log target building and the reconciliation loop
//! - Output agents for Scalyr, AppDynamics and plain symlinks
//! - Health checks and observability

pub mod agents;
pub mod api;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod pods;
pub mod settings;
pub mod watcher;

pub use agents::{build_agents, AgentKind, AgentSettings, OutputAgent};
pub use error::{AgentError, DiscoveryError, KubeError, SettingsError, WatcherError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, WatcherMetrics};
pub use settings::{ClusterSettings, WatcherConfig, WatcherSettings};
pub use watcher::{WatchLoop, WatchLoopBuilder};
