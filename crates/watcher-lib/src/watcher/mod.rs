//! Container watching
//!
//! Discovery of containers on the node, log target building and the
//! reconciliation loop that drives the output agents.

mod discovery;
mod r#loop;
mod targets;


pub use discovery::{discover_containers, log_file_name, CONTAINER_CONFIG_FILE};
pub use r#loop::{
    container_delta, sync_agents, AgentFactory, ContainerDelta, Phase, TickSummary, WatchLoop,
    WatchLoopBuilder, UNHEALTHY_AFTER_FAILED_TICKS,
};
pub use targets::{
    LogTargetBuilder, SkipReason, APP_LABEL, COMPONENT_LABEL, ENVIRONMENT_LABEL, RELEASE_LABEL,
    VERSION_LABEL,
};
