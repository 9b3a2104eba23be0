//! Probe server: `/healthz`, `/readyz` and `/metrics`
//!
//! Liveness only fails once the watch loop is unhealthy, so a degraded
//! agent never gets the pod restarted.

use crate::health::{ComponentStatus, HealthRegistry};
use crate::observability::WatcherMetrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

/// State shared by the probe handlers
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: WatcherMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: WatcherMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn liveness_code(status: ComponentStatus) -> StatusCode {
    match status {
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
    }
}

async fn liveness(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    (liveness_code(health.status), Json(health)).into_response()
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness)).into_response()
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

/// Serve the probe endpoints on every interface at `port`
pub async fn serve(port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Probe server listening");

    axum::serve(listener, create_router(state)).await
}
