use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::driver::VolumeDriver;
use crate::metrics::PluginMetrics;

#[derive(Clone)]
pub struct HealthState {
    pub driver: Arc<VolumeDriver>,
    pub metrics: Option<Arc<PluginMetrics>>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/validate", get(validate))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthcheck() -> &'static str {
    "ok"
}

/// Proves the external driver can still reach its storage backend.
async fn validate(State(state): State<HealthState>) -> Response {
    match state.driver.validate().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Validation failed, the driver cannot talk to its storage");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed").into_response()
        }
    }
}

async fn metrics(State(state): State<HealthState>) -> Response {
    let Some(metrics) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.encode() {
        Ok(text) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn serve(port: u16, state: HealthState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind healthcheck port {port}"))?;
    tracing::info!(port, "Healthcheck listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Healthcheck server error")
}
