use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{BotConfig, ConfigError};
use crate::pipeline::backend_ops::SharedImageBackendOps;
use crate::pipeline::runtime::PipelineOrchestrator;
use crate::pipeline::trigger::RequestRouter;
use crate::worker::gate::AdmissionGate;

/// Base64 photos inflate by a third; leave room for a few large attachments.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub router: RequestRouter,
}

impl AppState {
    pub fn new(router: RequestRouter) -> Self {
        Self {
            service_name: "sdbot-core",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            router,
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self, ConfigError> {
        let backend: SharedImageBackendOps = Arc::new(config.backend()?);
        Self::from_config_with_backend(config, backend)
    }

    pub fn from_config_with_backend(
        config: &BotConfig,
        backend: SharedImageBackendOps,
    ) -> Result<Self, ConfigError> {
        let router = RequestRouter::new(
            Arc::new(config.access_policy()?),
            AdmissionGate::new(config.max_concurrency),
            PipelineOrchestrator::new(backend),
            config.max_queue_depth,
        );
        Ok(Self::new(router))
    }
}

pub fn build_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/requests",
            post(crate::api::requests::submit_request_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: BotConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(&config)?;
    let gate = state.router.gate().clone();
    let backend_url = config.base_url()?;
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        bind = %config.bind,
        backend = %backend_url,
        max_concurrency = config.max_concurrency,
        max_queue_depth = config.max_queue_depth,
        "starting sdbot-core HTTP surface"
    );
    axum::serve(listener, build_router_with_state(state))
        .with_graceful_shutdown(shutdown_signal(gate))
        .await?;
    Ok(())
}

/// Resolves on Ctrl-C, after closing the gate so queued requests are told
/// to retry instead of waiting on a backend that is going away.
async fn shutdown_signal(gate: AdmissionGate) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(in_flight = gate.size(), "shutting down; closing admission gate");
    gate.close();
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let gate = state.router.gate();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": if gate.is_closed() { "draining" } else { "ok" },
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
            "gate": {
                "max_concurrency": gate.max_concurrency(),
                "in_flight": gate.size(),
                "queue_depth": gate.queue_depth(),
            },
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
