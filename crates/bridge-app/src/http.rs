use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use buffer::BufferStore;
use types::Credentials;

use crate::config::BridgeConfig;
use crate::coordinator::CoordinatorData;
use crate::diagnostics::{self, DiagnosticsInput};

#[derive(Clone)]
pub struct HttpState {
    pub data: watch::Receiver<CoordinatorData>,
    pub metrics: Option<PrometheusHandle>,
    pub config: Arc<BridgeConfig>,
    pub credentials: Option<Arc<Credentials>>,
    pub store: BufferStore,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/diagnostics", get(diagnostics))
        .with_state(state)
}

async fn healthz(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let data = state.data.borrow().clone();
    Json(json!({
        "status": "ok",
        "sync_status": data.sync_status,
        "connected": data.connected,
        "last_sync": data.last_sync,
    }))
}

async fn metrics(State(state): State<HttpState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn diagnostics(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let data = state.data.borrow().clone();
    let pending_readings = match state.store.pending_count().await {
        Ok(count) => Some(count),
        Err(err) => {
            warn!(error = %err, "buffer count failed");
            None
        }
    };

    Json(diagnostics::build(DiagnosticsInput {
        config: &state.config,
        credentials: state.credentials.as_deref(),
        data: Some(&data),
        pending_readings,
    }))
}

/// Serves until the shutdown flag flips.
pub async fn serve(
    listen: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
}
