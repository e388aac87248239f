//! UI 向けコントロール API（`127.0.0.1` のみで待ち受ける）

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uverse_core::ServiceKind;
use uverse_runtime::{Orchestrator, RuntimeError, SessionLog, UpdateOutcome};

pub const DEFAULT_CONTROL_PORT: u16 = 18765;

/// URL を OS に渡す関数
pub type UrlOpener = fn(&str) -> std::io::Result<()>;

fn open_in_browser(url: &str) -> std::io::Result<()> {
    open::that_detached(url)
}

#[derive(Clone)]
pub struct ControlState {
    orchestrator: Arc<Orchestrator>,
    shutdown: Arc<watch::Sender<bool>>,
    log: Option<SessionLog>,
    open_url: UrlOpener,
}

impl ControlState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        shutdown: Arc<watch::Sender<bool>>,
        log: Option<SessionLog>,
    ) -> Self {
        Self {
            orchestrator,
            shutdown,
            log,
            open_url: open_in_browser,
        }
    }

    #[cfg(test)]
    fn with_opener(mut self, opener: UrlOpener) -> Self {
        self.open_url = opener;
        self
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/services/wait", post(wait_for_start))
        .route("/api/services/start", post(start))
        .route("/api/services/{name}/restart", post(restart))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/open-url", post(open_url))
        .route("/api/log", post(append_log))
        .route("/api/shutdown", post(shutdown))
        .with_state(state)
}

/// `stop` が true になるまで API を提供する
pub async fn serve(
    listener: TcpListener,
    state: ControlState,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stop| *stop).await;
        })
        .await
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({ "success": false, "error": message.into() });
    (status, Json(body)).into_response()
}

async fn status(State(state): State<ControlState>) -> Response {
    Json(state.orchestrator.snapshot()).into_response()
}

async fn wait_for_start(State(state): State<ControlState>) -> Response {
    Json(state.orchestrator.wait_for_start().await).into_response()
}

async fn start(State(state): State<ControlState>) -> Response {
    let status = state.orchestrator.request_start();
    Json(json!({ "success": true, "status": status })).into_response()
}

async fn restart(State(state): State<ControlState>, Path(name): Path<String>) -> Response {
    let kind: ServiceKind = match name.parse() {
        Ok(kind) => kind,
        Err(e) => return failure(StatusCode::NOT_FOUND, e.to_string()),
    };

    match state.orchestrator.restart_service(kind).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e @ RuntimeError::ServiceNotFound(_)) => failure(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ RuntimeError::Cancelled(_)) => failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_config(State(state): State<ControlState>) -> Response {
    let context = state.orchestrator.context();
    Json(context.store.entries(&context.settings.base_dir)).into_response()
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    configs: BTreeMap<String, String>,
}

async fn put_config(State(state): State<ControlState>, Json(update): Json<ConfigUpdate>) -> Response {
    match state.orchestrator.update_config(update.configs).await {
        Ok(UpdateOutcome::Saved) => Json(json!({ "success": true })).into_response(),
        Ok(UpdateOutcome::Rejected(errors)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "errors": errors })),
        )
            .into_response(),
        Err(RuntimeError::Config(e)) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct OpenUrl {
    url: String,
}

fn is_web_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    ["http://", "https://"]
        .iter()
        .any(|scheme| lower.len() > scheme.len() && lower.starts_with(scheme))
}

async fn open_url(State(state): State<ControlState>, Json(request): Json<OpenUrl>) -> Response {
    if !is_web_url(&request.url) {
        return failure(StatusCode::BAD_REQUEST, "http または https の URL のみ開けます");
    }

    match (state.open_url)(request.url.trim()) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => {
            tracing::warn!("Failed to open {}: {}", request.url, e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogLine {
    message: String,
    level: Option<String>,
}

async fn append_log(State(state): State<ControlState>, Json(line): Json<LogLine>) -> Response {
    let level = line.level.as_deref().unwrap_or("info");
    match &state.log {
        Some(log) => {
            if let Err(e) = log.append(level, "ui", &line.message) {
                return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        }
        None => tracing::info!(target: "uverse::ui", level, "{}", line.message),
    }
    Json(json!({ "success": true })).into_response()
}

async fn shutdown(State(state): State<ControlState>) -> Response {
    tracing::info!("Shutdown requested via control API");
    state.shutdown.send_replace(true);
    (StatusCode::ACCEPTED, Json(json!({ "success": true }))).into_response()
}
