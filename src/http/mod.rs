// src/http/mod.rs
//
// HTTP surface of the bridge: an axum router with permissive CORS (the
// client is a browser extension on another origin), a request log line per
// call, and JSON `{message, error}` bodies on failure.

mod convert;
mod flash;
mod serial;
mod status;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::bridge::SerialBridge;
use crate::io::serial::{PortEnumerator, SerialOpener, SystemOpener, SystemPorts};
use crate::settings::BridgeSettings;
use crate::toolchain::{BuildInvoker, CommandRunner, ConversionInvoker, ProcessRunner};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<SerialBridge>,
    pub build: Arc<BuildInvoker>,
    pub convert: Arc<ConversionInvoker>,
    pub settings: Arc<BridgeSettings>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// State wired to the given capabilities
    pub fn new(
        settings: BridgeSettings,
        ports: Arc<dyn PortEnumerator>,
        opener: Arc<dyn SerialOpener>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let bridge = SerialBridge::new(settings.serial.clone(), ports, opener);
        AppState {
            bridge: Arc::new(bridge),
            build: Arc::new(BuildInvoker::new(runner.clone(), settings.build.clone())),
            convert: Arc::new(ConversionInvoker::new(runner, settings.convert.clone())),
            settings: Arc::new(settings),
            started_at: Utc::now(),
        }
    }

    /// State backed by real serial devices and real processes
    pub fn system(settings: BridgeSettings) -> Self {
        Self::new(
            settings,
            Arc::new(SystemPorts),
            Arc::new(SystemOpener),
            Arc::new(ProcessRunner),
        )
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.settings.server.body_limit_mb.saturating_mul(1024 * 1024);

    Router::new()
        .route("/", get(status::index))
        .route("/health", get(status::health))
        .route("/serial-connect", post(serial::connect))
        .route("/serial-disconnect", post(serial::disconnect))
        .route("/serial-stream", get(serial::stream))
        .route("/compile-flash", post(flash::compile_flash))
        .route("/save-platformio-config", post(flash::save_config))
        .route("/select-folder", post(flash::select_folder))
        .route("/validate-model-path", post(convert::validate_model_path))
        .route("/convert-tfjs-to-keras", post(convert::tfjs_to_keras))
        .route("/convert-tfjs-to-tflite", post(convert::tfjs_to_tflite))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(answer_options))
        .layer(cors_layer())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

async fn log_request(request: Request, next: Next) -> Response {
    tlog!("[http] {} {}", request.method(), request.uri());
    next.run(request).await
}

/// Any OPTIONS request that is not a CORS preflight still gets a bare 200
async fn answer_options(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

async fn not_found(method: Method, uri: axum::http::Uri) -> Response {
    failure(
        StatusCode::NOT_FOUND,
        "Not found",
        format!("No route for {} {}", method, uri.path()),
    )
}

// ============================================================================
// Responses
// ============================================================================

pub(crate) fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

pub(crate) fn failure(status: StatusCode, message: &str, error: impl ToString) -> Response {
    reply(
        status,
        json!({ "message": message, "error": error.to_string() }),
    )
}

pub(crate) fn bad_body(rejection: JsonRejection) -> Response {
    tlog!("[http] Rejected request body: {}", rejection.body_text());
    failure(
        StatusCode::BAD_REQUEST,
        "Invalid request body",
        rejection.body_text(),
    )
}

/// Non-blank string field, trimmed
pub(crate) fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
