// src/http/status.rs
//
// Health check and the human-readable status page.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, Response};
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use super::{reply, AppState};

pub(super) async fn health(State(state): State<AppState>) -> Response {
    let status = state.bridge.status();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);

    reply(
        StatusCode::OK,
        json!({
            "status": "running",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "serialMonitor": status.state.monitor_label(),
            "serialClients": state.bridge.subscriber_count(),
            "port": status.device_path,
            "baudRate": status.baud_rate,
            "state": status.state,
            "uptimeSeconds": uptime,
        }),
    )
}

const ENDPOINTS: &[(&str, &str)] = &[
    ("GET /health", "Server and serial monitor status"),
    ("POST /serial-connect", "Open the detected serial device"),
    ("POST /serial-disconnect", "Close the serial device"),
    ("GET /serial-stream", "Live serial lines (Server-Sent Events)"),
    ("POST /compile-flash", "Write sketch + platformio.ini, compile and upload"),
    ("POST /save-platformio-config", "Write platformio.ini to a folder"),
    ("POST /select-folder", "Default working folder for PlatformIO or models"),
    ("POST /validate-model-path", "Check a TensorFlow.js model folder"),
    ("POST /convert-tfjs-to-keras", "Convert a model folder to Keras .h5"),
    ("POST /convert-tfjs-to-tflite", "Convert uploaded model files to .tflite"),
];

pub(super) async fn index(State(state): State<AppState>) -> Html<String> {
    let status = state.bridge.status();
    let device = status.device_path.as_deref().unwrap_or("none");
    let endpoints: String = ENDPOINTS
        .iter()
        .map(|(route, what)| format!("      <li><strong>{}</strong> - {}</li>\n", route, what))
        .collect();

    Html(format!(
        "<!DOCTYPE html>
<html>
  <head><title>PIO Bridge</title></head>
  <body>
    <h1>PIO Bridge v{version}</h1>
    <p>Serial monitor: <strong>{monitor}</strong> ({device})</p>
    <p>Stream clients: <strong>{clients}</strong></p>
    <h2>Endpoints</h2>
    <ul>
{endpoints}    </ul>
  </body>
</html>
",
        version = env!("CARGO_PKG_VERSION"),
        monitor = status.state.monitor_label(),
        device = device,
        clients = state.bridge.subscriber_count(),
        endpoints = endpoints,
    ))
}
