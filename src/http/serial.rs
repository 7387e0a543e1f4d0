// src/http/serial.rs
//
// Serial monitor endpoints: connect, disconnect and the SSE stream.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures::Stream;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use super::{reply, AppState};
use crate::bridge::DisconnectOutcome;
use crate::fanout::{ChannelSubscriber, SubscriptionGuard};
use crate::io::serial::SerialError;

pub(super) async fn connect(State(state): State<AppState>) -> Response {
    let baud_rate = state.settings.serial.baud_rate;
    match state.bridge.connect(baud_rate).await {
        Ok(port) => reply(
            StatusCode::OK,
            json!({ "message": "Serial monitor connected", "port": port, "baudRate": baud_rate }),
        ),
        Err(e) => {
            tlog!("[serial] Connect failed: {}", e);
            let status = match e {
                SerialError::InvalidBaud(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            reply(
                status,
                json!({
                    "message": "Failed to connect to serial port",
                    "error": e.to_string(),
                    "errorKind": e.kind(),
                }),
            )
        }
    }
}

pub(super) async fn disconnect(State(state): State<AppState>) -> Response {
    match state.bridge.disconnect().await {
        Ok(outcome) => {
            let details = match outcome {
                DisconnectOutcome::Closed => "Serial port closed by user request",
                DisconnectOutcome::AlreadyInactive => "Serial port was already inactive",
            };
            reply(
                StatusCode::OK,
                json!({
                    "message": "Serial monitor disconnected from bridge server",
                    "details": details,
                }),
            )
        }
        Err(e) => {
            tlog!("[serial] Disconnect failed: {}", e);
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "message": "Serial disconnection error on bridge server",
                    "error": e.to_string(),
                }),
            )
        }
    }
}

/// Long-lived event stream. Starts with the connected acknowledgement and
/// ends when the monitor is stopped or the client goes away.
pub(super) async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscriber, rx) = ChannelSubscriber::new(state.settings.serial.subscriber_backlog);
    let id = state.bridge.subscribe(subscriber);
    let guard = SubscriptionGuard::new(state.bridge.subscribers(), id);

    let events = ReceiverStream::new(rx).map(move |event| {
        // The guard lives as long as the response body
        let _ = &guard;
        Ok(Event::default().data(event.to_json()))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
