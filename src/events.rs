// src/events.rs
//
// Messages pushed to serial stream clients. Each one is a small JSON object
// `{"type": ..., "message": ...}` sent as a single SSE `data:` frame.

use serde::{Deserialize, Serialize};

/// Sent to a client as soon as it subscribes
pub const STREAM_CONNECTED_MESSAGE: &str = "Serial stream connected";
/// Sent to every client when the monitor is stopped on request
pub const SERVER_CLOSING_MESSAGE: &str = "Server closing connection";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Connected,
    Serial,
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    pub message: String,
}

impl StreamEvent {
    pub fn connected() -> Self {
        StreamEvent {
            kind: StreamEventKind::Connected,
            message: STREAM_CONNECTED_MESSAGE.to_string(),
        }
    }

    pub fn serial(line: impl Into<String>) -> Self {
        StreamEvent {
            kind: StreamEventKind::Serial,
            message: line.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        StreamEvent {
            kind: StreamEventKind::Disconnected,
            message: reason.into(),
        }
    }

    /// JSON payload of the SSE frame. Serial text is escaped, so the payload
    /// never contains a raw newline.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // Only reachable if serde_json rejects a plain string field
            format!("{{\"type\":\"disconnected\",\"message\":\"{}\"}}", SERVER_CLOSING_MESSAGE)
        })
    }

    /// Full `data: ...\n\n` frame as written to the wire
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}
