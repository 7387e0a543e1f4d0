// src/io/mod.rs
//
// Device I/O for the bridge. Only serial devices are supported: the monitor
// owns at most one handle at a time (see `crate::bridge`).

pub mod serial;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the single serial connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Closed
    }
}

impl ConnectionState {
    /// Short label used by the status endpoints ("active" / "inactive")
    pub fn monitor_label(&self) -> &'static str {
        match self {
            ConnectionState::Open => "active",
            _ => "inactive",
        }
    }
}
