// src/io/serial/error.rs
//
// Failure taxonomy of the serial monitor. Connect/disconnect errors go back
// to the HTTP caller; read errors end the connection and are only logged.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    /// Baud rate must be a positive number of bits per second
    #[error("Invalid baud rate: {0}")]
    InvalidBaud(u32),

    /// No serial device is plugged in
    #[error("No serial port detected")]
    NotFound,

    /// Enumerating devices failed before any could be chosen
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(String),

    /// A device was found but could not be opened (busy, permissions, unplugged)
    #[error("Failed to open {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// I/O failure on an open handle; the connection is gone
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// The handle could not be released cleanly; state is Closed regardless
    #[error("Failed to close serial port: {0}")]
    CloseError(String),
}

impl SerialError {
    /// Stable machine-readable tag so clients can tell "nothing plugged in"
    /// apart from "device busy"
    pub fn kind(&self) -> &'static str {
        match self {
            SerialError::InvalidBaud(_) => "invalid_baud",
            SerialError::NotFound => "not_found",
            SerialError::Enumerate(_) => "enumerate_failed",
            SerialError::OpenFailed { .. } => "open_failed",
            SerialError::ReadError(_) => "read_error",
            SerialError::CloseError(_) => "close_error",
        }
    }
}
