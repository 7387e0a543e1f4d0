// src/settings.rs
//
// Bridge configuration. Loaded from an optional TOML file; every field has a
// default so partial files (or no file at all) are valid. CLI flags override
// whatever the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::serial::Parity;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BridgeSettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub convert: ConvertSettings,
    #[serde(default)]
    pub folders: FolderSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Max JSON body size; model uploads arrive inline as base64
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Wait between releasing the old handle and opening the next one
    #[serde(default = "default_reopen_grace_ms")]
    pub reopen_grace_ms: u64,
    /// Read timeout of the monitor loop; bounds how long a disconnect waits
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Events queued per stream client before lines are dropped for it
    #[serde(default = "default_subscriber_backlog")]
    pub subscriber_backlog: usize,
    /// Manufacturer substrings of typical microcontroller USB-serial adapters
    #[serde(default = "default_known_vendors")]
    pub known_vendors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BuildSettings {
    #[serde(default = "default_build_program")]
    pub program: String,
    #[serde(default = "default_upload_target")]
    pub upload_target: String,
    #[serde(default = "default_true")]
    pub reconnect_after_upload: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConvertSettings {
    #[serde(default = "default_python")]
    pub python: String,
    /// Run the converter inside WSL, translating `C:\...` paths to `/mnt/c/...`
    #[serde(default)]
    pub wsl: bool,
    /// Shell wrapper inside WSL that activates the converter environment
    #[serde(default)]
    pub wsl_wrapper: Option<String>,
    #[serde(default = "default_keras_output_dir")]
    pub keras_output_dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FolderSettings {
    #[serde(default = "default_pio_folder")]
    pub pio: String,
    #[serde(default = "default_tflite_folder")]
    pub tflite: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingSettings {
    /// When set, log lines are mirrored to a timestamped file in this directory
    #[serde(default)]
    pub dir: Option<String>,
    /// Session files kept in `dir`; 0 keeps them all
    #[serde(default = "default_keep_files")]
    pub keep_files: usize,
}

// ============================================================================
// Defaults
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit_mb() -> usize {
    100
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_reopen_grace_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_subscriber_backlog() -> usize {
    256
}
fn default_known_vendors() -> Vec<String> {
    ["Arduino", "FTDI", "Silicon Labs", "Prolific", "CH340"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_build_program() -> String {
    "pio".to_string()
}
fn default_upload_target() -> String {
    "upload".to_string()
}
fn default_true() -> bool {
    true
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_keras_output_dir() -> String {
    "myOutput".to_string()
}
fn default_keep_files() -> usize {
    10
}

fn documents_root() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("PioBridge")
}
fn default_pio_folder() -> String {
    documents_root().join("myPioProject").to_string_lossy().to_string()
}
fn default_tflite_folder() -> String {
    documents_root().join("myTFLiteModels").to_string_lossy().to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_mb: default_body_limit_mb(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            reopen_grace_ms: default_reopen_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            subscriber_backlog: default_subscriber_backlog(),
            known_vendors: default_known_vendors(),
        }
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            program: default_build_program(),
            upload_target: default_upload_target(),
            reconnect_after_upload: default_true(),
        }
    }
}

impl Default for ConvertSettings {
    fn default() -> Self {
        Self {
            python: default_python(),
            wsl: false,
            wsl_wrapper: None,
            keras_output_dir: default_keras_output_dir(),
        }
    }
}

impl Default for FolderSettings {
    fn default() -> Self {
        Self {
            pio: default_pio_folder(),
            tflite: default_tflite_folder(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: None,
            keep_files: default_keep_files(),
        }
    }
}

impl BridgeSettings {
    /// Reject values the serial layer cannot honour
    pub fn validate(&self) -> Result<(), String> {
        let serial = &self.serial;
        if serial.baud_rate == 0 {
            return Err("Invalid settings: serial.baud_rate must be greater than 0".to_string());
        }
        if !(5..=8).contains(&serial.data_bits) {
            return Err(format!(
                "Invalid settings: serial.data_bits must be 5-8, got {}",
                serial.data_bits
            ));
        }
        if !(1..=2).contains(&serial.stop_bits) {
            return Err(format!(
                "Invalid settings: serial.stop_bits must be 1 or 2, got {}",
                serial.stop_bits
            ));
        }
        Ok(())
    }
}

impl SerialSettings {
    pub fn reopen_grace(&self) -> Duration {
        Duration::from_millis(self.reopen_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero timeout would turn the read loop into a busy spin
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Parse settings from TOML text.
pub fn parse_settings(content: &str) -> Result<BridgeSettings, String> {
    toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: Option<&Path>) -> Result<BridgeSettings, String> {
    let Some(path) = path else {
        tlog!("[settings] No config file given, using defaults");
        return Ok(BridgeSettings::default());
    };

    if !path.exists() {
        tlog!(
            "[settings] Config file {} not found, using defaults",
            path.display()
        );
        return Ok(BridgeSettings::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read settings: {}", e))?;
    let settings = parse_settings(&content)?;
    tlog!("[settings] Loaded {}", path.display());
    Ok(settings)
}

/// Write settings as TOML (used to produce a starter config file).
pub fn save_settings(path: &Path, settings: &BridgeSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
    }
    let content = toml::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialise settings: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}

// ============================================================================
// Tests
// ============================================================================
