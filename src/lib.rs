// src/lib.rs
//
// pio-bridge: a local HTTP server that lets a browser extension compile and
// flash Arduino sketches with PlatformIO, watch the board's serial output
// live over Server-Sent Events, and convert TensorFlow.js models.

#[macro_use]
mod logging;

pub mod bridge;
pub mod events;
pub mod fanout;
pub mod http;
pub mod io;
pub mod settings;
pub mod toolchain;

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::http::AppState;
use crate::settings::BridgeSettings;

// ============================================================================
// Command line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "pio-bridge", version, about = "PlatformIO / serial monitor bridge server")]
pub struct Cli {
    /// TOML config file (missing file means defaults)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Serial monitor baud rate
    #[arg(long)]
    pub baud: Option<u32>,

    /// Mirror log lines to a timestamped file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Write the effective settings to this path and exit
    #[arg(long)]
    pub write_config: Option<PathBuf>,
}

impl Cli {
    /// Load the config file and apply command-line overrides
    pub fn settings(&self) -> Result<BridgeSettings, String> {
        let mut settings = settings::load_settings(self.config.as_deref())?;
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(baud) = self.baud {
            settings.serial.baud_rate = baud;
        }
        if let Some(dir) = &self.log_dir {
            settings.logging.dir = Some(dir.to_string_lossy().to_string());
        }
        settings.validate()?;
        Ok(settings)
    }
}

// ============================================================================
// Entry point
// ============================================================================

pub fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let settings = cli.settings()?;

    if let Some(path) = &cli.write_config {
        settings::save_settings(path, &settings)?;
        tlog!("[settings] Wrote {}", path.display());
        return Ok(());
    }

    if let Some(dir) = &settings.logging.dir {
        if let Err(e) = logging::init_file_logging(Path::new(dir), settings.logging.keep_files) {
            tlog!("[logging] {}", e);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start async runtime: {}", e))?;

    let result = runtime.block_on(serve(settings));
    logging::stop_file_logging();
    result
}

/// Serve until Ctrl+C, then release the serial device and end all streams
pub async fn serve(settings: BridgeSettings) -> Result<(), String> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    let state = AppState::system(settings);
    let router = http::build_router(state.clone());

    tlog!("[server] pio-bridge v{} listening on http://{}", env!("CARGO_PKG_VERSION"), addr);
    tlog!("[server] Serial stream at http://{}/serial-stream", addr);

    let bridge = state.bridge.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tlog!("[server] Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tlog!("[server] Shutting down");
            bridge.shutdown().await;
        })
        .await
        .map_err(|e| format!("Server error: {}", e))?;

    tlog!("[server] Stopped");
    Ok(())
}
