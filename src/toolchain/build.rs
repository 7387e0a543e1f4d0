// src/toolchain/build.rs
//
// PlatformIO projects: board profiles, the generated `platformio.ini`,
// writing sketch sources into the working folder, and `pio run --target
// upload`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{CommandOutput, CommandRunner, ToolchainError};
use crate::settings::BuildSettings;

pub const INI_FILE: &str = "platformio.ini";
pub const SOURCE_DIR: &str = "src";
pub const SOURCE_FILE: &str = "main.cpp";

// ============================================================================
// Board profiles
// ============================================================================

/// PlatformIO platform/board pair for a supported board id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardProfile {
    pub id: &'static str,
    pub platform: &'static str,
    pub board: &'static str,
    pub monitor_speed: u32,
}

const BOARDS: &[BoardProfile] = &[
    BoardProfile {
        id: "uno",
        platform: "atmelavr",
        board: "uno",
        monitor_speed: 9600,
    },
    BoardProfile {
        id: "nano",
        platform: "atmelavr",
        board: "nanoatmega328",
        monitor_speed: 9600,
    },
    BoardProfile {
        id: "nano33ble",
        platform: "nordicnrf52",
        board: "nano33ble",
        monitor_speed: 9600,
    },
];

/// Profile for `board_id`; unknown ids get the Uno profile
pub fn board_profile(board_id: &str) -> BoardProfile {
    let wanted = board_id.trim().to_lowercase();
    match BOARDS.iter().find(|b| b.id == wanted) {
        Some(profile) => *profile,
        None => {
            tlog!("[build] Unknown board '{}', using uno", board_id);
            BOARDS[0]
        }
    }
}

/// `platformio.ini` for a board when the client sends none
pub fn default_ini(board_id: &str) -> String {
    let profile = board_profile(board_id);
    format!(
        "[env:{}]\nplatform = {}\nboard = {}\nframework = arduino\nmonitor_speed = {}\n",
        profile.id, profile.platform, profile.board, profile.monitor_speed
    )
}

/// First `monitor_speed = N` in an ini, ignoring comments. Zero is not a
/// usable speed and counts as absent.
pub fn monitor_speed(ini: &str) -> Option<u32> {
    ini.lines()
        .map(|line| line.split([';', '#']).next().unwrap_or("").trim())
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "monitor_speed")
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|baud| *baud > 0)
}

// ============================================================================
// Project files
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectFiles {
    pub ini_path: PathBuf,
    pub source_path: PathBuf,
}

/// Write `platformio.ini` into `folder`, creating the folder if needed
pub async fn save_ini(folder: &Path, ini: &str) -> Result<PathBuf, ToolchainError> {
    tokio::fs::create_dir_all(folder)
        .await
        .map_err(|e| ToolchainError::Io(format!("Failed to create {}: {}", folder.display(), e)))?;
    let ini_path = folder.join(INI_FILE);
    tokio::fs::write(&ini_path, ini)
        .await
        .map_err(|e| ToolchainError::Io(format!("Failed to write {}: {}", ini_path.display(), e)))?;
    Ok(ini_path)
}

/// Lay out a buildable project: `platformio.ini` plus `src/main.cpp`
pub async fn write_project(
    folder: &Path,
    code: &str,
    ini: &str,
) -> Result<ProjectFiles, ToolchainError> {
    let ini_path = save_ini(folder, ini).await?;

    let src_dir = folder.join(SOURCE_DIR);
    tokio::fs::create_dir_all(&src_dir)
        .await
        .map_err(|e| ToolchainError::Io(format!("Failed to create {}: {}", src_dir.display(), e)))?;
    let source_path = src_dir.join(SOURCE_FILE);
    tokio::fs::write(&source_path, code).await.map_err(|e| {
        ToolchainError::Io(format!("Failed to write {}: {}", source_path.display(), e))
    })?;

    tlog!(
        "[build] Wrote {} and {}",
        ini_path.display(),
        source_path.display()
    );
    Ok(ProjectFiles {
        ini_path,
        source_path,
    })
}

// ============================================================================
// Invoker
// ============================================================================

pub struct BuildInvoker {
    runner: Arc<dyn CommandRunner>,
    settings: BuildSettings,
}

impl BuildInvoker {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: BuildSettings) -> Self {
        BuildInvoker { runner, settings }
    }

    /// Compile the project in `folder` and flash it to the attached board
    pub async fn upload(&self, folder: &Path) -> Result<CommandOutput, ToolchainError> {
        let args = vec![
            "run".to_string(),
            "-d".to_string(),
            folder.to_string_lossy().to_string(),
            "--target".to_string(),
            self.settings.upload_target.clone(),
        ];

        tlog!("[build] Compiling and uploading {}", folder.display());
        let output = self
            .runner
            .run(&self.settings.program, &args, Some(folder))
            .await?
            .into_result()
            .map_err(|e| {
                tlog!("[build] Upload failed: {}", e);
                e
            })?;

        if !output.stderr.trim().is_empty() {
            tlog!("[build] Upload succeeded with warnings on stderr");
        }
        Ok(output)
    }
}

// ============================================================================
// Tests
// ============================================================================
