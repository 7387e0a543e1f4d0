// src/toolchain/mod.rs
//
// External tools the bridge drives: PlatformIO for compile + upload and a
// Python/TensorFlow environment for model conversion. Every invocation goes
// through `CommandRunner` so the HTTP layer can be tested without either
// toolchain installed.

pub mod build;
pub mod convert;

use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

pub use build::BuildInvoker;
pub use convert::ConversionInvoker;

// ============================================================================
// Types
// ============================================================================

/// Captured result of one finished process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolchainError {
    /// The program could not be started (not installed, not on PATH)
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The program ran and exited non-zero
    #[error("Command exited with {}", exit_label(.code))]
    Failed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Preparing inputs or reading results from disk failed
    #[error("{0}")]
    Io(String),

    /// The tool reported success but its output file is missing
    #[error("Expected output not found: {0}")]
    MissingArtifact(String),

    /// The request itself is unusable (bad path, missing model.json, bad base64)
    #[error("{0}")]
    InvalidInput(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {}", c),
        None => "a signal".to_string(),
    }
}

impl ToolchainError {
    /// Most useful text for the caller: the tool's stderr, else its stdout,
    /// else the error message
    pub fn detail(&self) -> String {
        match self {
            ToolchainError::Failed { stdout, stderr, .. } => {
                if !stderr.trim().is_empty() {
                    stderr.trim().to_string()
                } else if !stdout.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    self.to_string()
                }
            }
            other => other.to_string(),
        }
    }

    /// Whether the caller, not the toolchain, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, ToolchainError::InvalidInput(_))
    }
}

impl CommandOutput {
    /// Turn a non-zero exit into `ToolchainError::Failed`
    pub fn into_result(self) -> Result<CommandOutput, ToolchainError> {
        if self.success {
            Ok(self)
        } else {
            Err(ToolchainError::Failed {
                code: self.status_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Process execution capability
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ToolchainError>;
}

// ============================================================================
// Process runner
// ============================================================================

/// Runs real processes, capturing stdout and stderr
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ToolchainError> {
        tlog!("[toolchain] $ {} {}", program, args.join(" "));
        let started = Instant::now();

        let mut command = tokio::process::Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| ToolchainError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        let result = CommandOutput {
            success: output.status.success(),
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        };
        tlog!(
            "[toolchain] {} finished in {:.1}s (exit {:?})",
            program,
            result.duration.as_secs_f64(),
            result.status_code
        );
        Ok(result)
    }
}

// ============================================================================
// Tests
// ============================================================================
