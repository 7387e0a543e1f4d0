// src/toolchain/convert.rs
//
// TensorFlow.js model conversion. Two routes:
// - a model folder already on disk to a Keras `.h5` (optionally run inside
//   WSL, with Windows paths translated to `/mnt/<drive>/...`)
// - model files uploaded inline as base64 to a float16 `.tflite`, returned
//   inline as base64
//
// Conversion itself is done by small Python scripts bundled into the binary
// and written next to the model before each run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{CommandRunner, ToolchainError};
use crate::settings::ConvertSettings;

const KERAS_SCRIPT: &str = include_str!("../../scripts/tfjs_to_keras.py");
const TFLITE_SCRIPT: &str = include_str!("../../scripts/tfjs_to_tflite.py");

pub const MODEL_JSON: &str = "model.json";

// ============================================================================
// Types
// ============================================================================

/// A model folder that passed validation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFolder {
    pub normalized_path: String,
    /// Weight shards named by the manifest that exist on disk
    pub weight_files: Vec<String>,
}

/// One uploaded model file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFile {
    pub file_name: String,
    /// Base64 file body
    pub file_content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KerasArtifact {
    pub output_path: PathBuf,
    pub file_name: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TfliteArtifact {
    pub file_name: String,
    /// Base64 `.tflite` body
    pub file_content: String,
    pub size_kb: String,
    pub output: String,
}

#[derive(Deserialize)]
struct ModelManifest {
    #[serde(default, rename = "weightsManifest")]
    weights_manifest: Vec<WeightGroup>,
}

#[derive(Deserialize)]
struct WeightGroup {
    #[serde(default)]
    paths: Vec<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// `C:\Users\me\model` -> `/mnt/c/Users/me/model`. Paths without a drive
/// letter only get their separators flipped.
pub fn to_wsl_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let bytes = forward.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = forward[2..].trim_start_matches('/');
        if rest.is_empty() {
            format!("/mnt/{}", drive)
        } else {
            format!("/mnt/{}/{}", drive, rest)
        }
    } else {
        forward
    }
}

/// Reject names that could escape the directory they are written into
fn safe_component(name: &str, what: &str) -> Result<String, ToolchainError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(ToolchainError::InvalidInput(format!(
            "Invalid {}: {}",
            what, name
        )));
    }
    Ok(trimmed.to_string())
}

/// Check that `folder` is a directory holding `model.json`, and list the
/// weight shards its manifest names that are present.
pub fn validate_model_folder(folder: &Path) -> Result<ModelFolder, ToolchainError> {
    if !folder.exists() {
        return Err(ToolchainError::InvalidInput(format!(
            "Folder does not exist: {}",
            folder.display()
        )));
    }
    if !folder.is_dir() {
        return Err(ToolchainError::InvalidInput(format!(
            "Path is not a directory: {}",
            folder.display()
        )));
    }

    let model_json = folder.join(MODEL_JSON);
    if !model_json.is_file() {
        return Err(ToolchainError::InvalidInput(format!(
            "No model.json file in {}",
            folder.display()
        )));
    }

    let content = std::fs::read_to_string(&model_json)
        .map_err(|e| ToolchainError::Io(format!("Failed to read model.json: {}", e)))?;
    let manifest: ModelManifest = serde_json::from_str(&content)
        .map_err(|e| ToolchainError::InvalidInput(format!("model.json is not valid: {}", e)))?;

    let weight_files = manifest
        .weights_manifest
        .into_iter()
        .flat_map(|group| group.paths)
        .filter(|p| folder.join(p).is_file())
        .collect();

    let normalized = std::fs::canonicalize(folder).unwrap_or_else(|_| folder.to_path_buf());
    Ok(ModelFolder {
        normalized_path: normalized.to_string_lossy().to_string(),
        weight_files,
    })
}

/// `validate_model_folder` on a blocking thread
pub async fn inspect_model_folder(folder: PathBuf) -> Result<ModelFolder, ToolchainError> {
    off_runtime(move || validate_model_folder(&folder)).await
}

/// Run filesystem or codec work where it cannot stall the async workers
async fn off_runtime<T, F>(work: F) -> Result<T, ToolchainError>
where
    F: FnOnce() -> Result<T, ToolchainError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ToolchainError::Io(format!("file task failed: {}", e)))?
}

/// Decode uploads and lay them out in a fresh scratch folder with the
/// conversion script beside them
fn stage_uploads(work_root: &Path, files: &[InlineFile]) -> Result<(ScratchDir, PathBuf), ToolchainError> {
    let mut decoded = Vec::with_capacity(files.len());
    for file in files {
        let name = safe_component(&file.file_name, "file name")?;
        let body = BASE64.decode(file.file_content.trim()).map_err(|e| {
            ToolchainError::InvalidInput(format!("{} is not valid base64: {}", name, e))
        })?;
        decoded.push((name, body));
    }
    if !decoded.iter().any(|(name, _)| name == MODEL_JSON) {
        return Err(ToolchainError::InvalidInput(
            "model.json not found in uploaded files".to_string(),
        ));
    }

    let scratch = ScratchDir::create(work_root)?;
    for (name, body) in &decoded {
        std::fs::write(scratch.path.join(name), body)
            .map_err(|e| ToolchainError::Io(format!("Failed to write {}: {}", name, e)))?;
    }
    tlog!(
        "[convert] Saved {} uploaded file(s) to {}",
        decoded.len(),
        scratch.path.display()
    );

    let script = write_script(&scratch.path, "tfjs_to_tflite.py", TFLITE_SCRIPT)?;
    Ok((scratch, script))
}

/// Scratch directory removed on drop, whatever the outcome
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(parent: &Path) -> Result<Self, ToolchainError> {
        let name = format!(
            "tfjs_model_{}_{}",
            chrono::Local::now().format("%Y%m%d%H%M%S%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let path = parent.join(name);
        std::fs::create_dir_all(&path)
            .map_err(|e| ToolchainError::Io(format!("Failed to create work dir: {}", e)))?;
        Ok(ScratchDir { path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tlog!("[convert] Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf, ToolchainError> {
    let path = dir.join(name);
    std::fs::write(&path, body)
        .map_err(|e| ToolchainError::Io(format!("Failed to write {}: {}", name, e)))?;
    Ok(path)
}

// ============================================================================
// Invoker
// ============================================================================

pub struct ConversionInvoker {
    runner: Arc<dyn CommandRunner>,
    settings: ConvertSettings,
}

impl ConversionInvoker {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ConvertSettings) -> Self {
        ConversionInvoker { runner, settings }
    }

    /// Program and leading args; under WSL the wrapper (or python) runs
    /// inside `wsl` and every path argument is translated.
    fn command_line(&self, script: &Path, paths: &[&Path], extra: &[&str]) -> (String, Vec<String>) {
        let as_arg = |p: &Path| {
            let s = p.to_string_lossy().to_string();
            if self.settings.wsl {
                to_wsl_path(&s)
            } else {
                s
            }
        };

        let mut args = Vec::new();
        let program = if self.settings.wsl {
            args.push(
                self.settings
                    .wsl_wrapper
                    .clone()
                    .unwrap_or_else(|| self.settings.python.clone()),
            );
            "wsl".to_string()
        } else {
            self.settings.python.clone()
        };

        args.push(as_arg(script));
        args.extend(paths.iter().map(|&p| as_arg(p)));
        args.extend(extra.iter().map(|s| s.to_string()));
        (program, args)
    }

    /// Convert the model folder to `<folder>/<output dir>/<model_name>.h5`
    pub async fn tfjs_to_keras(
        &self,
        folder: &Path,
        model_name: &str,
    ) -> Result<KerasArtifact, ToolchainError> {
        let model = inspect_model_folder(folder.to_path_buf()).await?;
        let model_name = safe_component(model_name, "model name")?;

        let output_dir = folder.join(&self.settings.keras_output_dir);
        let file_name = format!("{}.h5", model_name);
        let output_path = output_dir.join(&file_name);
        let script = off_runtime(move || {
            std::fs::create_dir_all(&output_dir)
                .map_err(|e| ToolchainError::Io(format!("Failed to create output dir: {}", e)))?;
            write_script(&output_dir, "tfjs_to_keras.py", KERAS_SCRIPT)
        })
        .await?;

        tlog!(
            "[convert] Keras conversion of {} ({} weight file(s))",
            model.normalized_path,
            model.weight_files.len()
        );
        let (program, args) =
            self.command_line(&script, &[folder, output_path.as_path()], &[model_name.as_str()]);
        let output = self
            .runner
            .run(&program, &args, Some(folder))
            .await?
            .into_result()?;

        let produced = tokio::fs::metadata(&output_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !produced {
            return Err(ToolchainError::MissingArtifact(
                output_path.to_string_lossy().to_string(),
            ));
        }

        tlog!("[convert] Wrote {}", output_path.display());
        Ok(KerasArtifact {
            output_path,
            file_name,
            output: output.stdout.trim().to_string(),
        })
    }

    /// Convert uploaded model files to TFLite. The files live in a scratch
    /// folder under `work_root` for the duration of the call; the `.tflite`
    /// is left in `work_root` as well as returned.
    pub async fn tfjs_to_tflite(
        &self,
        work_root: &Path,
        model_name: &str,
        files: &[InlineFile],
    ) -> Result<TfliteArtifact, ToolchainError> {
        let model_name = safe_component(model_name, "model name")?;
        if files.is_empty() {
            return Err(ToolchainError::InvalidInput("No model files uploaded".to_string()));
        }

        let root = work_root.to_path_buf();
        let uploads = files.to_vec();
        let (scratch, script) = off_runtime(move || stage_uploads(&root, &uploads)).await?;

        let file_name = format!("{}.tflite", model_name);
        let output_path = work_root.join(&file_name);
        let result = self
            .run_tflite(&scratch.path, &script, &output_path, file_name)
            .await;

        // Removing the scratch tree is blocking work as well
        let _ = tokio::task::spawn_blocking(move || drop(scratch)).await;
        result
    }

    async fn run_tflite(
        &self,
        scratch: &Path,
        script: &Path,
        output_path: &Path,
        file_name: String,
    ) -> Result<TfliteArtifact, ToolchainError> {
        let model_json = scratch.join(MODEL_JSON);
        let (program, args) = self.command_line(script, &[model_json.as_path(), output_path], &[]);
        let output = self
            .runner
            .run(&program, &args, Some(scratch))
            .await?
            .into_result()?;

        let body = tokio::fs::read(output_path).await.map_err(|_| {
            ToolchainError::MissingArtifact(output_path.to_string_lossy().to_string())
        })?;
        let size_kb = format!("{:.2}", body.len() as f64 / 1024.0);
        tlog!("[convert] {} is {} KB", file_name, size_kb);

        let file_content = off_runtime(move || Ok(BASE64.encode(&body))).await?;
        Ok(TfliteArtifact {
            file_name,
            file_content,
            size_kb,
            output: output.stdout.trim().to_string(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
