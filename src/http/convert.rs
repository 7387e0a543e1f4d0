// src/http/convert.rs
//
// TensorFlow.js model endpoints: folder validation, Keras conversion of a
// folder on disk, TFLite conversion of uploaded files.

use std::path::PathBuf;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{bad_body, failure, present, reply, AppState};
use crate::toolchain::convert::{inspect_model_folder, InlineFile, MODEL_JSON};
use crate::toolchain::ToolchainError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FolderRequest {
    #[serde(default)]
    folder_path: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InlineModelRequest {
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    files: Vec<InlineFile>,
}

fn status_for(e: &ToolchainError) -> StatusCode {
    if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

pub(super) async fn validate_model_path(
    payload: Result<Json<FolderRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(folder) = present(&request.folder_path) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Model folder validation failed",
            "folderPath is required",
        );
    };

    match inspect_model_folder(PathBuf::from(folder)).await {
        Ok(model) => {
            tlog!(
                "[convert] {} holds a model with {} weight file(s)",
                model.normalized_path,
                model.weight_files.len()
            );
            reply(
                StatusCode::OK,
                json!({
                    "message": "Model folder validation successful",
                    "normalizedPath": model.normalized_path,
                    "weightFiles": model.weight_files,
                }),
            )
        }
        Err(e) => {
            tlog!("[convert] Validation of {} failed: {}", folder, e);
            failure(status_for(&e), "Model folder validation failed", e.detail())
        }
    }
}

pub(super) async fn tfjs_to_keras(
    State(state): State<AppState>,
    payload: Result<Json<FolderRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(folder) = present(&request.folder_path).map(PathBuf::from) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing folder path",
            "folderPath is required",
        );
    };
    let has_model = tokio::fs::metadata(folder.join(MODEL_JSON))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !has_model {
        return failure(
            StatusCode::BAD_REQUEST,
            "model.json not found",
            format!("No model.json file in {}", folder.display()),
        );
    }
    let model_name = present(&request.model_name).unwrap_or("model");

    match state.convert.tfjs_to_keras(&folder, model_name).await {
        Ok(artifact) => reply(
            StatusCode::OK,
            json!({
                "message": "Keras conversion successful!",
                "outputPath": artifact.output_path.to_string_lossy(),
                "fileName": artifact.file_name,
                "output": artifact.output,
            }),
        ),
        Err(e) => {
            tlog!("[convert] Keras conversion failed: {}", e);
            failure(status_for(&e), "Keras conversion failed", e.detail())
        }
    }
}

pub(super) async fn tfjs_to_tflite(
    State(state): State<AppState>,
    payload: Result<Json<InlineModelRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    if request.files.is_empty() {
        return failure(
            StatusCode::BAD_REQUEST,
            "No model files provided",
            "files must contain model.json and its weight files",
        );
    }
    let model_name = present(&request.model_name).unwrap_or("model");

    let work_root = PathBuf::from(&state.settings.folders.tflite);
    if let Err(e) = tokio::fs::create_dir_all(&work_root).await {
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "TFLite conversion failed",
            format!("Failed to create {}: {}", work_root.display(), e),
        );
    }

    match state
        .convert
        .tfjs_to_tflite(&work_root, model_name, &request.files)
        .await
    {
        Ok(artifact) => reply(
            StatusCode::OK,
            json!({
                "message": "TFLite conversion successful!",
                "output": artifact.output,
                "fileName": artifact.file_name,
                "fileContent": artifact.file_content,
                "sizeKB": artifact.size_kb,
            }),
        ),
        Err(e) => {
            tlog!("[convert] TFLite conversion failed: {}", e);
            failure(status_for(&e), "TFLite conversion failed", e.detail())
        }
    }
}
