// src/http/flash.rs
//
// PlatformIO endpoints: compile + upload, saving platformio.ini and handing
// out default working folders.

use std::path::PathBuf;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{bad_body, failure, present, reply, AppState};
use crate::toolchain::build::{default_ini, monitor_speed, save_ini, write_project};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CompileFlashRequest {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    board: Option<String>,
    #[serde(default)]
    config: Option<String>,
    #[serde(default)]
    folder_path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SaveConfigRequest {
    #[serde(default)]
    folder_path: Option<String>,
    #[serde(default)]
    config: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct SelectFolderRequest {
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

pub(super) async fn compile_flash(
    State(state): State<AppState>,
    payload: Result<Json<CompileFlashRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    let Some(code) = request.code.filter(|c| !c.trim().is_empty()) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing Arduino code.",
            "Code field is empty.",
        );
    };
    let Some(folder) = present(&request.folder_path).map(PathBuf::from) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing folder path.",
            "PlatformIO working folder not selected.",
        );
    };
    let board = present(&request.board).unwrap_or("uno").to_string();
    let ini = match present(&request.config) {
        Some(_) => request.config.clone().unwrap_or_default(),
        None => default_ini(&board),
    };

    if let Err(e) = write_project(&folder, &code, &ini).await {
        tlog!("[build] {}", e);
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to prepare project files.",
            e.detail(),
        );
    }

    let baud_rate = monitor_speed(&ini).unwrap_or(state.settings.serial.baud_rate);
    let access = state.bridge.exclusive().await;
    if access.was_monitoring() {
        tlog!("[build] Serial monitor released for upload");
    }

    match state.build.upload(&folder).await {
        Ok(output) => {
            let serial_monitor = if state.settings.build.reconnect_after_upload {
                match access.reconnect(baud_rate).await {
                    Ok(port) => {
                        tlog!("[build] Serial monitor restarted on {} at {}", port, baud_rate);
                        "started"
                    }
                    Err(e) => {
                        tlog!("[build] Serial monitor not restarted: {}", e);
                        "failed"
                    }
                }
            } else {
                drop(access);
                "skipped"
            };

            reply(
                StatusCode::OK,
                json!({
                    "message": format!("Compilation and Upload for {} succeeded!", board),
                    "output": output.stdout.trim(),
                    "serialMonitor": serial_monitor,
                }),
            )
        }
        Err(e) => {
            // Give the monitor back if the upload took it away
            if access.was_monitoring() {
                let previous = access.previous_baud().unwrap_or(baud_rate);
                if let Err(re) = access.reconnect(previous).await {
                    tlog!("[build] Serial monitor not restored: {}", re);
                }
            }
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Compilation or Upload failed.",
                e.detail(),
            )
        }
    }
}

pub(super) async fn save_config(
    payload: Result<Json<SaveConfigRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    let (Some(folder), Some(_)) = (present(&request.folder_path), present(&request.config)) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing folder path or config",
            "Both folderPath and config are required",
        );
    };
    let config = request.config.clone().unwrap_or_default();

    match save_ini(&PathBuf::from(folder), &config).await {
        Ok(path) => {
            tlog!("[build] Saved {}", path.display());
            reply(
                StatusCode::OK,
                json!({
                    "message": "platformio.ini saved successfully",
                    "path": path.to_string_lossy(),
                }),
            )
        }
        Err(e) => {
            tlog!("[build] {}", e);
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to save platformio.ini",
                e.detail(),
            )
        }
    }
}

pub(super) async fn select_folder(
    State(state): State<AppState>,
    payload: Result<Json<SelectFolderRequest>, JsonRejection>,
) -> Response {
    // An empty or missing body just means "no type"
    let kind = payload.ok().and_then(|Json(r)| r.kind).unwrap_or_default();

    let folder = match kind.as_str() {
        "pio" => PathBuf::from(&state.settings.folders.pio),
        "tflite" => PathBuf::from(&state.settings.folders.tflite),
        _ => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                return failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to resolve working directory",
                    e,
                )
            }
        },
    };

    if let Err(e) = tokio::fs::create_dir_all(&folder).await {
        tlog!("[http] Failed to create {}: {}", folder.display(), e);
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create folder",
            e,
        );
    }

    reply(
        StatusCode::OK,
        json!({
            "message": "Default folder path returned. You can edit this path manually in the text box.",
            "folderPath": folder.to_string_lossy(),
        }),
    )
}
