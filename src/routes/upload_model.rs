use crate::{config::sanitize_file_name, server::SharedState};
use axum::{
    extract::{
        multipart::{Field, MultipartError},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::instrument;

const MODEL_FIELD: &str = "model";

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum UploadModelError {
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing `model` file field")]
    MissingField,
    #[error("Invalid model file name: {0:?}")]
    InvalidFileName(String),
    #[error("Failed to store model: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for UploadModelError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadModelError::Multipart(e) => e.status(),
            UploadModelError::MissingField | UploadModelError::InvalidFileName(_) => {
                StatusCode::BAD_REQUEST
            }
            UploadModelError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!("Model upload rejected: {}", self);
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadModelResponse {
    pub hello: String,
    pub name: String,
}

#[instrument(skip(state, multipart))]
pub async fn upload_model(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<UploadModelResponse>, UploadModelError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(MODEL_FIELD) {
            continue;
        }

        let raw_name = field.file_name().unwrap_or_default().to_string();
        let file_name = sanitize_file_name(&raw_name)
            .ok_or_else(|| UploadModelError::InvalidFileName(raw_name.clone()))?
            .to_string();

        let bytes = store_field(field, &state.models.dir, &file_name).await?;
        state.metrics.record_model_uploaded();
        tracing::info!("Stored model {} ({} bytes)", file_name, bytes);

        return Ok(Json(UploadModelResponse {
            hello: "MODELADDED".into(),
            name: file_name,
        }));
    }

    Err(UploadModelError::MissingField)
}

/// A temporary path next to the target that no other upload uses.
fn partial_path(dir: &Path, file_name: &str) -> PathBuf {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{}.{}.{}.part", file_name, std::process::id(), seq))
}

/// Streams the field into a private partial file and renames it into place
/// once complete, so a model file is never visible half written.
async fn store_field(
    mut field: Field<'_>,
    dir: &Path,
    file_name: &str,
) -> Result<u64, UploadModelError> {
    let target = dir.join(file_name);
    let partial = partial_path(dir, file_name);

    let written = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .await?;
        let mut written = 0u64;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<_, UploadModelError>(written)
    }
    .await;

    match written {
        Ok(written) => {
            fs::rename(&partial, &target).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            Err(e)
        }
    }
}
