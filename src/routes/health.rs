use crate::server::SharedState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Health {
    status: String,
    models_dir_ready: bool,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let models_dir_ready = tokio::fs::metadata(&state.models.dir)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);

    let (code, status) = if models_dir_ready {
        (StatusCode::OK, "Available")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Degraded")
    };

    (
        code,
        Json(Health {
            status: status.into(),
            models_dir_ready,
        }),
    )
}
