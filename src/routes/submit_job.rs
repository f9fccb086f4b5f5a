use crate::{codec::ImageSource, job::Job, server::SharedState};
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub id: String,
    /// Base64 image, with or without a data-URI header.
    pub image: String,
    /// File name of a model previously uploaded to the models directory.
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub id: String,
}

/// Hands the job to the dispatcher and answers with the echoed id. The
/// outcome only ever reaches the results service.
#[instrument(skip(state, request), fields(job_id = %request.id, model = %request.model))]
pub async fn submit_job(
    State(state): State<SharedState>,
    Json(request): Json<SubmitJobRequest>,
) -> Json<SubmitJobResponse> {
    let model_path = state.models.resolve(&request.model).unwrap_or_else(|| {
        // the directory is not a model file, so the job reports a failure
        tracing::warn!("Unusable model name {:?}", request.model);
        state.models.dir.clone()
    });

    let id = request.id;
    let _ = state.dispatcher.submit(Job {
        id: id.clone(),
        image: ImageSource::Encoded(request.image),
        model_path,
    });

    Json(SubmitJobResponse { id })
}
