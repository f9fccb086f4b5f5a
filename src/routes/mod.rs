mod health;
mod metrics;
mod submit_job;
mod upload_model;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use submit_job::{SubmitJobRequest, SubmitJobResponse};
pub use upload_model::UploadModelResponse;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/upload_model", post(upload_model::upload_model))
        .route("/demo", post(submit_job::submit_job))
}
