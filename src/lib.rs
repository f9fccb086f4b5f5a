mod labels;
mod ort_service;
mod routes;

pub mod app;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod job;
pub mod model_service;
pub mod reporter;
pub mod server;
pub mod telemetry;

pub use app::start_app;
pub use labels::{class_name, COCO_CLASS_NAMES};
pub use ort_service::OrtModelService;
pub use routes::{SubmitJobRequest, SubmitJobResponse, UploadModelResponse};
