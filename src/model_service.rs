use crate::job::RawDetections;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model file not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Failed to load model {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

impl ModelError {
    pub fn category(&self) -> &'static str {
        match self {
            ModelError::NotFound(_) | ModelError::Load { .. } => "model",
            ModelError::Inference(_) | ModelError::Output(_) => "engine",
        }
    }
}

/// A segmentation engine with process-wide session state.
///
/// Implementations are driven from a blocking thread, one call at a time.
/// The dispatcher calls `clear_session` before and after every `detect`.
pub trait ModelService: Send + 'static {
    fn clear_session(&mut self);

    fn detect(
        &mut self,
        image: &DynamicImage,
        model_path: &Path,
    ) -> Result<RawDetections, ModelError>;
}
