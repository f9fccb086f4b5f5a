use crate::{
    config::InferenceConfig,
    job::RawDetections,
    model_service::{ModelError, ModelService},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array3;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

/// Per-channel means in BGR order, subtracted from every pixel.
const MEAN_BGR: [f32; 3] = [102.9801, 115.9465, 122.7717];
const SIZE_DIVISOR: u32 = 32;

struct LoadedModel {
    path: PathBuf,
    session: Session,
}

/// Mask R-CNN exported to ONNX, run through ONNX Runtime.
///
/// The session is created from the job's model path on first use and kept
/// until `clear_session` drops it.
pub struct OrtModelService {
    config: InferenceConfig,
    loaded: Option<LoadedModel>,
}

impl OrtModelService {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            config: config.clone(),
            loaded: None,
        }
    }

    fn session_for(&mut self, model_path: &Path) -> Result<&mut Session, ModelError> {
        let reusable = self
            .loaded
            .as_ref()
            .is_some_and(|loaded| loaded.path == model_path);

        if !reusable {
            let session = load_session(model_path)?;
            tracing::info!("Loaded ONNX session from {:?}", model_path);
            self.loaded = Some(LoadedModel {
                path: model_path.to_path_buf(),
                session,
            });
        }

        self.loaded
            .as_mut()
            .map(|loaded| &mut loaded.session)
            .ok_or_else(|| ModelError::Inference("session not loaded".into()))
    }
}

impl ModelService for OrtModelService {
    fn clear_session(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            tracing::debug!("Dropping ONNX session for {:?}", loaded.path);
        }
    }

    fn detect(
        &mut self,
        image: &DynamicImage,
        model_path: &Path,
    ) -> Result<RawDetections, ModelError> {
        let (input, scale) = prepare_image(image, &self.config)?;
        let min_score = self.config.min_score;
        let session = self.session_for(model_path)?;

        // boxes, labels, scores, masks
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.len() < 3 {
            return Err(ModelError::Output(format!(
                "expected at least 3 outputs, model has {}",
                output_names.len()
            )));
        }

        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (_, boxes) = outputs[output_names[0].as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Output(format!("boxes: {}", e)))?;
        let (_, labels) = outputs[output_names[1].as_str()]
            .try_extract_tensor::<i64>()
            .map_err(|e| ModelError::Output(format!("labels: {}", e)))?;
        let (_, scores) = outputs[output_names[2].as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Output(format!("scores: {}", e)))?;

        let detections = to_raw_detections(boxes, labels, scores, scale, min_score)?;
        tracing::debug!(
            "Kept {} of {} detections above {:.2}",
            detections.class_ids.len(),
            labels.len(),
            min_score
        );

        Ok(detections)
    }
}

fn load_error(path: &Path, e: impl Display) -> ModelError {
    ModelError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn load_session(path: &Path) -> Result<Session, ModelError> {
    if !path.is_file() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }

    Session::builder()
        .map_err(|e| load_error(path, e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| load_error(path, e))?
        .commit_from_file(path)
        .map_err(|e| load_error(path, e))
}

/// Resizes so the short side reaches `min_dimension` without the long side
/// passing `max_dimension`, converts to mean-subtracted BGR and zero-pads
/// both sides to a multiple of 32. Returns the `[3, H, W]` tensor and the
/// applied scale.
fn prepare_image(
    image: &DynamicImage,
    config: &InferenceConfig,
) -> Result<(Array3<f32>, f32), ModelError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ModelError::Inference("image has no pixels".into()));
    }

    let short_side = width.min(height) as f32;
    let long_side = width.max(height) as f32;
    let scale = (config.min_dimension as f32 / short_side)
        .min(config.max_dimension as f32 / long_side);

    let resized_width = ((width as f32 * scale).round() as u32).max(1);
    let resized_height = ((height as f32 * scale).round() as u32).max(1);
    let resized = image
        .resize_exact(resized_width, resized_height, FilterType::Triangle)
        .to_rgb8();

    let padded_width = resized_width.div_ceil(SIZE_DIVISOR) * SIZE_DIVISOR;
    let padded_height = resized_height.div_ceil(SIZE_DIVISOR) * SIZE_DIVISOR;

    let mut input = Array3::<f32>::zeros((3, padded_height as usize, padded_width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, y, x]] = b as f32 - MEAN_BGR[0];
        input[[1, y, x]] = g as f32 - MEAN_BGR[1];
        input[[2, y, x]] = r as f32 - MEAN_BGR[2];
    }

    Ok((input, scale))
}

/// Filters by score and maps `[x1, y1, x2, y2]` boxes in resized coordinates
/// back to `[y1, x1, y2, x2]` in original pixels.
fn to_raw_detections(
    boxes: &[f32],
    labels: &[i64],
    scores: &[f32],
    scale: f32,
    min_score: f32,
) -> Result<RawDetections, ModelError> {
    if scores.len() != labels.len() || boxes.len() != labels.len() * 4 {
        return Err(ModelError::Output(format!(
            "{} boxes values, {} labels, {} scores",
            boxes.len(),
            labels.len(),
            scores.len()
        )));
    }

    let mut detections = RawDetections::default();
    for ((bbox, &label), &score) in boxes.chunks_exact(4).zip(labels).zip(scores) {
        if score < min_score {
            continue;
        }
        detections.class_ids.push(label);
        detections.scores.push(score);
        detections.rois.push([
            bbox[1] / scale,
            bbox[0] / scale,
            bbox[3] / scale,
            bbox[2] / scale,
        ]);
    }

    Ok(detections)
}
