use crate::{codec::DecodeError, codec::ImageSource, labels::class_name, model_service::ModelError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

const FAILURE_CONTENT: &str = "error";

#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub image: ImageSource,
    pub model_path: PathBuf,
}

/// Engine output before the class ids are resolved.
/// Each roi is `[y1, x1, y2, x2]` in original image pixels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetections {
    pub class_ids: Vec<i64>,
    pub scores: Vec<f32>,
    pub rois: Vec<[f32; 4]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    pub names: Vec<String>,
    pub scores: Vec<f32>,
    #[serde(rename = "bbox")]
    pub boxes: Vec<[f32; 4]>,
}

impl Detections {
    pub fn from_raw(raw: RawDetections) -> Result<Self, JobError> {
        if raw.class_ids.len() != raw.scores.len() || raw.class_ids.len() != raw.rois.len() {
            return Err(JobError::MalformedOutput {
                class_ids: raw.class_ids.len(),
                scores: raw.scores.len(),
                rois: raw.rois.len(),
            });
        }

        let names = raw
            .class_ids
            .iter()
            .map(|&id| {
                class_name(id)
                    .map(str::to_string)
                    .ok_or(JobError::UnknownClass(id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            names,
            scores: raw.scores,
            boxes: raw.rois,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResult", try_from = "WireResult")]
pub enum JobResult {
    Success(Detections),
    Failure,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireResult {
    Success(Detections),
    Failure(String),
}

impl From<JobResult> for WireResult {
    fn from(result: JobResult) -> Self {
        match result {
            JobResult::Success(detections) => WireResult::Success(detections),
            JobResult::Failure => WireResult::Failure(FAILURE_CONTENT.to_string()),
        }
    }
}

impl TryFrom<WireResult> for JobResult {
    type Error = String;

    fn try_from(wire: WireResult) -> Result<Self, Self::Error> {
        match wire {
            WireResult::Success(detections) => Ok(JobResult::Success(detections)),
            WireResult::Failure(s) if s == FAILURE_CONTENT => Ok(JobResult::Failure),
            WireResult::Failure(other) => Err(format!("unexpected result content: {}", other)),
        }
    }
}

impl From<Result<Detections, JobError>> for JobResult {
    fn from(outcome: Result<Detections, JobError>) -> Self {
        match outcome {
            Ok(detections) => JobResult::Success(detections),
            Err(_) => JobResult::Failure,
        }
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Image decoding failed: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Class id {0} is outside the label table")]
    UnknownClass(i64),
    #[error("Mismatched output lengths: {class_ids} class ids, {scores} scores, {rois} rois")]
    MalformedOutput {
        class_ids: usize,
        scores: usize,
        rois: usize,
    },
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn category(&self) -> &'static str {
        match self {
            JobError::Decode(_) => "decode",
            JobError::Model(e) => e.category(),
            JobError::UnknownClass(_) | JobError::MalformedOutput { .. } | JobError::Panicked(_) => {
                "engine"
            }
        }
    }
}
