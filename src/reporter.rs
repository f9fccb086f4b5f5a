use crate::{config::ResultsServiceConfig, job::JobResult};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

pub const RESULTS_PATH: &str = "/v1/simulation-results";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Results service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Results service answered with status {0}")]
    Status(u16),
}

#[async_trait]
pub trait ResultReporter: Send + Sync + 'static {
    async fn report(&self, job_id: &str, result: &JobResult) -> Result<(), ReportError>;
}

/// `content` carries the result as a JSON document inside a string field.
#[derive(Debug, Serialize)]
pub struct ReportBody<'a> {
    pub id: &'a str,
    pub content: String,
}

impl<'a> ReportBody<'a> {
    pub fn new(job_id: &'a str, result: &JobResult) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: job_id,
            content: serde_json::to_string(result)?,
        })
    }
}

/// Single-shot PUT to the results service. No retry.
pub struct HttpResultReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpResultReporter {
    pub fn new(config: &ResultsServiceConfig) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", config.get_address(), RESULTS_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ResultReporter for HttpResultReporter {
    #[instrument(skip(self, result))]
    async fn report(&self, job_id: &str, result: &JobResult) -> Result<(), ReportError> {
        let body = ReportBody::new(job_id, result)?;

        // `json` sets `Content-Type: application/json`, which the results service requires.
        let response = self.client.put(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status(status.as_u16()));
        }

        tracing::debug!("Reported result for job {} ({})", job_id, status);
        Ok(())
    }
}
