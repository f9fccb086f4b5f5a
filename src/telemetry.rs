use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to build prometheus exporter: {0}")]
    Exporter(String),
    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
    #[error("Metrics output is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct Metrics {
    jobs_submitted: Counter<u64>,
    jobs_completed: Counter<u64>,
    models_uploaded: Counter<u64>,
    inference_duration: Histogram<u64>,
    // dropping the last provider handle shuts its readers down
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| MetricsError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("segmentation_service");
        global::set_meter_provider(provider.clone());

        let jobs_submitted = meter
            .u64_counter("jobs_submitted_total")
            .with_description("Total number of submitted segmentation jobs")
            .build();

        let jobs_completed = meter
            .u64_counter("jobs_completed_total")
            .with_description("Total number of finished jobs by outcome")
            .build();

        let models_uploaded = meter
            .u64_counter("models_uploaded_total")
            .with_description("Total number of uploaded model files")
            .build();

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(duration_boundaries(100, 120_000))
            .with_description("Duration of a job's decode and inference in milliseconds")
            .build();

        Ok(Metrics {
            jobs_submitted,
            jobs_completed,
            models_uploaded,
            inference_duration,
            _provider: provider,
            registry,
        })
    }

    pub fn record_job_submitted(&self) {
        self.jobs_submitted.add(1, &[]);
    }

    pub fn record_job_completed(&self, outcome: &str, category: &str, duration_ms: u64) {
        let attributes = [
            KeyValue::new("outcome", outcome.to_string()),
            KeyValue::new("category", category.to_string()),
        ];
        self.jobs_completed.add(1, &attributes);
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_model_uploaded(&self) {
        self.models_uploaded.add(1, &[]);
    }

    pub fn render(&self) -> Result<String, MetricsError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Doubling bucket boundaries from `start` up to and including `end`.
fn duration_boundaries(start: u64, end: u64) -> Vec<f64> {
    let mut boundaries = Vec::new();
    let mut current = start.max(1);
    while current < end {
        boundaries.push(current as f64);
        current *= 2;
    }
    boundaries.push(end as f64);
    boundaries
}
