use crate::{
    codec::ImageSource,
    job::{Detections, Job, JobError, JobResult, RawDetections},
    model_service::ModelService,
    reporter::ResultReporter,
    telemetry::Metrics,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    any::Any,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::instrument;

type SharedModel = Arc<Mutex<Box<dyn ModelService>>>;

/// Runs each submitted job on its own task and reports exactly one result per job.
#[derive(Clone)]
pub struct JobDispatcher {
    model: SharedModel,
    reporter: Arc<dyn ResultReporter>,
    metrics: Arc<Metrics>,
    in_flight: Arc<InFlight>,
}

/// Count of submitted jobs that have not reported yet.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl JobDispatcher {
    pub fn new(
        model: impl ModelService,
        reporter: impl ResultReporter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            model: Arc::new(Mutex::new(Box::new(model))),
            reporter: Arc::new(reporter),
            metrics,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Number of submitted jobs that have not reported yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until every submitted job has reported.
    pub async fn drain(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            // registered before the count is read so a last job finishing
            // in between still wakes us
            idle.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Schedules the job and returns at once. Dropping the handle does not
    /// cancel the job.
    pub fn submit(&self, job: Job) -> JoinHandle<()> {
        self.metrics.record_job_submitted();
        tracing::debug!("Submitting job {} with model {:?}", job.id, job.model_path);

        let model = self.model.clone();
        let reporter = self.reporter.clone();
        let metrics = self.metrics.clone();
        let in_flight = InFlightGuard::enter(&self.in_flight);

        tokio::spawn(async move {
            let _in_flight = in_flight;
            let Job {
                id,
                image,
                model_path,
            } = job;
            let started = Instant::now();

            let outcome = tokio::task::spawn_blocking(move || run_job(&model, image, &model_path))
                .await
                .unwrap_or_else(|join_error| {
                    Err(JobError::Panicked(if join_error.is_panic() {
                        panic_message(join_error.into_panic())
                    } else {
                        join_error.to_string()
                    }))
                });

            let duration_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                Ok(detections) => {
                    tracing::info!(
                        "Job {} finished with {} detections in {} ms",
                        id,
                        detections.names.len(),
                        duration_ms
                    );
                    metrics.record_job_completed("success", "none", duration_ms);
                }
                Err(e) => {
                    tracing::warn!("Job {} failed ({}): {}", id, e.category(), e);
                    metrics.record_job_completed("failure", e.category(), duration_ms);
                }
            }

            let result = JobResult::from(outcome);
            if let Err(e) = reporter.report(&id, &result).await {
                tracing::warn!("Failed to report result of job {}: {}", id, e);
            }
        })
    }
}

#[instrument(skip(model, image))]
fn run_job(
    model: &Mutex<Box<dyn ModelService>>,
    image: ImageSource,
    model_path: &Path,
) -> Result<Detections, JobError> {
    let image = image.decode()?;

    let raw = {
        let mut session = SessionScope::open(model);
        session.detect(&image, model_path)?
    };

    Detections::from_raw(raw)
}

/// Exclusive use of the engine. The session is cleared when the scope opens
/// and again when it drops, including during unwinding.
struct SessionScope<'a> {
    guard: MutexGuard<'a, Box<dyn ModelService>>,
}

impl<'a> SessionScope<'a> {
    fn open(model: &'a Mutex<Box<dyn ModelService>>) -> Self {
        let mut guard = model.lock();
        guard.clear_session();
        Self { guard }
    }

    fn detect(
        &mut self,
        image: &image::DynamicImage,
        model_path: &Path,
    ) -> Result<RawDetections, JobError> {
        Ok(self.guard.detect(image, model_path)?)
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        self.guard.clear_session();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model_service::ModelError, reporter::ReportError};
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use std::{
        path::PathBuf,
        sync::atomic::AtomicBool,
        time::Duration,
    };
    use tokio::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Detect,
        UnknownClass,
        Fail,
        Panic,
        Slow(Duration),
    }

    #[derive(Default)]
    struct Counters {
        clears: AtomicUsize,
        detects: AtomicUsize,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    struct MockModelService {
        behaviour: Behaviour,
        counters: Arc<Counters>,
    }

    impl MockModelService {
        fn new(behaviour: Behaviour) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    behaviour,
                    counters: counters.clone(),
                },
                counters,
            )
        }
    }

    impl ModelService for MockModelService {
        fn clear_session(&mut self) {
            self.counters.clears.fetch_add(1, Ordering::SeqCst);
        }

        fn detect(
            &mut self,
            _image: &DynamicImage,
            _model_path: &Path,
        ) -> Result<RawDetections, ModelError> {
            if self.counters.in_flight.swap(true, Ordering::SeqCst) {
                self.counters.overlapped.store(true, Ordering::SeqCst);
            }
            self.counters.detects.fetch_add(1, Ordering::SeqCst);

            let outcome = match self.behaviour {
                Behaviour::Detect => Ok(RawDetections {
                    class_ids: vec![1],
                    scores: vec![0.99],
                    rois: vec![[0.0, 0.0, 5.0, 5.0]],
                }),
                Behaviour::UnknownClass => Ok(RawDetections {
                    class_ids: vec![81],
                    scores: vec![0.5],
                    rois: vec![[0.0, 0.0, 1.0, 1.0]],
                }),
                Behaviour::Fail => Err(ModelError::Inference("engine exploded".into())),
                Behaviour::Panic => {
                    self.counters.in_flight.store(false, Ordering::SeqCst);
                    panic!("engine panicked")
                }
                Behaviour::Slow(delay) => {
                    std::thread::sleep(delay);
                    Ok(RawDetections::default())
                }
            };

            self.counters.in_flight.store(false, Ordering::SeqCst);
            outcome
        }
    }

    struct RecordingReporter {
        tx: mpsc::UnboundedSender<(String, JobResult)>,
    }

    #[async_trait]
    impl ResultReporter for RecordingReporter {
        async fn report(&self, job_id: &str, result: &JobResult) -> Result<(), ReportError> {
            let _ = self.tx.send((job_id.to_string(), result.clone()));
            Ok(())
        }
    }

    struct FailingReporter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResultReporter for FailingReporter {
        async fn report(&self, _job_id: &str, _result: &JobResult) -> Result<(), ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ReportError::Status(503))
        }
    }

    fn dispatcher(
        behaviour: Behaviour,
    ) -> (
        JobDispatcher,
        Arc<Counters>,
        mpsc::UnboundedReceiver<(String, JobResult)>,
    ) {
        let (model, counters) = MockModelService::new(behaviour);
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            JobDispatcher::new(model, RecordingReporter { tx }, metrics),
            counters,
            rx,
        )
    }

    fn black_image_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            image: ImageSource::Decoded(DynamicImage::ImageRgb8(RgbImage::new(10, 10))),
            model_path: PathBuf::from("models/mask_rcnn_coco.onnx"),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<(String, JobResult)>) -> Vec<(String, JobResult)> {
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }

    #[tokio::test]
    async fn test_successful_job_reports_person() {
        let (dispatcher, counters, mut rx) = dispatcher(Behaviour::Detect);

        dispatcher.submit(black_image_job("42")).await.unwrap();

        let reports = drain(&mut rx);
        assert_eq!(
            reports,
            vec![(
                "42".to_string(),
                JobResult::Success(Detections {
                    names: vec!["person".into()],
                    scores: vec![0.99],
                    boxes: vec![[0.0, 0.0, 5.0, 5.0]],
                })
            )]
        );
        assert_eq!(counters.detects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.clears.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_image_reports_failure_once() {
        let (dispatcher, counters, mut rx) = dispatcher(Behaviour::Detect);
        let job = Job {
            id: "7".into(),
            image: ImageSource::Encoded("data:image/png;base64,AAAA".into()),
            model_path: PathBuf::from("models/mask_rcnn_coco.onnx"),
        };

        dispatcher.submit(job).await.unwrap();

        let reports = drain(&mut rx);
        assert_eq!(reports, vec![("7".to_string(), JobResult::Failure)]);
        assert_eq!(counters.detects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_class_reports_failure() {
        let (dispatcher, _counters, mut rx) = dispatcher(Behaviour::UnknownClass);

        dispatcher.submit(black_image_job("81")).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![("81".to_string(), JobResult::Failure)]
        );
    }

    #[tokio::test]
    async fn test_engine_error_reports_failure_and_clears_session() {
        let (dispatcher, counters, mut rx) = dispatcher(Behaviour::Fail);

        dispatcher.submit(black_image_job("3")).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![("3".to_string(), JobResult::Failure)]
        );
        assert_eq!(counters.clears.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_engine_panic_still_reports() {
        let (dispatcher, counters, mut rx) = dispatcher(Behaviour::Panic);

        let handle = dispatcher.submit(black_image_job("9"));

        assert!(handle.await.is_ok());
        assert_eq!(
            drain(&mut rx),
            vec![("9".to_string(), JobResult::Failure)]
        );
        assert_eq!(counters.clears.load(Ordering::SeqCst), 2);

        // the engine lock is still usable after the panic
        dispatcher.submit(black_image_job("10")).await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![("10".to_string(), JobResult::Failure)]
        );
    }

    #[tokio::test]
    async fn test_submit_does_not_wait_for_inference() {
        let (dispatcher, _counters, mut rx) =
            dispatcher(Behaviour::Slow(Duration::from_millis(300)));

        let started = Instant::now();
        let handle = dispatcher.submit(black_image_job("slow"));
        let submit_elapsed = started.elapsed();

        assert!(submit_elapsed < Duration::from_millis(100));
        assert!(rx.try_recv().is_err());

        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_jobs_each_report_once() {
        let (dispatcher, counters, mut rx) =
            dispatcher(Behaviour::Slow(Duration::from_millis(20)));

        let handles: Vec<_> = (0..8)
            .map(|i| dispatcher.submit(black_image_job(&i.to_string())))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut ids: Vec<String> = drain(&mut rx).into_iter().map(|(id, _)| id).collect();
        ids.sort();
        let mut expected: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        expected.sort();
        assert_eq!(ids, expected);
        assert!(!counters.overlapped.load(Ordering::SeqCst));
        assert_eq!(counters.clears.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_report_failure_is_absorbed() {
        let (model, _counters) = MockModelService::new(Behaviour::Detect);
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = JobDispatcher::new(
            model,
            FailingReporter {
                calls: calls.clone(),
            },
            Arc::new(Metrics::new().unwrap()),
        );

        let handle = dispatcher.submit(black_image_job("1"));

        assert!(handle.await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_returns_when_idle() {
        let (dispatcher, _counters, _rx) = dispatcher(Behaviour::Detect);

        tokio::time::timeout(Duration::from_secs(1), dispatcher.drain())
            .await
            .unwrap();
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn test_drain_before_runtime_drop_reports_running_job() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (dispatcher, _counters, mut rx) =
            dispatcher(Behaviour::Slow(Duration::from_millis(300)));

        runtime.block_on(async {
            // handle dropped, as the HTTP route does
            let _ = dispatcher.submit(black_image_job("late"));
            assert_eq!(dispatcher.in_flight(), 1);
            dispatcher.drain().await;
        });
        drop(runtime);

        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![(
                "late".to_string(),
                JobResult::Success(Detections::default())
            )]
        );
    }
}
