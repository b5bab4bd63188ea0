//! Job supervisor.
//!
//! Owns the single job slot. Admission is an atomic check-and-set under one lock:
//! a new job is only accepted when there is no job yet or the current one has a
//! terminal status. Status queries never wait on a running job.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::job::{JobDescriptor, JobHandle, JobRequest, MeasurementJob};
use crate::config::JobConfig;
use crate::error::{AppResult, SweepError};
use crate::hardware::replay::ReplaySample;
use crate::hardware::InstrumentOpener;
use crate::storage::CsvResultsWriter;
use crate::telemetry::TelemetryPublisher;

struct ActiveJob {
    handle: JobHandle,
    task: Option<JoinHandle<()>>,
}

/// Admits, runs and tracks measurement jobs, at most one at a time.
pub struct JobSupervisor {
    opener: Arc<dyn InstrumentOpener>,
    telemetry: TelemetryPublisher,
    defaults: JobConfig,
    results: Option<CsvResultsWriter>,
    next_id: AtomicU64,
    current: Mutex<Option<ActiveJob>>,
}

impl JobSupervisor {
    /// Supervisor opening instruments through `opener` and publishing to `telemetry`.
    pub fn new(opener: Arc<dyn InstrumentOpener>, telemetry: TelemetryPublisher) -> Self {
        Self {
            opener,
            telemetry,
            defaults: JobConfig::default(),
            results: None,
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
        }
    }

    /// Defaults applied to test runs
    pub fn with_defaults(mut self, defaults: JobConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Persist every finished job through `writer`
    pub fn with_results(mut self, writer: CsvResultsWriter) -> Self {
        self.results = Some(writer);
        self
    }

    /// Job defaults in effect
    pub fn defaults(&self) -> &JobConfig {
        &self.defaults
    }

    /// Name of the instrument backend
    pub fn backend_name(&self) -> &str {
        self.opener.name()
    }

    /// Admit and start a job.
    ///
    /// # Errors
    /// `SweepError::Validation` for a sweep longer than the configured maximum.
    /// `SweepError::AlreadyRunning` if a job is queued or running; the existing job
    /// is left untouched.
    #[instrument(skip(self, request), fields(address = %request.instrument_address()))]
    pub fn start(&self, request: JobRequest) -> AppResult<JobHandle> {
        self.defaults
            .check_iteration_count(request.spec.iteration_count)?;

        let mut slot = self.current.lock();

        if let Some(active) = slot.as_ref() {
            let descriptor = active.handle.descriptor();
            if !descriptor.status.is_terminal() {
                warn!(job_id = descriptor.id, status = %descriptor.status, "Rejecting start, process was already running");
                return Err(SweepError::AlreadyRunning {
                    job_id: descriptor.id,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (job, handle) = MeasurementJob::new(
            id,
            request,
            Arc::clone(&self.opener),
            self.telemetry.clone(),
        );
        let failsafe = job.failsafe();
        let results = self.results.clone();

        let task = tokio::spawn(async move {
            // Inner task so a panicking job still releases its instrument and slot
            let report = match tokio::spawn(job.run()).await {
                Ok(report) => report,
                Err(err) => {
                    error!(job_id = id, error = %err, "Job worker crashed");
                    failsafe.fail(format!("job worker crashed: {}", err)).await
                }
            };
            if let Some(writer) = results {
                let outcome = tokio::task::spawn_blocking(move || writer.write_report(&report)).await;
                match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(job_id = id, error = %err, "Failed to persist job results"),
                    Err(err) => warn!(job_id = id, error = %err, "Results writer task failed"),
                }
            }
        });

        info!(job_id = id, "Job admitted");
        *slot = Some(ActiveJob {
            handle: handle.clone(),
            task: Some(task),
        });
        Ok(handle)
    }

    /// Start a replay of literal `(voltage, current)` pairs.
    ///
    /// Uses the configured settle delay and timeout.
    ///
    /// `timeout` and `inter_step_delay` fall back to the configured defaults.
    ///
    /// # Errors
    /// `SweepError::Validation` for an empty list or non-finite values, otherwise as
    /// [`JobSupervisor::start`].
    pub fn start_test(
        &self,
        samples: Vec<ReplaySample>,
        timeout: Option<Duration>,
        inter_step_delay: Option<Duration>,
    ) -> AppResult<JobHandle> {
        if samples.is_empty() {
            return Err(SweepError::Validation(
                "testSamples must contain at least one pair".to_string(),
            ));
        }
        if samples
            .iter()
            .any(|s| !s.voltage().is_finite() || !s.current().is_finite())
        {
            return Err(SweepError::Validation(
                "testSamples must be finite numbers".to_string(),
            ));
        }
        let request = JobRequest::replay(samples)
            .with_inter_step_delay(
                inter_step_delay.unwrap_or_else(|| self.defaults.default_inter_step_delay()),
            )
            .with_timeout(timeout.unwrap_or_else(|| self.defaults.default_timeout()));
        self.start(request)
    }

    /// Ask the current job to stop after its current point.
    ///
    /// Returns the id of the job that was signalled, `None` when nothing is running.
    pub fn request_stop(&self) -> Option<u64> {
        let slot = self.current.lock();
        let active = slot.as_ref()?;
        if active.handle.descriptor().status.is_terminal() {
            return None;
        }
        info!(job_id = active.handle.id(), "Stop requested");
        active.handle.request_stop();
        Some(active.handle.id())
    }

    /// Descriptor of the current (or most recent) job, `None` before the first job.
    pub fn status(&self) -> Option<JobDescriptor> {
        self.current
            .lock()
            .as_ref()
            .map(|active| active.handle.descriptor())
    }

    /// Stop the current job and wait for it (results file included), bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.request_stop();
        let task = self
            .current
            .lock()
            .as_mut()
            .and_then(|active| active.task.take());

        if let Some(task) = task {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => info!("Job worker finished"),
                Ok(Err(err)) => warn!(error = %err, "Job worker panicked"),
                Err(_) => warn!(?grace, "Job worker did not stop in time"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::job::{JobStatus, SweepSpec};
    use crate::hardware::mock::MockOpener;
    use crate::hardware::{SourceType, Wiring};
    use crate::telemetry::TelemetryRelay;

    fn spec(count: usize) -> SweepSpec {
        SweepSpec {
            source_type: SourceType::Voltage,
            start: 0.0,
            end: 1.0,
            iteration_count: count,
            both_ways: false,
            compliance_limit: 0.1,
            wiring: Wiring::TwoWire,
        }
    }

    #[tokio::test]
    async fn idle_supervisor_has_no_status() {
        let relay = TelemetryRelay::spawn();
        let supervisor = JobSupervisor::new(Arc::new(MockOpener::new()), relay.publisher());
        assert!(supervisor.status().is_none());
        assert_eq!(supervisor.request_stop(), None);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new().with_step_latency(Duration::from_millis(20)));
        let supervisor = JobSupervisor::new(opener, relay.publisher());

        let first = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(50)))
            .unwrap();
        let err = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(5)))
            .unwrap_err();
        assert!(matches!(err, SweepError::AlreadyRunning { job_id } if job_id == first.id()));
        assert_eq!(supervisor.status().unwrap().id, first.id());

        supervisor.request_stop();
        assert_eq!(first.wait().await.status, JobStatus::Aborted);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn rejection_is_logged() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new().with_step_latency(Duration::from_millis(20)));
        let supervisor = JobSupervisor::new(opener, relay.publisher());

        let first = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(20)))
            .unwrap();
        assert!(supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(2)))
            .is_err());
        assert!(logs_contain("Rejecting start"));

        supervisor.request_stop();
        first.wait().await;
    }

    #[tokio::test]
    async fn new_job_admitted_after_terminal() {
        let relay = TelemetryRelay::spawn();
        let supervisor = JobSupervisor::new(Arc::new(MockOpener::new()), relay.publisher());

        let first = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(3)))
            .unwrap();
        assert_eq!(first.wait().await.status, JobStatus::Finished);

        let second = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(3)))
            .unwrap();
        assert!(second.id() > first.id());
        assert_eq!(second.wait().await.status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn empty_test_samples_are_rejected() {
        let relay = TelemetryRelay::spawn();
        let supervisor = JobSupervisor::new(Arc::new(MockOpener::new()), relay.publisher());
        let err = supervisor.start_test(Vec::new(), None, None).unwrap_err();
        assert!(matches!(err, SweepError::Validation(_)));
        let err = supervisor
            .start_test(vec![ReplaySample(f64::NAN, 0.0)], None, None)
            .unwrap_err();
        assert!(matches!(err, SweepError::Validation(_)));
        assert!(supervisor.status().is_none());
    }

    #[tokio::test]
    async fn test_run_uses_configured_defaults() {
        let relay = TelemetryRelay::spawn();
        let mut defaults = JobConfig::default();
        defaults.default_inter_step_delay_ms = 0;
        let supervisor = JobSupervisor::new(Arc::new(MockOpener::new()), relay.publisher())
            .with_defaults(defaults);

        let handle = supervisor
            .start_test(vec![ReplaySample(0.0, 0.0), ReplaySample(1.0, 1e-3)], None, None)
            .unwrap();
        let descriptor = handle.wait().await;
        assert_eq!(descriptor.status, JobStatus::Finished);
        assert_eq!(descriptor.sample_count, 2);
    }

    #[tokio::test]
    async fn oversized_sweep_is_rejected_before_admission() {
        let relay = TelemetryRelay::spawn();
        let supervisor = JobSupervisor::new(Arc::new(MockOpener::new()), relay.publisher());

        let err = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(2_305_843_009_213_693_952)))
            .unwrap_err();
        assert!(matches!(err, SweepError::Validation(_)));
        assert!(supervisor.status().is_none());
    }

    #[tokio::test]
    async fn crashed_worker_frees_the_slot() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new().with_panic_at(2));
        let supervisor = JobSupervisor::new(opener.clone(), relay.publisher());

        let first = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(5)))
            .unwrap();
        let descriptor = tokio::time::timeout(Duration::from_secs(5), first.wait())
            .await
            .unwrap();
        assert_eq!(descriptor.status, JobStatus::Failed);
        assert!(descriptor.message.unwrap().contains("crashed"));

        let probe = opener.last_probe().unwrap();
        assert_eq!(probe.shutdown_calls(), 1);
        assert_eq!(probe.close_calls(), 1);
        assert!(!probe.output_enabled());

        assert!(supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(2)))
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new().with_step_latency(Duration::from_millis(20)));
        let supervisor = Arc::new(JobSupervisor::new(opener, relay.publisher()));

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move {
                    supervisor.start(JobRequest::sweep("ASRL7::INSTR", spec(50)))
                })
            })
            .collect();

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(handle) => admitted.push(handle),
                Err(SweepError::AlreadyRunning { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert_eq!(admitted.len(), 1);
        assert_eq!(rejected, 15);

        supervisor.request_stop();
        assert_eq!(admitted[0].wait().await.status, JobStatus::Aborted);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn shutdown_waits_for_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let relay = TelemetryRelay::spawn();
        let supervisor = JobSupervisor::new(Arc::new(MockOpener::new()), relay.publisher())
            .with_results(CsvResultsWriter::new(dir.path()));

        let handle = supervisor
            .start(JobRequest::sweep("ASRL7::INSTR", spec(4)))
            .unwrap();
        handle.wait().await;
        supervisor.shutdown(Duration::from_secs(5)).await;

        let csv_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "csv"))
            .count();
        assert_eq!(csv_files, 1);
    }
}
