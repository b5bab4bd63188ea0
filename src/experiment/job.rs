//! Measurement job state machine.
//!
//! A job drives one instrument session through one sweep and reports what it sees.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  run()  ┌─────────┐  ok   ┌─────────┐  last point  ┌───────────┐
//! │ Created │───────▶│ Startup │──────▶│ Running │─────────────▶│ Completed │
//! └─────────┘         └────┬────┘       └────┬────┘              └─────┬─────┘
//!                          │ error           │ error / stop            │
//!                          ▼                 ▼                         │
//!                     ┌────────┐       ┌──────────────────┐            │
//!                     │ Failed │       │ Failed / Aborted │            │
//!                     └───┬────┘       └────────┬─────────┘            │
//!                         └────────────────┬────┴──────────────────────┘
//!                                          ▼
//!                                      shutdown (exactly once)
//! ```
//!
//! Whatever path is taken, shutdown disables the output, closes the instrument and
//! emits a `Terminal` event. The externally visible [`JobStatus`] only turns terminal
//! after shutdown has finished, so a new job can never be admitted while the previous
//! one still holds the instrument.
//!
//! # Cancellation
//!
//! The cancellation token is polled once per sweep point, after the point has been
//! measured and reported. Stop latency is therefore bounded by one step period
//! (settle delay + instrument I/O). The worker is never torn down preemptively; the
//! only exception is the wall-clock job timeout, which drops the in-flight step and
//! still runs shutdown.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::sweep::generate_sweep;
use crate::error::{AppResult, InstrumentError, SweepError};
use crate::hardware::replay::{ReplaySample, ReplaySmu};
use crate::hardware::{InstrumentOpener, SourceMeasure, SourceType, Wiring};
use crate::telemetry::{TelemetryEvent, TelemetryPublisher, TerminalReason};

/// Status line emitted once a hardware job is configured and its output enabled
pub const SETUP_COMPLETED: &str = "setup completed";

/// Status line emitted once a replay job is ready
pub const TEST_RUN_STARTED: &str = "Starting test run";

/// Address reported for replay jobs
pub const REPLAY_ADDRESS: &str = "replay";

/// Largest sweep a job accepts
pub const MAX_ITERATION_COUNT: usize = 1_000_000;

/// Requested sweep. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSpec {
    /// Sourced quantity
    pub source_type: SourceType,
    /// First setpoint
    pub start: f64,
    /// Turnaround / last setpoint
    pub end: f64,
    /// Number of sweep points (≥ 1)
    pub iteration_count: usize,
    /// Sweep back down to `start`
    pub both_ways: bool,
    /// Ceiling on the measured quantity
    pub compliance_limit: f64,
    /// 2-wire or 4-wire sensing
    pub wiring: Wiring,
}

impl SweepSpec {
    /// Check the sweep bounds.
    ///
    /// # Errors
    /// `SweepError::Validation` for more than [`MAX_ITERATION_COUNT`] points.
    /// `SweepError::Configuration` for a zero point count, non-finite bounds or a
    /// non-positive compliance limit.
    pub fn validate(&self) -> AppResult<()> {
        if self.iteration_count > MAX_ITERATION_COUNT {
            return Err(SweepError::Validation(format!(
                "iteration count {} exceeds the maximum of {}",
                self.iteration_count, MAX_ITERATION_COUNT
            )));
        }
        if self.iteration_count == 0 {
            return Err(SweepError::Configuration(
                "iteration count must be at least 1".to_string(),
            ));
        }
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(SweepError::Configuration(format!(
                "sweep bounds must be finite (start {}, end {})",
                self.start, self.end
            )));
        }
        if !self.compliance_limit.is_finite() || self.compliance_limit <= 0.0 {
            return Err(SweepError::Configuration(format!(
                "compliance limit must be positive, got {}",
                self.compliance_limit
            )));
        }
        Ok(())
    }

    /// Source range the instrument must cover: the larger magnitude of the bounds.
    pub fn source_limit(&self) -> f64 {
        self.start.abs().max(self.end.abs())
    }

    /// Ordered setpoints for this sweep
    pub fn setpoints(&self) -> Vec<f64> {
        generate_sweep(self.start, self.end, self.iteration_count, self.both_ways)
    }

    /// Sweep description matching a literal replay list.
    ///
    /// Replays source voltage; the compliance limit covers the largest replayed current.
    pub fn for_replay(samples: &[ReplaySample]) -> Self {
        let start = samples.first().map(ReplaySample::voltage).unwrap_or(0.0);
        let end = samples.last().map(ReplaySample::voltage).unwrap_or(0.0);
        let peak_current = samples
            .iter()
            .map(|s| s.current().abs())
            .fold(0.0_f64, f64::max);

        Self {
            source_type: SourceType::Voltage,
            start,
            end,
            iteration_count: samples.len(),
            both_ways: false,
            compliance_limit: if peak_current > 0.0 { peak_current } else { 1.0 },
            wiring: Wiring::TwoWire,
        }
    }
}

/// Externally visible job status.
///
/// The numeric ids are part of the status query format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Ran to completion
    Finished,
    /// Ended by an error
    Failed,
    /// Stopped by the operator or the job timeout
    Aborted,
    /// Admitted, not yet started
    Queued,
    /// Executing (including startup and shutdown)
    Running,
}

impl JobStatus {
    /// Numeric status id
    pub fn id(self) -> u8 {
        match self {
            JobStatus::Finished => 0,
            JobStatus::Failed => 1,
            JobStatus::Aborted => 2,
            JobStatus::Queued => 3,
            JobStatus::Running => 4,
        }
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            JobStatus::Finished => "Finished",
            JobStatus::Failed => "Failed",
            JobStatus::Aborted => "Aborted",
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
        }
    }

    /// Whether the run is over
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Aborted
        )
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Aborted => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Internal lifecycle phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Constructed, `run` not called yet
    Created,
    /// Opening and configuring the instrument
    Startup,
    /// Iterating the sweep
    Running,
    /// All points measured
    Completed,
    /// Startup or execution error
    Failed,
    /// Cancelled or timed out
    Aborted,
}

/// One measured sweep point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// 0-based position in the sweep
    pub step: usize,
    /// Programmed source value
    pub setpoint: f64,
    /// Measured complementary value
    pub measured: f64,
    /// Quantity that was sourced
    pub source_type: SourceType,
}

impl MeasurementSample {
    /// Voltage column of this point
    pub fn voltage(&self) -> f64 {
        match self.source_type {
            SourceType::Voltage => self.setpoint,
            SourceType::Current => self.measured,
        }
    }

    /// Current column of this point
    pub fn current(&self) -> f64 {
        match self.source_type {
            SourceType::Voltage => self.measured,
            SourceType::Current => self.setpoint,
        }
    }
}

/// Snapshot of a job's externally visible state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Job id
    pub id: u64,
    /// Current status
    pub status: JobStatus,
    /// Progress in percent, non-decreasing
    pub progress_percent: f64,
    /// Requested sweep
    pub sweep_spec: SweepSpec,
    /// Instrument address (or `replay`)
    pub instrument_address: String,
    /// Samples collected so far
    pub sample_count: usize,
    /// Failure text or abort reason once terminal
    pub message: Option<String>,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// Time the status turned terminal
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    fn new(id: u64, sweep_spec: SweepSpec, instrument_address: String) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            sweep_spec,
            instrument_address,
            sample_count: 0,
            message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `next` if that keeps the status monotonic; returns whether it moved.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            if next.is_terminal() {
                self.finished_at = Some(Utc::now());
            }
            true
        } else {
            false
        }
    }
}

/// Where a job's samples come from
#[derive(Debug, Clone, PartialEq)]
pub enum JobSource {
    /// Real (or mock) instrument opened through the supervisor's opener
    Instrument {
        /// Instrument address, e.g. `ASRL7::INSTR`
        address: String,
    },
    /// Literal (voltage, current) pairs replayed without hardware
    Replay {
        /// Pairs in sweep order
        samples: Vec<ReplaySample>,
    },
}

/// Everything needed to start a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Sweep to run
    pub spec: SweepSpec,
    /// Sample source
    pub source: JobSource,
    /// Settle delay after each source write
    pub inter_step_delay: Duration,
    /// Wall-clock bound on the whole job
    pub timeout: Duration,
}

impl JobRequest {
    /// Sweep on the instrument at `address`
    pub fn sweep(address: impl Into<String>, spec: SweepSpec) -> Self {
        Self {
            spec,
            source: JobSource::Instrument {
                address: address.into(),
            },
            inter_step_delay: Duration::ZERO,
            timeout: Duration::from_secs(20 * 60),
        }
    }

    /// Replay of a literal sample list
    pub fn replay(samples: Vec<ReplaySample>) -> Self {
        Self {
            spec: SweepSpec::for_replay(&samples),
            source: JobSource::Replay { samples },
            inter_step_delay: Duration::ZERO,
            timeout: Duration::from_secs(20 * 60),
        }
    }

    /// Set the settle delay
    pub fn with_inter_step_delay(mut self, delay: Duration) -> Self {
        self.inter_step_delay = delay;
        self
    }

    /// Set the wall-clock timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Address reported in the job descriptor
    pub fn instrument_address(&self) -> &str {
        match &self.source {
            JobSource::Instrument { address } => address,
            JobSource::Replay { .. } => REPLAY_ADDRESS,
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum JobOutcome {
    /// Every point measured
    Completed,
    /// Startup or execution error
    Failed(SweepError),
    /// Cancelled or timed out; carries the reason
    Aborted(String),
}

impl JobOutcome {
    /// Status reported for this outcome
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Finished,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Aborted(_) => JobStatus::Aborted,
        }
    }

    fn phase(&self) -> JobPhase {
        match self {
            JobOutcome::Completed => JobPhase::Completed,
            JobOutcome::Failed(_) => JobPhase::Failed,
            JobOutcome::Aborted(_) => JobPhase::Aborted,
        }
    }

    fn terminal_reason(&self) -> TerminalReason {
        match self {
            JobOutcome::Completed => TerminalReason::Finished,
            JobOutcome::Failed(err) => TerminalReason::Failed(err.to_string()),
            JobOutcome::Aborted(reason) => TerminalReason::Aborted(reason.clone()),
        }
    }

    fn message(&self) -> Option<String> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Failed(err) => Some(err.to_string()),
            JobOutcome::Aborted(reason) => Some(reason.clone()),
        }
    }
}

/// Result of a finished job
#[derive(Debug)]
pub struct JobReport {
    /// Final descriptor
    pub descriptor: JobDescriptor,
    /// Samples in sweep order (partial on abort/failure)
    pub samples: Vec<MeasurementSample>,
    /// How the run ended
    pub outcome: JobOutcome,
}

/// Caller-side view of a job
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    status: watch::Receiver<JobDescriptor>,
    cancel: CancellationToken,
}

impl JobHandle {
    /// Job id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current descriptor (non-blocking)
    pub fn descriptor(&self) -> JobDescriptor {
        self.status.borrow().clone()
    }

    /// Ask the job to stop after the current sweep point
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Whether a stop has been requested
    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the job's status is terminal and return the final descriptor
    pub async fn wait(&self) -> JobDescriptor {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|descriptor| descriptor.status.is_terminal())
            .await
            .map(|descriptor| descriptor.clone());
        match result {
            Ok(descriptor) => descriptor,
            // Job dropped before finishing; report the last known state
            Err(_) => status.borrow().clone(),
        }
    }
}

type InstrumentSlot = Arc<Mutex<Option<Arc<dyn SourceMeasure>>>>;

/// Take the instrument out of `slot`, disable its output and close it.
///
/// Taking from the slot makes this a no-op the second time round.
async fn release_instrument(slot: &InstrumentSlot) {
    let instrument = slot.lock().take();
    if let Some(instrument) = instrument {
        if let Err(err) = instrument.shutdown().await {
            warn!(error = %err, "Failed to disable source output");
        }
        if let Err(err) = instrument.close().await {
            warn!(error = %err, "Failed to close instrument");
        }
    }
}

/// A single sweep run against one instrument session
pub struct MeasurementJob {
    id: u64,
    request: JobRequest,
    opener: Arc<dyn InstrumentOpener>,
    telemetry: TelemetryPublisher,
    cancel: CancellationToken,
    status: Arc<watch::Sender<JobDescriptor>>,
    phase: JobPhase,
    instrument: InstrumentSlot,
    setpoints: Vec<f64>,
    samples: Vec<MeasurementSample>,
}

/// Cleanup for a job whose worker died before finishing.
///
/// Shares the job's status and instrument, so the supervisor can still shut the
/// instrument down and publish a terminal status after a panic.
pub struct JobFailsafe {
    id: u64,
    status: Arc<watch::Sender<JobDescriptor>>,
    instrument: InstrumentSlot,
    telemetry: TelemetryPublisher,
}

impl JobFailsafe {
    /// Release the instrument, publish `Failed` and return what is left of the run.
    ///
    /// Samples collected by the dead worker are lost.
    pub async fn fail(self, reason: String) -> JobReport {
        release_instrument(&self.instrument).await;

        let already_terminal = self.status.borrow().status.is_terminal();
        if !already_terminal {
            self.telemetry
                .publish(TelemetryEvent::Terminal(TerminalReason::Failed(reason.clone())));
        }
        self.status.send_modify(|descriptor| {
            if descriptor.advance(JobStatus::Failed) {
                descriptor.message = Some(reason.clone());
            }
        });
        error!(job_id = self.id, %reason, "Job failed without finishing");

        JobReport {
            descriptor: self.status.borrow().clone(),
            samples: Vec::new(),
            outcome: JobOutcome::Failed(SweepError::Internal(reason)),
        }
    }
}

impl MeasurementJob {
    /// Create a job in the `Created` phase with status `Queued`.
    pub fn new(
        id: u64,
        request: JobRequest,
        opener: Arc<dyn InstrumentOpener>,
        telemetry: TelemetryPublisher,
    ) -> (Self, JobHandle) {
        let descriptor = JobDescriptor::new(
            id,
            request.spec.clone(),
            request.instrument_address().to_string(),
        );
        let (status_tx, status_rx) = watch::channel(descriptor);
        let status_tx = Arc::new(status_tx);
        let cancel = CancellationToken::new();

        let handle = JobHandle {
            id,
            status: status_rx,
            cancel: cancel.clone(),
        };
        let job = Self {
            id,
            request,
            opener,
            telemetry,
            cancel,
            status: status_tx,
            phase: JobPhase::Created,
            instrument: Arc::new(Mutex::new(None)),
            setpoints: Vec::new(),
            samples: Vec::new(),
        };
        (job, handle)
    }

    /// Job id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Failsafe sharing this job's status and instrument
    pub fn failsafe(&self) -> JobFailsafe {
        JobFailsafe {
            id: self.id,
            status: Arc::clone(&self.status),
            instrument: Arc::clone(&self.instrument),
            telemetry: self.telemetry.clone(),
        }
    }

    /// Move the visible status forward; regressions are ignored.
    pub fn advance_status(&self, next: JobStatus) {
        self.status.send_if_modified(|descriptor| descriptor.advance(next));
    }

    /// Drive the job through startup, execution and shutdown.
    ///
    /// Shutdown runs exactly once, whichever way the run ends, including on timeout.
    #[instrument(skip(self), fields(job_id = self.id, address = %self.request.instrument_address()))]
    pub async fn run(mut self) -> JobReport {
        self.advance_status(JobStatus::Running);
        let timeout = self.request.timeout;

        let outcome = match tokio::time::timeout(timeout, self.startup_and_execute()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let minutes = timeout.as_secs_f64() / 60.0;
                warn!(minutes, "Job timed out; shutting down");
                JobOutcome::Aborted(format!("timed out after {} min", minutes))
            }
        };

        self.shutdown(&outcome).await;
        self.finish(outcome)
    }

    async fn startup_and_execute(&mut self) -> JobOutcome {
        self.enter(JobPhase::Startup);
        if let Err(err) = self.startup().await {
            error!(error = %err, "Job startup failed");
            return JobOutcome::Failed(err);
        }

        self.enter(JobPhase::Running);
        self.execute().await
    }

    /// Open and configure the instrument, build the setpoints, enable the output.
    async fn startup(&mut self) -> AppResult<()> {
        let spec = self.request.spec.clone();
        spec.validate()?;

        info!("Setting up connection to SMU");
        let instrument: Arc<dyn SourceMeasure> = match &self.request.source {
            JobSource::Instrument { address } => self.opener.open(address).await?,
            JobSource::Replay { samples } => Arc::new(ReplaySmu::new(samples.clone())),
        };
        // Held from here on so shutdown can always reach it
        *self.instrument.lock() = Some(Arc::clone(&instrument));

        if spec.wiring == Wiring::FourWire && !instrument.supports_4_wire() {
            return Err(InstrumentError::Unsupported(
                "4-wire measurement requested but not supported by this instrument".to_string(),
            )
            .into());
        }

        info!(source = %spec.source_type, limit = spec.source_limit(), compliance = spec.compliance_limit, "Setting up parameters");
        match spec.source_type {
            SourceType::Voltage => {
                instrument
                    .configure_voltage_source(spec.source_limit(), spec.compliance_limit, spec.wiring)
                    .await?
            }
            SourceType::Current => {
                instrument
                    .configure_current_source(spec.source_limit(), spec.compliance_limit, spec.wiring)
                    .await?
            }
        }

        let ready_text = match &self.request.source {
            JobSource::Instrument { .. } => {
                self.setpoints = spec.setpoints();
                SETUP_COMPLETED
            }
            JobSource::Replay { samples } => {
                self.setpoints = samples.iter().map(ReplaySample::voltage).collect();
                TEST_RUN_STARTED
            }
        };

        instrument.enable_source().await?;
        self.telemetry
            .publish(TelemetryEvent::StatusText(ready_text.to_string()));
        info!(points = self.setpoints.len(), "Setup completed");
        Ok(())
    }

    /// Walk the setpoints, one sample per point, polling cancellation once per point.
    async fn execute(&mut self) -> JobOutcome {
        let Some(instrument) = self.instrument.lock().clone() else {
            return JobOutcome::Failed(SweepError::Configuration(
                "execute called without an instrument".to_string(),
            ));
        };
        let source_type = self.request.spec.source_type;
        let delay = self.request.inter_step_delay;
        let setpoints = self.setpoints.clone();
        let count = setpoints.len();

        info!(count, "Starting to measure");
        for (step, setpoint) in setpoints.into_iter().enumerate() {
            let measured = match measure_point(&*instrument, setpoint, delay).await {
                Ok(measured) => measured,
                Err(err) => {
                    error!(step, setpoint, error = %err, "Measurement failed");
                    return JobOutcome::Failed(err);
                }
            };

            let sample = MeasurementSample {
                step,
                setpoint,
                measured,
                source_type,
            };
            debug!(step, setpoint, measured, "Produced sample");
            self.samples.push(sample.clone());
            self.telemetry.publish(TelemetryEvent::Sample(sample));

            let progress = 100.0 * (step + 1) as f64 / count as f64;
            let collected = self.samples.len();
            self.status.send_modify(|descriptor| {
                descriptor.progress_percent = descriptor.progress_percent.max(progress);
                descriptor.sample_count = collected;
            });
            self.telemetry.publish(TelemetryEvent::Progress(progress));

            if self.cancel.is_cancelled() && step + 1 < count {
                warn!(step, "Caught stop command in procedure");
                return JobOutcome::Aborted("stop requested".to_string());
            }
        }

        JobOutcome::Completed
    }

    /// Disable the output, close the instrument, emit the terminal event.
    async fn shutdown(&mut self, outcome: &JobOutcome) {
        release_instrument(&self.instrument).await;

        self.telemetry
            .publish(TelemetryEvent::Terminal(outcome.terminal_reason()));
        info!(outcome = ?outcome.status(), samples = self.samples.len(), "Finished");
    }

    fn finish(mut self, outcome: JobOutcome) -> JobReport {
        self.enter(outcome.phase());
        let status = outcome.status();
        let message = outcome.message();
        let collected = self.samples.len();
        self.status.send_modify(|descriptor| {
            descriptor.sample_count = collected;
            descriptor.message = message;
            descriptor.advance(status);
        });

        let descriptor = self.status.borrow().clone();
        JobReport {
            descriptor,
            samples: self.samples,
            outcome,
        }
    }

    fn enter(&mut self, phase: JobPhase) {
        debug!(from = ?self.phase, to = ?phase, "Job phase transition");
        self.phase = phase;
    }
}

/// Write one setpoint, settle, read back the complementary quantity.
async fn measure_point(
    instrument: &dyn SourceMeasure,
    setpoint: f64,
    settle: Duration,
) -> AppResult<f64> {
    instrument.set_source_value(setpoint).await?;
    if !settle.is_zero() {
        sleep(settle).await;
    }
    Ok(instrument.measured_value().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockOpener;
    use crate::telemetry::TelemetryRelay;

    fn volt_spec(start: f64, end: f64, count: usize) -> SweepSpec {
        SweepSpec {
            source_type: SourceType::Voltage,
            start,
            end,
            iteration_count: count,
            both_ways: false,
            compliance_limit: 0.1,
            wiring: Wiring::TwoWire,
        }
    }

    #[test]
    fn status_ids_match_wire_format() {
        assert_eq!(JobStatus::Finished.id(), 0);
        assert_eq!(JobStatus::Failed.id(), 1);
        assert_eq!(JobStatus::Aborted.id(), 2);
        assert_eq!(JobStatus::Queued.id(), 3);
        assert_eq!(JobStatus::Running.id(), 4);
    }

    #[test]
    fn status_never_regresses() {
        let mut descriptor = JobDescriptor::new(1, volt_spec(0.0, 1.0, 2), "a".into());
        assert!(descriptor.advance(JobStatus::Running));
        assert!(!descriptor.advance(JobStatus::Queued));
        assert!(descriptor.advance(JobStatus::Finished));
        assert!(!descriptor.advance(JobStatus::Failed));
        assert_eq!(descriptor.status, JobStatus::Finished);
        assert!(descriptor.finished_at.is_some());
    }

    #[test]
    fn spec_validation() {
        tokio_test::assert_ok!(volt_spec(0.0, 1.0, 5).validate());
        tokio_test::assert_err!(volt_spec(0.0, 1.0, 0).validate());
        tokio_test::assert_err!(volt_spec(f64::NAN, 1.0, 5).validate());
        let mut spec = volt_spec(0.0, 1.0, 5);
        spec.compliance_limit = 0.0;
        assert!(spec.validate().unwrap_err().is_configuration());

        tokio_test::assert_ok!(volt_spec(0.0, 1.0, MAX_ITERATION_COUNT).validate());
        assert!(matches!(
            volt_spec(0.0, 1.0, 2_305_843_009_213_693_952).validate(),
            Err(SweepError::Validation(_))
        ));
    }

    #[test]
    fn source_limit_is_larger_magnitude() {
        assert_eq!(volt_spec(-5.0, 1.0, 2).source_limit(), 5.0);
        assert_eq!(volt_spec(0.0, 1.5, 2).source_limit(), 1.5);
    }

    #[test]
    fn replay_spec_covers_samples() {
        let spec = SweepSpec::for_replay(&[ReplaySample(0.0, 0.0), ReplaySample(2.0, -0.3)]);
        assert_eq!(spec.iteration_count, 2);
        assert_eq!((spec.start, spec.end), (0.0, 2.0));
        assert_eq!(spec.compliance_limit, 0.3);
    }

    #[test]
    fn sample_columns_follow_source_type() {
        let sample = MeasurementSample {
            step: 0,
            setpoint: 1e-3,
            measured: 1.0,
            source_type: SourceType::Current,
        };
        assert_eq!(sample.voltage(), 1.0);
        assert_eq!(sample.current(), 1e-3);
    }

    #[tokio::test]
    async fn completed_run_reaches_full_progress() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new());
        let (job, handle) = MeasurementJob::new(
            7,
            JobRequest::sweep("ASRL7::INSTR", volt_spec(0.0, 1.0, 5)),
            opener.clone(),
            relay.publisher(),
        );

        let report = job.run().await;
        assert!(matches!(report.outcome, JobOutcome::Completed));
        assert_eq!(report.samples.len(), 5);
        assert_eq!(report.descriptor.status, JobStatus::Finished);
        assert_eq!(report.descriptor.progress_percent, 100.0);
        assert_eq!(handle.descriptor().status, JobStatus::Finished);

        let probe = opener.last_probe().unwrap();
        assert_eq!(probe.setpoints(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(probe.shutdown_calls(), 1);
        assert_eq!(probe.close_calls(), 1);
        assert!(!probe.output_enabled());
    }

    #[tokio::test]
    async fn range_failure_skips_execution() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new());
        let (job, _handle) = MeasurementJob::new(
            1,
            JobRequest::sweep("ASRL7::INSTR", volt_spec(0.0, 25.0, 3)),
            opener.clone(),
            relay.publisher(),
        );

        let report = job.run().await;
        match &report.outcome {
            JobOutcome::Failed(err) => assert!(err.is_configuration()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.samples.is_empty());
        assert_eq!(report.descriptor.progress_percent, 0.0);

        let probe = opener.last_probe().unwrap();
        assert_eq!(probe.enable_calls(), 0);
        assert_eq!(probe.shutdown_calls(), 1);
        assert!(probe.setpoints().is_empty());
    }

    #[tokio::test]
    async fn unreachable_instrument_fails_without_shutdown_target() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new().with_unreachable("ASRL3::INSTR"));
        let (job, _handle) = MeasurementJob::new(
            2,
            JobRequest::sweep("ASRL3::INSTR", volt_spec(0.0, 1.0, 3)),
            opener.clone(),
            relay.publisher(),
        );

        let report = job.run().await;
        match &report.outcome {
            JobOutcome::Failed(err) => assert!(err.is_communication()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(opener.probes().is_empty());
        assert_eq!(report.descriptor.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn stop_before_run_aborts_after_first_point() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new());
        let (job, handle) = MeasurementJob::new(
            3,
            JobRequest::sweep("ASRL7::INSTR", volt_spec(0.0, 1.0, 10)),
            opener.clone(),
            relay.publisher(),
        );

        handle.request_stop();
        let report = job.run().await;
        assert!(matches!(report.outcome, JobOutcome::Aborted(_)));
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.descriptor.status, JobStatus::Aborted);
        assert!(report.descriptor.progress_percent < 100.0);
        assert_eq!(opener.last_probe().unwrap().shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn mid_sweep_read_failure_keeps_partial_samples() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new().with_measurement_failure_at(2));
        let (job, _handle) = MeasurementJob::new(
            4,
            JobRequest::sweep("ASRL7::INSTR", volt_spec(0.0, 1.0, 5)),
            opener.clone(),
            relay.publisher(),
        );

        let report = job.run().await;
        assert!(matches!(report.outcome, JobOutcome::Failed(_)));
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.descriptor.sample_count, 2);
        assert_eq!(opener.last_probe().unwrap().shutdown_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_and_still_shuts_down() {
        let relay = TelemetryRelay::spawn();
        let opener = Arc::new(MockOpener::new());
        let request = JobRequest::sweep("ASRL7::INSTR", volt_spec(0.0, 1.0, 100))
            .with_inter_step_delay(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(10));
        let (job, _handle) = MeasurementJob::new(5, request, opener.clone(), relay.publisher());

        let report = job.run().await;
        match &report.outcome {
            JobOutcome::Aborted(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.samples.len() < 100);
        let probe = opener.last_probe().unwrap();
        assert_eq!(probe.shutdown_calls(), 1);
        assert!(!probe.output_enabled());
    }

    #[tokio::test]
    async fn failsafe_releases_instrument_of_crashed_worker() {
        let relay = TelemetryRelay::spawn();
        let mut sub = relay.subscribe();
        let opener = Arc::new(MockOpener::new().with_panic_at(1));
        let (job, handle) = MeasurementJob::new(
            9,
            JobRequest::sweep("ASRL7::INSTR", volt_spec(0.0, 1.0, 5)),
            opener.clone(),
            relay.publisher(),
        );
        let failsafe = job.failsafe();

        let crashed = tokio::spawn(job.run()).await;
        assert!(crashed.unwrap_err().is_panic());
        let probe = opener.last_probe().unwrap();
        assert!(probe.output_enabled());
        assert_eq!(handle.descriptor().status, JobStatus::Running);

        let report = failsafe.fail("worker panicked".to_string()).await;
        assert!(matches!(report.outcome, JobOutcome::Failed(SweepError::Internal(_))));
        assert_eq!(report.descriptor.status, JobStatus::Failed);
        assert_eq!(handle.wait().await.message.as_deref(), Some("worker panicked"));
        assert_eq!(probe.shutdown_calls(), 1);
        assert_eq!(probe.close_calls(), 1);
        assert!(!probe.output_enabled());

        let mut last = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), sub.recv()).await
        {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(TelemetryEvent::Terminal(TerminalReason::Failed(
                "worker panicked".to_string()
            )))
        );
    }

    /// MockSmu without remote sensing support
    struct TwoWireOnly(crate::hardware::mock::MockSmu);

    #[async_trait::async_trait]
    impl SourceMeasure for TwoWireOnly {
        async fn configure_voltage_source(
            &self,
            limit: f64,
            compliance: f64,
            wiring: Wiring,
        ) -> Result<(), crate::error::InstrumentError> {
            self.0.configure_voltage_source(limit, compliance, wiring).await
        }
        async fn configure_current_source(
            &self,
            limit: f64,
            compliance: f64,
            wiring: Wiring,
        ) -> Result<(), crate::error::InstrumentError> {
            self.0.configure_current_source(limit, compliance, wiring).await
        }
        async fn source_value(&self) -> Result<f64, crate::error::InstrumentError> {
            self.0.source_value().await
        }
        async fn set_source_value(&self, value: f64) -> Result<(), crate::error::InstrumentError> {
            self.0.set_source_value(value).await
        }
        async fn measured_value(&self) -> Result<f64, crate::error::InstrumentError> {
            self.0.measured_value().await
        }
        async fn enable_source(&self) -> Result<(), crate::error::InstrumentError> {
            self.0.enable_source().await
        }
        async fn shutdown(&self) -> Result<(), crate::error::InstrumentError> {
            self.0.shutdown().await
        }
        async fn close(&self) -> Result<(), crate::error::InstrumentError> {
            self.0.close().await
        }
    }

    struct TwoWireOpener(Arc<crate::hardware::mock::MockProbe>);

    #[async_trait::async_trait]
    impl InstrumentOpener for TwoWireOpener {
        fn name(&self) -> &str {
            "two-wire"
        }

        async fn open(
            &self,
            _address: &str,
        ) -> Result<Arc<dyn SourceMeasure>, crate::error::InstrumentError> {
            let smu = crate::hardware::mock::MockSmu::with_probe(Arc::clone(&self.0));
            Ok(Arc::new(TwoWireOnly(smu)))
        }
    }

    #[tokio::test]
    async fn four_wire_on_two_wire_instrument_is_configuration_error() {
        let relay = TelemetryRelay::spawn();
        let probe = Arc::new(crate::hardware::mock::MockProbe::default());
        let mut spec = volt_spec(0.0, 1.0, 3);
        spec.wiring = Wiring::FourWire;
        let (job, _handle) = MeasurementJob::new(
            6,
            JobRequest::sweep("ASRL7::INSTR", spec),
            Arc::new(TwoWireOpener(Arc::clone(&probe))),
            relay.publisher(),
        );

        let report = job.run().await;
        match &report.outcome {
            JobOutcome::Failed(err) => assert!(err.is_configuration()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(probe.enable_calls(), 0);
        assert_eq!(probe.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn replay_runs_literal_voltages() {
        let relay = TelemetryRelay::spawn();
        let mut sub = relay.subscribe();
        let request = JobRequest::replay(vec![ReplaySample(0.0, 0.0), ReplaySample(1.0, 2e-3)]);
        let (job, _handle) = MeasurementJob::new(8, request, Arc::new(MockOpener::new()), relay.publisher());

        let report = job.run().await;
        assert!(matches!(report.outcome, JobOutcome::Completed));
        assert_eq!(report.descriptor.instrument_address, REPLAY_ADDRESS);
        assert_eq!(report.samples[1].current(), 2e-3);
        assert_eq!(
            sub.recv().await,
            Some(TelemetryEvent::StatusText(TEST_RUN_STARTED.to_string()))
        );
    }
}
