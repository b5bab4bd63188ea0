//! Command dispatcher.
//!
//! Inbound commands are JSON objects with camelCase keys. Two schemas are tried in
//! order:
//!
//! 1. **Test**: carries `testSamples: [[voltage, current], ...]` and replays them
//!    without hardware.
//! 2. **Real**: `command` is `start`, `stop` or `test` plus the sweep fields.
//!
//! Anything that fits neither is a `SweepError::Validation` and creates no job.
//!
//! ```json
//! {"command": "start", "instrumentAddress": "ASRL7::INSTR", "sourceMode": "volt",
//!  "sweepStart": 0, "sweepEnd": 1, "iterationCount": 5, "complianceLimit": 0.01}
//! ```

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::error::{AppResult, SweepError};
use crate::experiment::{JobRequest, JobSupervisor, SweepSpec};
use crate::hardware::replay::ReplaySample;
use crate::hardware::{SourceType, Wiring};

/// Command verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Start a hardware sweep
    Start,
    /// Stop the running job
    Stop,
    /// Replay literal samples
    Test,
}

/// Sourced quantity as named on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Source voltage, measure current
    Volt,
    /// Source current, measure voltage
    Curr,
}

impl From<SourceMode> for SourceType {
    fn from(mode: SourceMode) -> Self {
        match mode {
            SourceMode::Volt => SourceType::Voltage,
            SourceMode::Curr => SourceType::Current,
        }
    }
}

/// Instrument address: a VISA-style resource string or a bare serial port number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AddressField {
    /// Bare port number, e.g. `7`
    Port(u32),
    /// Resource string, e.g. `ASRL7::INSTR`
    Resource(String),
}

impl AddressField {
    /// Canonical resource string. Bare port numbers become `ASRL<n>::INSTR`.
    pub fn resource(&self) -> String {
        match self {
            AddressField::Port(port) => format!("ASRL{}::INSTR", port),
            AddressField::Resource(text) => {
                let text = text.trim();
                if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
                    format!("ASRL{}::INSTR", text)
                } else {
                    text.to_string()
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestCommand {
    #[serde(default)]
    command: Option<CommandKind>,
    test_samples: Vec<ReplaySample>,
    #[serde(default)]
    timeout_minutes: Option<u64>,
    #[serde(default)]
    inter_step_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealCommand {
    command: CommandKind,
    #[serde(default, alias = "port")]
    instrument_address: Option<AddressField>,
    #[serde(default)]
    timeout_minutes: Option<u64>,
    #[serde(default)]
    inter_step_delay_ms: Option<u64>,
    #[serde(default)]
    both_ways: bool,
    /// `true` selects 4-wire sensing
    #[serde(default)]
    wiring: bool,
    #[serde(default)]
    source_mode: Option<SourceMode>,
    #[serde(default)]
    compliance_limit: Option<f64>,
    #[serde(default)]
    sweep_start: Option<f64>,
    #[serde(default)]
    sweep_end: Option<f64>,
    #[serde(default)]
    iteration_count: Option<usize>,
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Admit a hardware sweep
    Start(JobRequest),
    /// Admit a replay job
    Test {
        /// Pairs to replay, in order
        samples: Vec<ReplaySample>,
        /// Explicit `timeoutMinutes`, if given
        timeout: Option<Duration>,
        /// Explicit `interStepDelayMs`, if given
        inter_step_delay: Option<Duration>,
    },
    /// Stop the running job
    Stop,
}

fn required<T>(value: Option<T>, field: &str) -> AppResult<T> {
    value.ok_or_else(|| SweepError::Validation(format!("missing field '{}'", field)))
}

fn timeout_override(timeout_minutes: Option<u64>) -> AppResult<Option<Duration>> {
    match timeout_minutes {
        Some(0) => Err(SweepError::Validation(
            "timeoutMinutes must be at least 1".to_string(),
        )),
        Some(minutes) => Ok(Some(Duration::from_secs(minutes.saturating_mul(60)))),
        None => Ok(None),
    }
}

fn test_request(defaults: &JobConfig, cmd: TestCommand) -> AppResult<Command> {
    defaults.check_iteration_count(cmd.test_samples.len())?;
    Ok(Command::Test {
        samples: cmd.test_samples,
        timeout: timeout_override(cmd.timeout_minutes)?,
        inter_step_delay: cmd.inter_step_delay_ms.map(Duration::from_millis),
    })
}

fn real_request(defaults: &JobConfig, cmd: RealCommand) -> AppResult<Command> {
    match cmd.command {
        CommandKind::Stop => Ok(Command::Stop),
        CommandKind::Test => Err(SweepError::Validation(
            "test command requires 'testSamples'".to_string(),
        )),
        CommandKind::Start => {
            let address = required(cmd.instrument_address, "instrumentAddress")?.resource();
            if address.is_empty() {
                return Err(SweepError::Validation(
                    "instrumentAddress must not be empty".to_string(),
                ));
            }
            let iteration_count = required(cmd.iteration_count, "iterationCount")?;
            if iteration_count == 0 {
                return Err(SweepError::Validation(
                    "iterationCount must be at least 1".to_string(),
                ));
            }
            defaults.check_iteration_count(iteration_count)?;
            let spec = SweepSpec {
                source_type: cmd.source_mode.unwrap_or(SourceMode::Volt).into(),
                start: required(cmd.sweep_start, "sweepStart")?,
                end: required(cmd.sweep_end, "sweepEnd")?,
                iteration_count,
                both_ways: cmd.both_ways,
                compliance_limit: required(cmd.compliance_limit, "complianceLimit")?,
                wiring: Wiring::from_four_wire(cmd.wiring),
            };
            let timeout = timeout_override(cmd.timeout_minutes)?
                .unwrap_or_else(|| defaults.default_timeout());
            let delay = cmd
                .inter_step_delay_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| defaults.default_inter_step_delay());
            Ok(Command::Start(
                JobRequest::sweep(address, spec)
                    .with_timeout(timeout)
                    .with_inter_step_delay(delay),
            ))
        }
    }
}

/// Parse and validate one inbound command.
///
/// Replay sample contents are checked on admission by [`JobSupervisor::start_test`].
///
/// # Errors
/// `SweepError::Validation` for malformed JSON, unknown commands, missing fields or
/// a sweep longer than `defaults.max_iteration_count`.
pub fn parse_command(text: &str, defaults: &JobConfig) -> AppResult<Command> {
    if let Ok(cmd) = serde_json::from_str::<TestCommand>(text) {
        if matches!(cmd.command, None | Some(CommandKind::Test)) {
            return test_request(defaults, cmd);
        }
    }

    let cmd: RealCommand = serde_json::from_str(text)
        .map_err(|e| SweepError::Validation(format!("malformed command: {}", e)))?;
    real_request(defaults, cmd)
}

/// What a dispatched command did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A job was admitted
    Started {
        /// Id of the admitted job
        job_id: u64,
    },
    /// Stop was forwarded; `None` when nothing was running
    StopRequested {
        /// Id of the job that was signalled
        job_id: Option<u64>,
    },
}

impl DispatchOutcome {
    /// Reply text for the sender
    pub fn reply(&self) -> String {
        match self {
            DispatchOutcome::Started { job_id } => format!("Process started (job {})", job_id),
            DispatchOutcome::StopRequested { job_id: Some(id) } => {
                format!("Stop requested (job {})", id)
            }
            DispatchOutcome::StopRequested { job_id: None } => "No process running".to_string(),
        }
    }
}

/// Routes validated commands to the supervisor. Never waits for a job to finish.
#[derive(Clone)]
pub struct CommandDispatcher {
    supervisor: Arc<JobSupervisor>,
}

impl CommandDispatcher {
    /// Dispatcher feeding `supervisor`
    pub fn new(supervisor: Arc<JobSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Supervisor behind this dispatcher
    pub fn supervisor(&self) -> &Arc<JobSupervisor> {
        &self.supervisor
    }

    /// Validate `text` and act on it.
    ///
    /// # Errors
    /// `Validation` for malformed input, `AlreadyRunning` when a job is active.
    pub fn dispatch(&self, text: &str) -> AppResult<DispatchOutcome> {
        debug!(%text, "Received command");
        let command = match parse_command(text, self.supervisor.defaults()) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "Rejected command");
                return Err(err);
            }
        };

        let handle = match command {
            Command::Start(request) => self.supervisor.start(request),
            Command::Test {
                samples,
                timeout,
                inter_step_delay,
            } => self.supervisor.start_test(samples, timeout, inter_step_delay),
            Command::Stop => {
                return Ok(DispatchOutcome::StopRequested {
                    job_id: self.supervisor.request_stop(),
                })
            }
        };
        match handle {
            Ok(handle) => {
                info!(job_id = handle.id(), "Process started");
                Ok(DispatchOutcome::Started {
                    job_id: handle.id(),
                })
            }
            Err(err) => {
                warn!(error = %err, "Start refused");
                Err(err)
            }
        }
    }
}
