//! Sweep orchestration
//!
//! - **Sweep generation**: deterministic setpoint sequences (`sweep`)
//! - **Measurement job**: state machine driving one instrument session (`job`)
//! - **Supervisor**: single-job admission, stop requests and status (`supervisor`)
//!
//! # Example
//!
//! ```rust,ignore
//! use smu_sweep::experiment::{JobRequest, JobSupervisor, SweepSpec};
//!
//! let supervisor = JobSupervisor::new(opener, relay.publisher());
//! let handle = supervisor.start(JobRequest::sweep("ASRL7::INSTR", spec))?;
//!
//! // Stops after the point currently being measured
//! supervisor.request_stop();
//! let descriptor = handle.wait().await;
//! ```

pub mod job;
pub mod supervisor;
pub mod sweep;

pub use job::{
    JobDescriptor, JobFailsafe, JobHandle, JobOutcome, JobReport, JobRequest, JobSource,
    JobStatus, MeasurementJob, MeasurementSample, SweepSpec, MAX_ITERATION_COUNT,
};
pub use supervisor::JobSupervisor;
pub use sweep::{generate_sweep, linspace};
