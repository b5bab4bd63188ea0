//! # SMU Sweep Library
//!
//! Runs current/voltage sweeps on a source-measure unit, one job at a time, and streams
//! the measured points to every connected observer.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `SourceMeasure` capability, range selection, and the mock,
//!   replay and Keithley 2400 backends.
//! - **`experiment`**: sweep generation, the measurement job state machine and the
//!   single-job supervisor.
//! - **`telemetry`**: lossless FIFO relay from the job worker to all subscribers.
//! - **`dispatcher`**: validation and routing of inbound `start` / `stop` / `test`
//!   commands.
//! - **`server`**: axum HTTP + WebSocket surface.
//! - **`storage`**: per-job CSV results files (feature `storage_csv`).
//! - **`config`**: figment-based `AppConfig` (TOML file + `SMU_SWEEP_` environment).
//! - **`tracing_init`**: tracing subscriber setup.
//! - **`error`**: `InstrumentError` and `SweepError`.
//!
//! ## Control flow
//!
//! ```text
//! command ─▶ CommandDispatcher ─▶ JobSupervisor ─▶ MeasurementJob (own task)
//!                                                      │  SourceMeasure calls
//!                                                      ▼
//!                                              TelemetryRelay ─▶ subscribers
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod tracing_init;

pub use error::{AppResult, InstrumentError, SweepError};
