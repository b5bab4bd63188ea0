//! CLI Entry Point for smu-sweep
//!
//! - `serve`: HTTP/WebSocket server accepting sweep commands
//! - `preview`: print the setpoints a sweep would apply, without hardware
//!
//! # Usage
//!
//! ```bash
//! smu-sweep serve --port 8000 --backend mock
//! smu-sweep preview --start 0 --end 1 --count 5 --both-ways
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use smu_sweep::config::{AppConfig, InstrumentBackend, DEFAULT_CONFIG_PATH};
use smu_sweep::experiment::{generate_sweep, JobSupervisor};
use smu_sweep::hardware::opener_for;
use smu_sweep::server::{self, AppState};
use smu_sweep::storage::CsvResultsWriter;
use smu_sweep::telemetry::TelemetryRelay;
use smu_sweep::tracing_init;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "smu-sweep")]
#[command(about = "Source-measure unit sweep runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Mock,
    Keithley2400,
}

impl From<BackendArg> for InstrumentBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Mock => InstrumentBackend::Mock,
            BackendArg::Keithley2400 => InstrumentBackend::Keithley2400,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP/WebSocket control surface
    Serve {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override server.port
        #[arg(long)]
        port: Option<u16>,

        /// Override instrument.backend
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },

    /// Print the setpoints of a sweep
    Preview {
        /// First setpoint
        #[arg(long, allow_hyphen_values = true)]
        start: f64,

        /// Turnaround / last setpoint
        #[arg(long, allow_hyphen_values = true)]
        end: f64,

        /// Number of points
        #[arg(long)]
        count: usize,

        /// Sweep back to start
        #[arg(long)]
        both_ways: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            backend,
        } => serve(config, port, backend).await,
        Commands::Preview {
            start,
            end,
            count,
            both_ways,
        } => {
            for setpoint in generate_sweep(start, end, count, both_ways) {
                println!("{}", setpoint);
            }
            Ok(())
        }
    }
}

async fn serve(path: PathBuf, port: Option<u16>, backend: Option<BackendArg>) -> Result<()> {
    let mut config = AppConfig::load_from(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(backend) = backend {
        config.instrument.backend = backend.into();
    }
    config.validate().map_err(|e| anyhow!(e))?;

    tracing_init::init_from_config(&config).map_err(|e| anyhow!(e))?;
    info!(name = %config.application.name, backend = ?config.instrument.backend, "Starting");

    let opener = opener_for(&config.instrument)?;
    let relay = Arc::new(TelemetryRelay::spawn());
    let mut supervisor =
        JobSupervisor::new(opener, relay.publisher()).with_defaults(config.job.clone());
    if config.storage.enabled {
        supervisor = supervisor.with_results(CsvResultsWriter::new(&config.storage.output_dir));
    }

    let state = AppState::new(Arc::new(supervisor), relay);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    server::serve(&addr, state, async {
        if let Err(e) = server::wait_for_shutdown_signal().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Server stopped");
    Ok(())
}
