//! Per-job results files.
//!
//! Each finished job (including failed and aborted ones) is written to
//! `<output_dir>/job_<id>_<YYYYmmdd_HHMMSS>.csv`, a plain CSV whose first row is the
//! header `Step,Voltage,Current`. The final job descriptor (status, address, sweep,
//! failure message) goes to a `.json` sidecar with the same stem.
use crate::error::{AppResult, SweepError};
use crate::experiment::job::JobReport;
use std::path::{Path, PathBuf};

/// Writes job results as CSV.
#[cfg(feature = "storage_csv")]
#[derive(Debug, Clone)]
pub struct CsvResultsWriter {
    output_dir: PathBuf,
}

#[cfg(feature = "storage_csv")]
impl CsvResultsWriter {
    /// Writer placing files under `output_dir` (created on first write)
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Target directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write `report` to a fresh CSV file plus metadata sidecar; returns the CSV path.
    ///
    /// # Errors
    /// `SweepError::Io` if the directory or files cannot be created, `Storage` if
    /// encoding fails.
    pub fn write_report(&self, report: &JobReport) -> AppResult<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let descriptor = &report.descriptor;
        let stem = format!(
            "job_{}_{}",
            descriptor.id,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.output_dir.join(format!("{}.csv", stem));

        let mut writer = csv::Writer::from_writer(std::fs::File::create(&path)?);
        writer
            .write_record(["Step", "Voltage", "Current"])
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        for sample in &report.samples {
            writer
                .write_record(&[
                    sample.step.to_string(),
                    sample.voltage().to_string(),
                    sample.current().to_string(),
                ])
                .map_err(|e| SweepError::Storage(e.to_string()))?;
        }
        writer.flush()?;

        let metadata = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| SweepError::Storage(format!("Failed to encode job metadata: {}", e)))?;
        std::fs::write(self.output_dir.join(format!("{}.json", stem)), metadata)?;

        tracing::info!(path = %path.display(), samples = report.samples.len(), "Wrote job results");
        Ok(path)
    }
}

/// Placeholder when built without `storage_csv`; every write fails.
#[cfg(not(feature = "storage_csv"))]
#[derive(Debug, Clone)]
pub struct CsvResultsWriter;

#[cfg(not(feature = "storage_csv"))]
impl CsvResultsWriter {
    #[allow(missing_docs)]
    pub fn new(_output_dir: impl Into<PathBuf>) -> Self {
        Self
    }

    #[allow(missing_docs)]
    pub fn output_dir(&self) -> &Path {
        Path::new("")
    }

    #[allow(missing_docs)]
    pub fn write_report(&self, _report: &JobReport) -> AppResult<PathBuf> {
        Err(SweepError::FeatureNotEnabled("storage_csv".to_string()))
    }
}
