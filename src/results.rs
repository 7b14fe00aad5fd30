//! Result output: the JSON document one benchmark run produces.
//!
//! An [`Output`] collects everything a later analysis needs to
//! reproduce and interpret the run: the workload shape, the machine it
//! ran on, every impairment measurement from the sweep, and the raw
//! sleep-calibration trials.

use crate::impairment::Measurement;
use crate::resources::MachineInfo;
use crate::timing::Timing;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// One paired sleep-calibration trial at a given work factor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepCalibration {
    /// Multiple of the time-slice-equivalent work used in both halves.
    pub work_factor: i64,
    /// Timing of the half that slept between repeats.
    pub run_and_sleep: Timing,
    /// Timing of the half that did not sleep.
    pub run_no_sleep: Timing,
    /// Repeat count both halves ran.
    pub repeats: i64,
}

/// Complete results of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub title: String,
    /// Registered name of the client under test.
    pub client: String,
    /// Name of the workload configuration.
    pub name: String,

    pub concurrent: usize,
    pub log_bytes: i64,
    pub log_num: i64,

    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub machine: MachineInfo,
    pub controller_version: String,

    /// Impairment sweep measurements, in the order they were taken.
    pub results: Vec<Measurement>,
    /// Raw sleep-calibration trials.
    pub sleeps: Vec<SleepCalibration>,
}

impl Output {
    pub fn new(title: &str, client: &str, name: &str) -> Self {
        Output {
            title: title.to_string(),
            client: client.to_string(),
            name: name.to_string(),
            concurrent: 1,
            log_bytes: 0,
            log_num: 0,
            timestamp: chrono::Utc::now(),
            machine: crate::resources::read_machine_info(),
            controller_version: crate::VERSION.to_string(),
            results: Vec::new(),
            sleeps: Vec::new(),
        }
    }
}

/// Writes the finished [`Output`] as pretty JSON.
pub struct ResultsWriter {
    output_file: PathBuf,
}

impl ResultsWriter {
    pub fn new(output_file: &Path) -> Self {
        ResultsWriter {
            output_file: output_file.to_path_buf(),
        }
    }

    pub fn write(&self, output: &Output) -> Result<()> {
        let json = serde_json::to_string_pretty(output)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("writing results to {:?}", self.output_file))?;
        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn output_serializes_camel_case() {
        let mut output = Output::new("experiment", "golang", "default");
        output.sleeps.push(SleepCalibration {
            work_factor: 3,
            run_and_sleep: Timing {
                wall: 1.0,
                user: 0.4,
                sys: 0.1,
            },
            run_no_sleep: Timing {
                wall: 0.5,
                user: 0.4,
                sys: 0.1,
            },
            repeats: 100,
        });
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"workFactor\":3"), "{}", json);
        assert!(json.contains("\"runAndSleep\""), "{}", json);
        assert!(json.contains("\"logBytes\":0"), "{}", json);
    }

    #[test]
    fn writer_round_trips_through_file() {
        let file = NamedTempFile::new().unwrap();
        let output = Output::new("experiment", "cpp", "default");
        ResultsWriter::new(file.path()).write(&output).unwrap();

        let data = std::fs::read_to_string(file.path()).unwrap();
        let back: Output = serde_json::from_str(&data).unwrap();
        assert_eq!(back.client, "cpp");
        assert_eq!(back.title, "experiment");
        assert!(back.results.is_empty());
    }
}
