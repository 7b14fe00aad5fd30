use crate::controller::ClientSpec;
use crate::error::{BenchError, Result};
use crate::protocol::{
    parse_duration, DEFAULT_COLLECTOR_GRPC_PORT, DEFAULT_COLLECTOR_HTTP_PORT,
    DEFAULT_CONTROLLER_PORT,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tracer Benchmark Controller - measures the CPU cost a tracing client
/// library imposes on an instrumented application
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Name of the registered client under test (e.g. golang, cpp)
    #[clap(short = 'c', long)]
    pub client: String,

    /// Workload configuration file (JSON)
    #[clap(long)]
    pub config_file: PathBuf,

    /// Measurement parameters file (JSON); defaults apply when omitted
    #[clap(long)]
    pub params_file: Option<PathBuf>,

    /// Client registry file (JSON) overriding the built-in registry
    #[clap(long)]
    pub registry_file: Option<PathBuf>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, default_value = "benchmark_results.json")]
    pub output_file: PathBuf,

    /// Port for the control/result protocol
    #[clap(long, default_value_t = DEFAULT_CONTROLLER_PORT)]
    pub controller_port: u16,

    /// Port for the fake collector's HTTP report endpoints
    #[clap(long, default_value_t = DEFAULT_COLLECTOR_HTTP_PORT)]
    pub collector_http_port: u16,

    /// Port for the fake collector's gRPC report service
    #[clap(long, default_value_t = DEFAULT_COLLECTOR_GRPC_PORT)]
    pub collector_grpc_port: u16,

    /// Bounded wait for each client result (e.g. "120s"); unbounded when omitted
    #[clap(long, value_parser = parse_timeout)]
    pub result_timeout: Option<Duration>,

    /// Experiment title recorded in the output
    #[clap(long, default_value = "tracer-benchmark")]
    pub title: String,

    /// Configuration name recorded in the output
    #[clap(long, default_value = "default")]
    pub name: String,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    parse_duration(s)
}

/// Workload shape for one benchmark run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Worker routines/threads the client runs per trial.
    pub concurrency: usize,
    /// Log statements attached to each span.
    pub log_num: i64,
    /// Bytes per log statement.
    pub log_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 1,
            log_num: 0,
            log_size: 0,
        }
    }
}

/// Measurement methodology parameters. Every field has a default so a
/// params file only needs to name what it overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Params {
    /// Trials averaged per calibration estimate.
    pub calibrate_rounds: usize,
    /// Wall-time length of each impairment measurement.
    #[serde(with = "crate::protocol::duration_string")]
    pub experiment_duration: Duration,
    /// Repetitions of each (rate, load) cell in the sweep.
    pub experiment_rounds: usize,

    pub minimum_rate: f64,
    pub maximum_rate: f64,
    pub rate_increments: usize,
    pub minimum_load: f64,
    pub maximum_load: f64,
    pub load_increments: usize,

    /// Calibrations to complete before measuring begins.
    pub minimum_calibrations: usize,
    /// Calibration attempt cap before the run is abandoned.
    pub maximum_calibrations: usize,
    /// An untraced impairment below this triggers recalibration.
    pub negative_recalibration_threshold: f64,
    /// CPU-time length of each calibration trial.
    #[serde(with = "crate::protocol::duration_string")]
    pub test_time_slice: Duration,
    /// Relative error tolerated by the work-cost sanity check.
    pub test_tolerance: f64,

    pub sleep_trial_count: usize,
    pub sleep_repeats: i64,
    pub sleep_min_work_factor: i64,
    pub sleep_max_work_factor: i64,
    pub sleep_work_factor_incr: i64,

    /// Foreign user CPU share above which a trial is rejected.
    pub user_interference_threshold: f64,
    /// Controller sys CPU share above which a trial is rejected.
    pub sys_interference_threshold: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            calibrate_rounds: 10,
            experiment_duration: Duration::from_secs(10),
            experiment_rounds: 2,

            minimum_rate: 100.0,
            maximum_rate: 1000.0,
            rate_increments: 3,
            minimum_load: 0.5,
            maximum_load: 1.0,
            load_increments: 2,

            minimum_calibrations: 1,
            maximum_calibrations: 10,
            negative_recalibration_threshold: -0.01,
            test_time_slice: Duration::from_millis(50),
            test_tolerance: 0.02,

            sleep_trial_count: 10,
            sleep_repeats: 100,
            sleep_min_work_factor: 1,
            sleep_max_work_factor: 10,
            sleep_work_factor_incr: 3,

            user_interference_threshold: 0.01,
            sys_interference_threshold: 0.02,
        }
    }
}

/// Per-instance map of client names to launch commands. Tests register
/// scripted clients here instead of touching any global state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientRegistry {
    pub clients: HashMap<String, ClientSpec>,
}

impl ClientRegistry {
    /// Registry of the known per-language benchmark clients.
    pub fn builtin() -> Self {
        let mut registry = ClientRegistry::default();
        registry.register("cpp", &["./cppclient"]);
        registry.register("ruby", &["ruby", "./rbclient.rb"]);
        registry.register("python", &["./pyclient.py"]);
        registry.register("golang", &["./goclient"]);
        registry.register(
            "nodejs",
            &["node", "--expose-gc", "--always_opt", "./jsclient.js"],
        );
        registry.register("java", &["java", "com.tracerbench.BenchmarkClient"]);
        registry
    }

    pub fn register(&mut self, name: &str, args: &[&str]) {
        self.clients.insert(
            name.to_string(),
            ClientSpec {
                args: args.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Result<&ClientSpec> {
        self.clients.get(name).ok_or_else(|| {
            let mut known: Vec<_> = self.clients.keys().cloned().collect();
            known.sort();
            BenchError::MalformedInput(format!(
                "unknown client {:?}; registered clients: {}",
                name,
                known.join(", ")
            ))
        })
    }
}

/// Read and decode one JSON configuration object.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        BenchError::MalformedInput(format!("could not read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        BenchError::MalformedInput(format!("could not parse {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn params_defaults_match_measurement_policy() {
        let p = Params::default();
        assert!((p.user_interference_threshold - 0.01).abs() < 1e-12);
        assert!((p.sys_interference_threshold - 0.02).abs() < 1e-12);
        assert_eq!(p.test_time_slice, Duration::from_millis(50));
        assert!(p.minimum_calibrations <= p.maximum_calibrations);
    }

    #[test]
    fn params_json_overrides_subset() {
        let raw = r#"{"calibrateRounds": 50, "testTimeSlice": "100ms"}"#;
        let p: Params = serde_json::from_str(raw).unwrap();
        assert_eq!(p.calibrate_rounds, 50);
        assert_eq!(p.test_time_slice, Duration::from_millis(100));
        // Unnamed fields keep their defaults.
        assert_eq!(p.maximum_calibrations, 10);
    }

    #[test]
    fn registry_lookup() {
        let registry = ClientRegistry::builtin();
        assert!(registry.lookup("golang").is_ok());
        let err = registry.lookup("cobol").unwrap_err();
        assert!(matches!(err, BenchError::MalformedInput(_)));
    }

    #[test]
    fn load_json_reports_malformed_input() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            load_json::<Config>(file.path()),
            Err(BenchError::MalformedInput(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"concurrency\": 4}}").unwrap();
        let config: Config = load_json(file.path()).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.log_num, 0);
    }
}
