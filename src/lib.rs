//! # Tracer Benchmark Controller Library
//!
//! Measures the CPU overhead a tracing client library imposes on an
//! instrumented application. A small client program links the tracer
//! under test and obeys instructions from this controller over a
//! synchronous HTTP protocol; the controller meters the client's CPU
//! consumption from the outside and reports spans into a fake
//! collector so nothing leaves the machine.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `controller`: HTTP control/result server and client process lifecycle
//! - `calibration`: Work-unit and span cost estimation with sanity checks
//! - `impairment`: The (rate, load) sweep that produces the actual numbers
//! - `collector`: Fake span-ingestion endpoints (framed binary, JSON, gRPC)
//! - `resources`: OS CPU accounting and the trial interference policy
//! - `protocol`: Control/result wire types shared with the clients
//! - `results`: JSON output document and writer
//!
//! ## Measurement Model
//!
//! The client's busy-loop "work" unit is calibrated to CPU seconds, a
//! sanity check confirms the estimate predicts a whole time slice, and
//! each impairment trial then splits the client's time into known
//! work, known sleep, and an unexplained remainder attributed to the
//! tracer. Trials whose window shows hypervisor steal or unattributed
//! CPU activity are rejected and rerun rather than averaged in.

pub mod calibration;
pub mod cli;
pub mod collector;
pub mod controller;
pub mod error;
pub mod impairment;
pub mod logging;
pub mod protocol;
pub mod resources;
pub mod results;
pub mod timing;

pub use calibration::Calibrator;
pub use cli::{Args, ClientRegistry, Config, Params};
pub use collector::{CollectorStats, FakeCollector};
pub use controller::{ClientRunner, ClientSpec, ControllerOptions, HttpController};
pub use error::BenchError;
pub use impairment::{DataPoint, ImpairmentMeter, Measurement};
pub use protocol::{Control, TrialResult};
pub use results::{Output, ResultsWriter};
pub use timing::Timing;

/// The current version of the benchmark controller, populated from
/// Cargo.toml and recorded in result output for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
