//! Error taxonomy for the benchmark controller.
//!
//! Fatal conditions (protocol desynchronization, process failures,
//! calibration divergence, malformed input) are represented here.
//! Interference-invalidated trials are deliberately *not* errors; they
//! are the `Rejected` variant of [`crate::controller::TrialOutcome`] and
//! are retried by the controller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    /// A control or result request arrived while the protocol was in
    /// the opposite phase. This indicates the controller and client
    /// have desynchronized and the run cannot be trusted.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The client process could not be spawned.
    #[error("could not start client {command:?}: {source}")]
    ProcessSpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The client process exited abnormally.
    #[error("client exited abnormally: {0}")]
    ProcessExitFailure(String),

    /// The sanity check failed repeatedly or the calibration attempt
    /// cap was exceeded; the host/client pair cannot be benchmarked.
    #[error("calibration diverged after {attempts} attempts")]
    CalibrationDivergence { attempts: usize },

    /// A duration string, JSON document, or result query parameter
    /// failed to parse. Treated as a contract violation.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The bounded wait for a client result elapsed.
    #[error("timed out after {seconds}s awaiting a client result")]
    ResultTimeout { seconds: f64 },

    /// The controller's internal channels closed unexpectedly, which
    /// means the control server shut down mid-run.
    #[error("control server is no longer running")]
    ServerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BenchError> = std::result::Result<T, E>;
