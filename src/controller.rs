//! Client process ownership and the control/result HTTP protocol.
//!
//! The controller owns one external client process and a two-phase
//! protocol: it serves the next `Control` to `GET /control` (taking a
//! "before" usage snapshot at the phase transition), then waits for the
//! matching `POST /result`, where it takes the "after" snapshot,
//! applies the interference policy, and hands the outcome back to the
//! waiting driver. The phase state lives behind a mutex; together with
//! the single-slot trial channel this preserves the invariant that at
//! most one control/result pair is ever outstanding.
//!
//! A request arriving in the wrong phase is a protocol violation. That
//! means the controller and client have desynchronized, so it is
//! surfaced as a fatal error rather than retried.

use crate::error::{BenchError, Result};
use crate::protocol::{
    Control, TrialResult, CONTROL_PATH, DEFAULT_SLEEP_INTERVAL, RESULT_PATH,
};
use crate::resources::{self, InterferenceParams, Rejection, UsageJudgment, UsageSnapshot};
use crate::timing::Timing;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Command line of one registered client under test.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientSpec {
    pub args: Vec<String>,
}

/// Outcome of a single trial window: either a usable result or an
/// invalidated measurement the caller should retry.
#[derive(Debug, Clone)]
pub enum TrialOutcome {
    Accepted(TrialResult),
    Rejected(Rejection),
}

/// The seam between the measurement engines and the transport. The
/// calibration and impairment code only needs "run one trial to an
/// accepted result", which also makes them testable against synthetic
/// clients.
#[async_trait]
pub trait ClientRunner: Send + Sync {
    async fn run(&self, control: Control) -> Result<TrialResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingControl,
    AwaitingResult,
}

type TrialReply = Result<TrialOutcome>;
type TrialRequest = (Control, oneshot::Sender<TrialReply>);

/// State for the control/result pair currently in flight.
struct Pending {
    reply: oneshot::Sender<TrialReply>,
    before: UsageSnapshot,
}

struct Inner {
    phase: Phase,
    pending: Option<Pending>,
    child_pid: Option<u32>,
    fatal: Option<String>,
}

struct Shared {
    inner: parking_lot::Mutex<Inner>,
    control_rx: tokio::sync::Mutex<mpsc::Receiver<TrialRequest>>,
    interference: InterferenceParams,
}

/// Options controlling a single controller instance.
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    pub interference: InterferenceParams,
    /// Bounded wait for a client result. `None` reproduces the
    /// original unbounded behavior; a hung client then wedges the run.
    pub result_timeout: Option<Duration>,
}

/// Owns the client subprocess and the control/result protocol.
pub struct HttpController {
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<TrialRequest>,
    result_timeout: Option<Duration>,
    interferences: AtomicUsize,
    exit_rx: parking_lot::Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl HttpController {
    pub fn new(options: ControllerOptions) -> Self {
        let (control_tx, control_rx) = mpsc::channel(1);
        HttpController {
            shared: Arc::new(Shared {
                inner: parking_lot::Mutex::new(Inner {
                    phase: Phase::AwaitingControl,
                    pending: None,
                    child_pid: None,
                    fatal: None,
                }),
                control_rx: tokio::sync::Mutex::new(control_rx),
                interference: options.interference,
            }),
            control_tx,
            result_timeout: options.result_timeout,
            interferences: AtomicUsize::new(0),
            exit_rx: parking_lot::Mutex::new(None),
        }
    }

    /// Bind the control server and serve it on a background task.
    /// Returns the bound address so tests can use an ephemeral port.
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let app = Router::new()
            .route(CONTROL_PATH, get(serve_control))
            .route(RESULT_PATH, post(serve_result))
            .fallback(serve_default)
            .with_state(self.shared.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("control server terminated: {}", e);
            }
        });
        info!("control server listening on {}", local);
        Ok(local)
    }

    /// Spawn the client process with inherited stdio and watch its
    /// exit on a background task.
    pub async fn start_client(&self, spec: &ClientSpec) -> Result<()> {
        let (program, args) = spec
            .args
            .split_first()
            .ok_or_else(|| BenchError::MalformedInput("empty client command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| BenchError::ProcessSpawnFailure {
                command: spec.args.join(" "),
                source,
            })?;

        let pid = child.id();
        self.shared.inner.lock().child_pid = pid;
        info!("started client {:?} (pid {:?})", spec.args, pid);

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(BenchError::ProcessExitFailure(format!(
                    "client exited with {}",
                    status
                ))),
                Err(e) => Err(BenchError::ProcessExitFailure(format!(
                    "could not await client: {}",
                    e
                ))),
            };
            if let Err(ref e) = status {
                error!("{}", e);
            } else {
                debug!("client exited cleanly");
            }
            let _ = exit_tx.send(status);
        });
        *self.exit_rx.lock() = Some(exit_rx);
        Ok(())
    }

    /// Send the terminal exit control and wait for the process to go
    /// away. This is a normal protocol message, not preemptive
    /// cancellation; the client fetches it on its next control poll.
    pub async fn stop_client(&self) -> Result<()> {
        let (reply_tx, _reply_rx) = oneshot::channel();
        self.control_tx
            .send((Control::exit(), reply_tx))
            .await
            .map_err(|_| BenchError::ServerClosed)?;

        let exit_rx = self.exit_rx.lock().take();
        if let Some(rx) = exit_rx {
            rx.await.map_err(|_| BenchError::ServerClosed)??;
        }

        let mut inner = self.shared.inner.lock();
        inner.phase = Phase::AwaitingControl;
        inner.pending = None;
        inner.child_pid = None;
        Ok(())
    }

    /// Issue one Control and block for an accepted result. Rejected
    /// (interference-invalidated) windows are retried with the same
    /// Control; the rendezvous guarantees at most one in-flight trial.
    pub async fn run_trial(&self, mut control: Control) -> Result<TrialResult> {
        if control.sleep_interval.is_zero() {
            control.sleep_interval = DEFAULT_SLEEP_INTERVAL;
        }
        control
            .validate()
            .map_err(BenchError::MalformedInput)?;

        loop {
            if let Some(msg) = self.shared.inner.lock().fatal.clone() {
                return Err(BenchError::ProtocolViolation(msg));
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            self.control_tx
                .send((control.clone(), reply_tx))
                .await
                .map_err(|_| BenchError::ServerClosed)?;

            let reply = match self.result_timeout {
                Some(t) => tokio::time::timeout(t, reply_rx)
                    .await
                    .map_err(|_| BenchError::ResultTimeout {
                        seconds: t.as_secs_f64(),
                    })?,
                None => reply_rx.await,
            }
            .map_err(|_| BenchError::ServerClosed)?;

            match reply? {
                TrialOutcome::Accepted(result) => return Ok(result),
                TrialOutcome::Rejected(reason) => {
                    self.interferences.fetch_add(1, Ordering::Relaxed);
                    debug!("measurement invalidated ({}), retrying trial", reason);
                }
            }
        }
    }

    /// How many trial windows interference has invalidated so far.
    pub fn interferences(&self) -> usize {
        self.interferences.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }
}

#[async_trait]
impl ClientRunner for HttpController {
    async fn run(&self, control: Control) -> Result<TrialResult> {
        self.run_trial(control).await
    }
}

/// `GET /control`: hand the next Control to the client. The "before"
/// usage snapshot is taken here, at the phase transition, so the
/// measured window brackets only the client's trial execution.
async fn serve_control(State(shared): State<Arc<Shared>>) -> Response {
    let before = {
        let mut inner = shared.inner.lock();
        if inner.phase != Phase::AwaitingControl {
            return protocol_violation(&mut inner, "out-of-phase control request");
        }
        let before = resources::snapshot_usage(inner.child_pid);
        inner.phase = Phase::AwaitingResult;
        before
    };

    let request = shared.control_rx.lock().await.recv().await;
    let Some((control, reply)) = request else {
        return (StatusCode::SERVICE_UNAVAILABLE, "controller shut down").into_response();
    };

    {
        let mut inner = shared.inner.lock();
        if control.exit {
            // No result follows an exit control.
            inner.phase = Phase::AwaitingControl;
            drop(reply);
        } else {
            inner.pending = Some(Pending { reply, before });
        }
    }

    Json(control).into_response()
}

/// `POST /result?timing=..&flush=..&s=..`: close the trial window,
/// judge interference, and wake the waiting driver.
async fn serve_result(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (pending, after) = {
        let mut inner = shared.inner.lock();
        if inner.phase != Phase::AwaitingResult || inner.pending.is_none() {
            return protocol_violation(&mut inner, "out-of-phase client result");
        }
        let after = resources::snapshot_usage(inner.child_pid);
        let pending = inner.pending.take().expect("pending checked above");
        inner.phase = Phase::AwaitingControl;
        (pending, after)
    };

    let outcome = parse_result_query(&params).map(|(wall, flush, sleeps)| {
        match resources::judge_usage(&pending.before, &after, &shared.interference) {
            UsageJudgment::Rejected(reason) => TrialOutcome::Rejected(reason),
            UsageJudgment::Accepted(usage) => TrialOutcome::Accepted(TrialResult {
                measured: Timing {
                    wall,
                    user: usage.child.user,
                    sys: usage.child.sys,
                },
                flush: Timing::wall_timing(flush),
                sleeps,
            }),
        }
    });

    let malformed = outcome.is_err();
    let _ = pending.reply.send(outcome);
    if malformed {
        return (StatusCode::BAD_REQUEST, "bad result parameters").into_response();
    }
    // The response body is unused, but some HTTP clients are troubled
    // by 0-byte responses.
    "OK".into_response()
}

async fn serve_default(uri: axum::http::Uri) -> Response {
    warn!("unexpected HTTP request: {}", uri);
    (StatusCode::NOT_FOUND, "unexpected request").into_response()
}

fn protocol_violation(inner: &mut Inner, msg: &str) -> Response {
    error!("{}", msg);
    inner.fatal = Some(msg.to_string());
    // Unblock a driver that is awaiting a result for the broken trial.
    if let Some(p) = inner.pending.take() {
        let _ = p
            .reply
            .send(Err(BenchError::ProtocolViolation(msg.to_string())));
    }
    (StatusCode::CONFLICT, msg.to_string()).into_response()
}

fn parse_result_query(
    params: &HashMap<String, String>,
) -> Result<(f64, f64, f64)> {
    let field = |name: &str| -> Result<f64> {
        match params.get(name) {
            None => Ok(0.0),
            Some(raw) => raw.parse().map_err(|_| {
                BenchError::MalformedInput(format!("bad result parameter {}={}", name, raw))
            }),
        }
    };
    let wall = field("timing")?;
    let flush = field("flush")?;
    let sleeps = field("s")?;
    Ok((wall, flush, sleeps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn test_controller() -> HttpController {
        HttpController::new(ControllerOptions {
            interference: InterferenceParams {
                min_time_slice: 0.05,
                user_threshold: 0.01,
                sys_threshold: 0.02,
                ticks_per_sec: 100.0,
            },
            result_timeout: Some(Duration::from_secs(5)),
        })
    }

    fn result_params(timing: f64, sleeps: f64) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("timing".to_string(), timing.to_string());
        m.insert("flush".to_string(), "0".to_string());
        m.insert("s".to_string(), sleeps.to_string());
        m
    }

    #[tokio::test]
    async fn out_of_phase_result_is_a_violation() {
        let controller = test_controller();
        let shared = controller.shared();

        let resp = serve_result(State(shared.clone()), Query(result_params(1.0, 0.0))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // The violation is fatal: the next trial refuses to run.
        let err = controller
            .run_trial(Control {
                concurrent: 1,
                work: 1,
                repeat: 1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn double_control_fetch_is_a_violation() {
        let controller = test_controller();
        let shared = controller.shared();

        let driver = {
            let shared = shared.clone();
            tokio::spawn(async move {
                // First fetch succeeds once the driver sends a control;
                // the second fetch arrives out of phase.
                let resp = serve_control(State(shared.clone())).await;
                assert_eq!(resp.status(), StatusCode::OK);
                let resp = serve_control(State(shared)).await;
                assert_eq!(resp.status(), StatusCode::CONFLICT);
            })
        };

        let err = controller
            .run_trial(Control {
                concurrent: 1,
                work: 10,
                repeat: 1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::ProtocolViolation(_)));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn alternating_sequence_round_trips() {
        let controller = Arc::new(test_controller());
        let shared = controller.shared();

        let client = tokio::spawn(async move {
            for _ in 0..3 {
                let resp = serve_control(State(shared.clone())).await;
                assert_eq!(resp.status(), StatusCode::OK);
                let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
                let control: Control = serde_json::from_slice(&body).unwrap();
                assert_eq!(control.work, 42);

                let resp =
                    serve_result(State(shared.clone()), Query(result_params(0.5, 0.01))).await;
                assert_eq!(resp.status(), StatusCode::OK);
            }
        });

        for _ in 0..3 {
            let result = controller
                .run_trial(Control {
                    concurrent: 1,
                    work: 42,
                    repeat: 1,
                    ..Default::default()
                })
                .await
                .unwrap();
            assert!((result.measured.wall - 0.5).abs() < 1e-12);
            assert!((result.sleeps - 0.01).abs() < 1e-12);
        }
        client.await.unwrap();
        assert_eq!(controller.interferences(), 0);
    }

    #[tokio::test]
    async fn malformed_result_parameters_are_fatal() {
        let controller = Arc::new(test_controller());
        let shared = controller.shared();

        let client = tokio::spawn(async move {
            let resp = serve_control(State(shared.clone())).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let mut params = HashMap::new();
            params.insert("timing".to_string(), "not-a-number".to_string());
            let resp = serve_result(State(shared), Query(params)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        });

        let err = controller
            .run_trial(Control {
                concurrent: 1,
                work: 1,
                repeat: 1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::MalformedInput(_)));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn sleep_interval_defaults_when_unset() {
        let controller = Arc::new(test_controller());
        let shared = controller.shared();

        let client = tokio::spawn(async move {
            let resp = serve_control(State(shared.clone())).await;
            let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let control: Control = serde_json::from_slice(&body).unwrap();
            assert_eq!(control.sleep_interval, DEFAULT_SLEEP_INTERVAL);
            serve_result(State(shared), Query(result_params(0.0, 0.0))).await;
        });

        controller
            .run_trial(Control {
                concurrent: 1,
                work: 1,
                repeat: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        client.await.unwrap();
    }
}
