//! Exercises the control/result protocol over real HTTP, standing in
//! for a client process with hand-rolled requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracer_benchmark::controller::{ControllerOptions, HttpController};
use tracer_benchmark::error::BenchError;
use tracer_benchmark::protocol::Control;
use tracer_benchmark::resources::InterferenceParams;

async fn http_request(addr: SocketAddr, request: String) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8(raw).unwrap();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("unparseable response: {}", text));
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

fn get(path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    )
}

fn post(path_and_query: &str) -> String {
    format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        path_and_query
    )
}

async fn started_controller() -> (Arc<HttpController>, SocketAddr) {
    let controller = Arc::new(HttpController::new(ControllerOptions {
        interference: InterferenceParams {
            min_time_slice: 0.05,
            user_threshold: 0.01,
            sys_threshold: 0.02,
            ticks_per_sec: 100.0,
        },
        result_timeout: Some(Duration::from_secs(10)),
    }));
    let addr = controller
        .serve(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    (controller, addr)
}

#[tokio::test]
async fn trial_round_trips_over_http() {
    let (controller, addr) = started_controller().await;

    let driver = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run_trial(Control {
                    concurrent: 1,
                    work: 100,
                    repeat: 3,
                    ..Default::default()
                })
                .await
        })
    };

    let (status, body) = http_request(addr, get("/control")).await;
    assert_eq!(status, 200);
    let control: Control = serde_json::from_str(&body).unwrap();
    assert_eq!(control.work, 100);
    assert_eq!(control.repeat, 3);
    assert!(!control.exit);
    // Unset sleep intervals are defaulted before hitting the wire.
    assert_eq!(control.sleep_interval, Duration::from_millis(50));

    let (status, body) = http_request(addr, post("/result?timing=1.5&flush=0.25&s=0.5")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "OK");

    let result = driver.await.unwrap().unwrap();
    assert!((result.measured.wall - 1.5).abs() < 1e-9);
    assert!((result.flush.wall - 0.25).abs() < 1e-9);
    assert!((result.sleeps - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn sleep_debt_amortizes_across_repeats() {
    let (controller, addr) = started_controller().await;

    let driver = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run_trial(Control {
                    concurrent: 1,
                    work: 1000,
                    repeat: 10,
                    trace: false,
                    sleep: Duration::from_nanos(1),
                    sleep_interval: Duration::from_nanos(5),
                    ..Default::default()
                })
                .await
        })
    };

    let (status, body) = http_request(addr, get("/control")).await;
    assert_eq!(status, 200);
    let control: Control = serde_json::from_str(&body).unwrap();
    assert_eq!(control.sleep, Duration::from_nanos(1));
    assert_eq!(control.sleep_interval, Duration::from_nanos(5));

    // Execute the control the way a client does: accrue sleep debt on
    // every repeat, and only actually sleep (paying off the whole debt)
    // once it reaches the interval.
    const COST_PER_UNIT: f64 = 1e-9;
    let mut debt = Duration::ZERO;
    let mut slept = Duration::ZERO;
    let mut crossings = 0;
    let mut busy = 0.0;
    for _ in 0..control.repeat {
        busy += COST_PER_UNIT * control.work as f64;
        debt += control.sleep;
        if debt >= control.sleep_interval {
            slept += debt;
            debt = Duration::ZERO;
            crossings += 1;
        }
    }
    // 1ns of debt per repeat against a 5ns interval: the debt crosses
    // at repeats 5 and 10, nowhere else.
    assert_eq!(crossings, 2);
    let sleeps = slept.as_secs_f64();
    assert!(sleeps > 0.0);
    let wall = busy + sleeps;

    let (status, _) =
        http_request(addr, post(&format!("/result?timing={}&s={}", wall, sleeps))).await;
    assert_eq!(status, 200);

    let result = driver.await.unwrap().unwrap();
    assert!((result.sleeps - 10e-9).abs() < 1e-12);
    // The slept nanoseconds are a rounding error next to the busy time,
    // so the wall clock is ten executions of work=1000.
    let expected_busy = 10.0 * COST_PER_UNIT * 1000.0;
    assert!((result.measured.wall - expected_busy).abs() < expected_busy * 0.01);
    assert!((result.measured.wall - wall).abs() < 1e-12);
}

#[tokio::test]
async fn consecutive_trials_alternate_phases() {
    let (controller, addr) = started_controller().await;

    for round in 0..3 {
        let driver = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .run_trial(Control {
                        concurrent: 1,
                        work: 10,
                        repeat: 1,
                        ..Default::default()
                    })
                    .await
            })
        };
        let (status, _) = http_request(addr, get("/control")).await;
        assert_eq!(status, 200, "round {}", round);
        let (status, _) =
            http_request(addr, post(&format!("/result?timing={}.0", round + 1))).await;
        assert_eq!(status, 200, "round {}", round);
        let result = driver.await.unwrap().unwrap();
        assert!((result.measured.wall - (round + 1) as f64).abs() < 1e-9);
    }
}

#[tokio::test]
async fn out_of_phase_result_is_fatal() {
    let (controller, addr) = started_controller().await;

    let (status, _) = http_request(addr, post("/result?timing=1.0")).await;
    assert_eq!(status, 409);

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
async fn malformed_result_rejected_with_400() {
    let (controller, addr) = started_controller().await;

    let driver = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run_trial(Control {
                    concurrent: 1,
                    work: 1,
                    repeat: 1,
                    ..Default::default()
                })
                .await
        })
    };
    let (status, _) = http_request(addr, get("/control")).await;
    assert_eq!(status, 200);
    let (status, _) = http_request(addr, post("/result?timing=bogus")).await;
    assert_eq!(status, 400);

    let err = driver.await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::MalformedInput(_)));
}

#[tokio::test]
async fn stop_delivers_the_exit_control() {
    let (controller, addr) = started_controller().await;

    // No child process was started, so stop returns once the exit
    // control is queued; the client sees it on its next poll.
    controller.stop_client().await.unwrap();

    let (status, body) = http_request(addr, get("/control")).await;
    assert_eq!(status, 200);
    let control: Control = serde_json::from_str(&body).unwrap();
    assert!(control.exit);
}

#[tokio::test]
async fn unknown_paths_are_rejected() {
    let (_controller, addr) = started_controller().await;
    let (status, _) = http_request(addr, get("/definitely-not-a-route")).await;
    assert_eq!(status, 404);
}
