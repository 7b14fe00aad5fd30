//! # Tracer Benchmark Controller - Main Entry Point
//!
//! Orchestrates one benchmark run end to end:
//! 1. **Initialize logging**: colorized tracing output, `RUST_LOG` aware
//! 2. **Load configuration**: workload config, measurement params, client registry
//! 3. **Start the fake collector**: HTTP (binary + JSON) and gRPC ingestion
//! 4. **Start the control server and client**: the client connects back
//!    over the synchronous control/result protocol
//! 5. **Calibrate**: estimate work-unit and span costs until sane
//! 6. **Measure**: sleep-cost trials, then the (rate, load) sweep
//! 7. **Write results**: one JSON document for later analysis
//!
//! The run fails fast on fatal conditions (protocol desynchronization,
//! client crash, calibration divergence); interference-invalidated
//! trials are retried silently and only counted.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracer_benchmark::{
    calibration::Calibrator,
    cli::{self, Args, ClientRegistry, Config, Params},
    collector::FakeCollector,
    controller::{ControllerOptions, HttpController},
    impairment::ImpairmentMeter,
    logging,
    resources::{clock_ticks_per_sec, InterferenceParams},
    results::{Output, ResultsWriter},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("Starting tracer benchmark controller");

    let config: Config = cli::load_json(&args.config_file)?;
    let params: Params = match &args.params_file {
        Some(path) => cli::load_json(path)?,
        None => Params::default(),
    };
    let registry = match &args.registry_file {
        Some(path) => cli::load_json::<ClientRegistry>(path)?,
        None => ClientRegistry::builtin(),
    };
    let spec = registry.lookup(&args.client)?.clone();
    info!("Testing client {} ({:?})", args.client, spec.args);

    let collector = FakeCollector::new();
    collector
        .serve_http(any_addr(args.collector_http_port))
        .await?;
    collector.serve_grpc(any_addr(args.collector_grpc_port));

    let controller = Arc::new(HttpController::new(ControllerOptions {
        interference: InterferenceParams {
            min_time_slice: params.test_time_slice.as_secs_f64(),
            user_threshold: params.user_interference_threshold,
            sys_threshold: params.sys_interference_threshold,
            ticks_per_sec: clock_ticks_per_sec(),
        },
        result_timeout: args.result_timeout,
    }));
    controller.serve(any_addr(args.controller_port)).await?;
    controller.start_client(&spec).await?;

    let mut output = Output::new(&args.title, &args.client, &args.name);
    output.concurrent = config.concurrency;
    output.log_num = config.log_num;
    output.log_bytes = config.log_num * config.log_size;

    let run = run_benchmark(
        controller.clone(),
        collector,
        config,
        params,
        &mut output,
    )
    .await;

    // The client only learns the run is over from the exit control, so
    // stop it even when measurement failed.
    let stop = controller.stop_client().await;
    run?;
    stop?;

    ResultsWriter::new(&args.output_file).write(&output)?;
    info!(
        "Benchmark complete: {} measurements, {} trials invalidated by interference",
        output.results.len(),
        controller.interferences()
    );
    Ok(())
}

async fn run_benchmark(
    controller: Arc<HttpController>,
    collector: FakeCollector,
    config: Config,
    params: Params,
    output: &mut Output,
) -> Result<()> {
    let minimum = params.minimum_calibrations;
    let mut cal = Calibrator::new(controller, collector.stats(), params);
    while cal.calibrations() < minimum {
        cal.recalibrate().await?;
    }

    cal.estimate_sleep_costs(output).await?;

    let mut meter = ImpairmentMeter::new(cal, config);
    meter.measure_impairment(output).await?;
    Ok(())
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}
