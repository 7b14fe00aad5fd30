//! Runs the whole measurement pipeline (calibration, sleep costs,
//! impairment sweep) against a deterministic in-process client whose
//! costs are known exactly, and checks the numbers that come out.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracer_benchmark::calibration::Calibrator;
use tracer_benchmark::cli::{Config, Params};
use tracer_benchmark::collector::CollectorStats;
use tracer_benchmark::controller::ClientRunner;
use tracer_benchmark::error::Result;
use tracer_benchmark::impairment::ImpairmentMeter;
use tracer_benchmark::protocol::{Control, TrialResult};
use tracer_benchmark::results::Output;
use tracer_benchmark::timing::Timing;

const TRIAL_BASE: f64 = 2e-4;
const UNIT_COST: f64 = 1e-8;
const SPAN_COST: f64 = 1e-5;

/// Executes controls exactly: every work unit costs `UNIT_COST` user
/// seconds, every traced repeat adds `SPAN_COST` and delivers one span
/// to the collector, and requested sleeps are honored in full.
struct ModelClient {
    collector: CollectorStats,
}

#[async_trait]
impl ClientRunner for ModelClient {
    async fn run(&self, control: Control) -> Result<TrialResult> {
        if control.exit {
            return Ok(TrialResult::default());
        }
        let repeat = control.repeat as f64;
        let mut user = TRIAL_BASE + UNIT_COST * control.work as f64 * repeat;
        if control.trace {
            user += SPAN_COST * repeat;
            self.collector.record(control.repeat, 0, control.repeat * 100);
        }
        let sleeps = control.sleep.as_secs_f64() * repeat;
        Ok(TrialResult {
            measured: Timing {
                wall: user + sleeps,
                user,
                sys: 0.0,
            },
            flush: Timing::default(),
            sleeps,
        })
    }
}

#[tokio::test]
async fn full_pipeline_produces_consistent_output() {
    let collector = CollectorStats::new();
    let client = ModelClient {
        collector: collector.clone(),
    };
    let params = Params {
        calibrate_rounds: 5,
        experiment_duration: Duration::from_secs(1),
        experiment_rounds: 1,
        sleep_trial_count: 4,
        sleep_repeats: 10,
        ..Params::default()
    };
    let minimum = params.minimum_calibrations;

    let mut cal = Calibrator::new(Arc::new(client), collector, params);
    while cal.calibrations() < minimum {
        cal.recalibrate().await.unwrap();
    }
    assert_eq!(cal.calibrations(), 1);
    let work_err = (cal.work_cost().user - UNIT_COST).abs() / UNIT_COST;
    assert!(work_err < 0.02, "work cost off by {:.4}", work_err);

    let mut output = Output::new("pipeline", "model", "default");
    cal.estimate_sleep_costs(&mut output).await.unwrap();
    assert!(!output.sleeps.is_empty());
    for trial in &output.sleeps {
        assert_eq!(trial.repeats, 10);
        // The model sleeps exactly as asked, so the sleeping half
        // never burns less CPU than the other.
        assert!(trial.run_and_sleep.user >= trial.run_no_sleep.user - 1e-9);
    }

    let mut meter = ImpairmentMeter::new(
        cal,
        Config {
            concurrency: 1,
            log_num: 0,
            log_size: 0,
        },
    );
    meter.measure_impairment(&mut output).await.unwrap();

    // Default grid: 4 rates x 3 loads, one round per cell.
    assert_eq!(output.results.len(), 12);
    for m in &output.results {
        // Every span the model sent arrived at the fake collector.
        assert!(
            (m.completion - 1.0).abs() < 1e-9,
            "completion {} at rate {} load {}",
            m.completion,
            m.target_rate,
            m.target_load
        );
        // The untraced baseline has nothing unexplained beyond
        // calibration error.
        assert!(
            m.untraced.visible_impairment().abs() < 0.01,
            "untraced impairment {:.4}",
            m.untraced.visible_impairment()
        );
        // Tracing always costs the model SPAN_COST per span, so the
        // traced remainder exceeds the untraced one.
        assert!(
            m.traced.visible_impairment() > m.untraced.visible_impairment(),
            "no tracer tax visible at rate {} load {}",
            m.target_rate,
            m.target_load
        );
        assert!(m.untraced.work_ratio > 0.0 && m.untraced.work_ratio <= 1.0);
    }

    // Higher load leaves less sleep time at a fixed rate.
    let low_load = output
        .results
        .iter()
        .find(|m| m.target_rate == 100.0 && m.target_load == 0.5)
        .unwrap();
    let high_load = output
        .results
        .iter()
        .find(|m| m.target_rate == 100.0 && m.target_load == 1.0)
        .unwrap();
    assert!(low_load.untraced.sleep_ratio > high_load.untraced.sleep_ratio);
    assert!(high_load.untraced.sleep_ratio.abs() < 1e-9);
}
