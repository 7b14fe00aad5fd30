//! Impairment measurement: how much CPU the tracer steals.
//!
//! Each measurement drives the client at a target span rate and CPU
//! load for a fixed duration, once untraced and once traced. The
//! client's time splits into known work, known sleep, and a remainder;
//! the remainder's share of the total is the impairment. An untraced
//! run going meaningfully negative means the work calibration has
//! drifted, which triggers recalibration and a retry.

use crate::calibration::Calibrator;
use crate::cli::{Config, Params};
use crate::controller::ClientRunner;
use crate::error::Result;
use crate::protocol::Control;
use crate::results::Output;
use crate::timing::Stats;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// One impairment trial's shape.
#[derive(Debug, Clone, Copy)]
struct ImpairmentTest {
    trace: bool,
    concurrency: usize,
    rate: f64,
    load: f64,
    log_num: i64,
    log_size: i64,
}

/// What one trial actually delivered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    /// Spans per second the client actually achieved.
    pub request_rate: f64,
    /// Fraction of total time spent in known busy work.
    pub work_ratio: f64,
    /// Fraction of total time spent sleeping.
    pub sleep_ratio: f64,
}

impl DataPoint {
    /// The unaccounted remainder attributed to the tracer.
    pub fn visible_impairment(&self) -> f64 {
        1.0 - self.work_ratio - self.sleep_ratio
    }
}

/// One (rate, load) cell of the sweep: an untraced baseline, a traced
/// run, and the traced run's span completion ratio.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub target_rate: f64,
    pub target_load: f64,
    pub untraced: DataPoint,
    pub traced: DataPoint,
    /// Spans received divided by spans sent, 0 to 1.
    pub completion: f64,
}

/// Sweeps the (rate, load) grid over a calibrated client.
pub struct ImpairmentMeter<R: ClientRunner> {
    cal: Calibrator<R>,
    config: Config,
}

impl<R: ClientRunner> ImpairmentMeter<R> {
    pub fn new(cal: Calibrator<R>, config: Config) -> Self {
        ImpairmentMeter { cal, config }
    }

    pub fn calibrator_mut(&mut self) -> &mut Calibrator<R> {
        &mut self.cal
    }

    fn params(&self) -> Params {
        self.cal.params().clone()
    }

    /// Runs trials at the given shape until one is not invalidated by
    /// calibration drift.
    async fn measure_span_impairment(
        &mut self,
        test: ImpairmentTest,
    ) -> Result<(DataPoint, f64)> {
        let params = self.params();
        let qps_per_cpu = test.rate / test.concurrency as f64;
        let work_time = test.load / qps_per_cpu;
        let sleep_time = (1.0 - test.load) / qps_per_cpu;
        let duration = params.experiment_duration.as_secs_f64();
        let total_spans = test.rate * duration;
        let total_per_cpu = duration * qps_per_cpu;
        let kind = if test.trace { "traced" } else { "untraced" };

        loop {
            let (spans_before, dropped_before, _) = self.cal.collector().get();
            let work = (work_time / self.cal.work_cost().user) as i64;
            let tm = self
                .cal
                .runner()
                .run(Control {
                    concurrent: test.concurrency,
                    work,
                    sleep: Duration::from_secs_f64(sleep_time),
                    repeat: total_per_cpu as i64,
                    trace: test.trace,
                    num_logs: test.log_num,
                    bytes_per_log: test.log_size,
                    ..Default::default()
                })
                .await?;
            let (spans_after, dropped_after, _) = self.cal.collector().get();
            let spans = spans_after - spans_before;
            let dropped = dropped_after - dropped_before;

            let sleep_per_cpu = tm.sleeps / test.concurrency as f64;
            let work_per_cpu = total_per_cpu * work_time;
            let total_time = tm.measured.user + tm.measured.sys + tm.sleeps;
            let total_time_per_cpu = total_time / test.concurrency as f64;
            let actual_rate = total_spans / total_time_per_cpu;

            let trace_cost_per_cpu = total_time_per_cpu - work_per_cpu - sleep_per_cpu;
            let impairment = trace_cost_per_cpu / total_time_per_cpu;
            let work_load = work_per_cpu / total_time_per_cpu;
            let sleep_load = sleep_per_cpu / total_time_per_cpu;
            let visible_load = (total_time_per_cpu - sleep_per_cpu) / total_time_per_cpu;

            let complete_pct = if test.trace && spans + dropped != 0 {
                100.0 * spans as f64 / (spans + dropped) as f64
            } else {
                0.0
            };
            info!(
                "Trial {}@{:.0}% {:.3}s (log{}*{},{}) work {:.2}% load {:.2}% impairment {:.2}%, rate {:.1} [{:.1}%]",
                test.rate,
                100.0 * test.load,
                total_time_per_cpu,
                test.log_num,
                test.log_size,
                kind,
                100.0 * work_load,
                100.0 * visible_load,
                100.0 * impairment,
                actual_rate,
                complete_pct
            );

            // An untraced run has no tracer to blame; a remainder this
            // far negative means the work cost estimate is stale.
            if !test.trace && impairment < params.negative_recalibration_threshold {
                self.cal.recalibrate().await?;
                continue;
            }
            if test.trace && spans + dropped != total_spans as i64 {
                warn!(
                    "Dropped/received spans mismatch: {} + {} != {}",
                    spans, dropped, total_spans
                );
            }

            let completion = spans as f64 / total_spans;
            return Ok((
                DataPoint {
                    request_rate: actual_rate,
                    work_ratio: work_load,
                    sleep_ratio: sleep_load,
                },
                completion,
            ));
        }
    }

    /// One grid cell: `experiment_rounds` untraced/traced pairs.
    async fn measure_at_rate_and_load(
        &mut self,
        rate: f64,
        load: f64,
    ) -> Result<Vec<Measurement>> {
        info!("Starting rate={:.2}/sec load={:.2}% test", rate, load * 100.0);
        let rounds = self.params().experiment_rounds;
        let mut measurements = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let (untraced, _) = self
                .measure_span_impairment(ImpairmentTest {
                    trace: false,
                    concurrency: self.config.concurrency,
                    rate,
                    load,
                    log_num: self.config.log_num,
                    log_size: self.config.log_size,
                })
                .await?;
            let (traced, completion) = self
                .measure_span_impairment(ImpairmentTest {
                    trace: true,
                    concurrency: self.config.concurrency,
                    rate,
                    load,
                    log_num: self.config.log_num,
                    log_size: self.config.log_size,
                })
                .await?;
            measurements.push(Measurement {
                target_rate: rate,
                target_load: load,
                untraced,
                traced,
                completion,
            });
        }
        info!("{}", summarize(&measurements));
        Ok(measurements)
    }

    /// The full sweep, appending every measurement to the output.
    pub async fn measure_impairment(&mut self, output: &mut Output) -> Result<()> {
        let params = self.params();
        for i in 0..=params.rate_increments {
            let rate = params.minimum_rate
                + i as f64 * (params.maximum_rate - params.minimum_rate)
                    / params.rate_increments.max(1) as f64;
            for j in 0..=params.load_increments {
                let load = params.minimum_load
                    + j as f64 * (params.maximum_load - params.minimum_load)
                        / params.load_increments.max(1) as f64;
                let ms = self.measure_at_rate_and_load(rate, load).await?;
                output.results.extend(ms);
            }
        }
        Ok(())
    }
}

/// Confidence-interval summary of one cell's measurements: the visible
/// (non-sleep) load with and without tracing, and their gap.
pub fn summarize(measurements: &[Measurement]) -> String {
    let mut traced = Stats::new();
    let mut untraced = Stats::new();
    let mut completion = Stats::new();
    for m in measurements {
        traced.update(m.traced.work_ratio + m.traced.sleep_ratio);
        untraced.update(m.untraced.work_ratio + m.untraced.sleep_ratio);
        completion.update(m.completion);
    }
    let (tl, th) = traced.normal_confidence_interval();
    let (ul, uh) = untraced.normal_confidence_interval();
    format!(
        "{:.2}% complete, traced [{:.3}-{:.3}%] untraced [{:.3}-{:.3}%] gap {:.3}%",
        completion.mean() * 100.0,
        tl * 100.0,
        th * 100.0,
        ul * 100.0,
        uh * 100.0,
        (ul - th) * 100.0
    )
}
