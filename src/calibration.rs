//! Calibration engine: converts abstract work units into CPU seconds.
//!
//! The client's busy-loop "work" unit has no fixed duration, so before
//! anything can be measured the controller estimates its per-unit cost
//! on this machine, sanity-checks the estimate by predicting a whole
//! time slice, and measures the fixed per-span tracing cost. All
//! estimates are invalidated and redone (with a doubled time slice)
//! whenever later measurements look implausible.

use crate::cli::Params;
use crate::collector::CollectorStats;
use crate::controller::ClientRunner;
use crate::error::{BenchError, Result};
use crate::protocol::{Control, TrialResult, DEFAULT_SLEEP_INTERVAL};
use crate::results::{Output, SleepCalibration};
use crate::timing::{Timing, TimingStats};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fraction of extra rounds run first and discarded.
const WARMUP_RATIO: f64 = 0.1;

/// Starting multiplier for the geometric search that sizes a trial to
/// at least one time slice of user CPU.
const STARTING_MULTIPLIER: i64 = 1_000_000;

/// Search cutoff: a client this fast is not measurable.
const MULTIPLIER_LIMIT: i64 = 1_000_000_000_000_000;

/// Calibration state for one controller/client pair.
pub struct Calibrator<R: ClientRunner> {
    runner: Arc<R>,
    collector: CollectorStats,
    params: Params,

    /// Current calibration time slice in seconds. Doubles on each
    /// retry past the minimum calibration count.
    time_slice: f64,
    calibrations: usize,

    /// CPU cost of one unit of work.
    work_cost: Timing,
    /// CPU cost of tracing one span that does no work.
    span_cost: Timing,
}

impl<R: ClientRunner> Calibrator<R> {
    pub fn new(runner: Arc<R>, collector: CollectorStats, params: Params) -> Self {
        let time_slice = params.test_time_slice.as_secs_f64();
        Calibrator {
            runner,
            collector,
            params,
            time_slice,
            calibrations: 0,
            work_cost: Timing::default(),
            span_cost: Timing::default(),
        }
    }

    pub fn work_cost(&self) -> Timing {
        self.work_cost
    }

    pub fn span_cost(&self) -> Timing {
        self.span_cost
    }

    pub fn calibrations(&self) -> usize {
        self.calibrations
    }

    pub fn time_slice(&self) -> f64 {
        self.time_slice
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn collector(&self) -> &CollectorStats {
        &self.collector
    }

    pub fn runner(&self) -> Arc<R> {
        Arc::clone(&self.runner)
    }

    #[cfg(test)]
    pub(crate) fn set_work_cost_for_tests(&mut self, cost: Timing) {
        self.work_cost = cost;
    }

    async fn run(&self, control: Control) -> Result<TrialResult> {
        self.runner.run(control).await
    }

    /// Exercises both the untraced and traced paths so caches, JITs,
    /// and the tracer's buffers are in steady state before measuring.
    async fn warmup(&self) -> Result<()> {
        self.run(Control {
            concurrent: 1,
            work: 1000,
            repeat: 10,
            trace: false,
            sleep: Duration::from_nanos(1),
            sleep_interval: Duration::from_nanos(5),
            ..Default::default()
        })
        .await?;
        self.run(Control {
            concurrent: 1,
            work: 1000,
            repeat: 10,
            trace: true,
            sleep: Duration::from_nanos(10),
            sleep_interval: Duration::from_nanos(100),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    /// Grows `multiplier` tenfold until one trial burns at least a
    /// time slice of user CPU, then averages `calibrate_rounds` trials
    /// (after discarding warmup rounds) and normalizes per multiplier.
    async fn estimate_per_multiplier<F>(&self, make: F) -> Result<Timing>
    where
        F: Fn(i64) -> Control,
    {
        let mut multiplier = STARTING_MULTIPLIER;
        loop {
            debug!("testing trial size at multiplier {}", multiplier);
            let tm = self.run(make(multiplier)).await?;
            if tm.measured.user < self.time_slice {
                multiplier = multiplier
                    .checked_mul(10)
                    .filter(|m| *m <= MULTIPLIER_LIMIT)
                    .ok_or(BenchError::CalibrationDivergence {
                        attempts: self.calibrations,
                    })?;
                continue;
            }

            let warmup = (self.params.calibrate_rounds as f64 * WARMUP_RATIO) as usize;
            let mut stats = TimingStats::new();
            for round in 0..self.params.calibrate_rounds + warmup {
                let tm = self.run(make(multiplier)).await?;
                if round < warmup {
                    continue;
                }
                stats.update(tm.measured);
            }
            return Ok(stats.mean().div(multiplier as f64));
        }
    }

    /// Estimates the CPU cost of one work unit.
    async fn estimate_work_cost(&mut self) -> Result<()> {
        let cost = self
            .estimate_per_multiplier(|multiplier| Control {
                concurrent: 1,
                work: multiplier,
                repeat: 1,
                ..Default::default()
            })
            .await?;
        self.work_cost = cost;
        info!("Cost W = {} /unit", self.work_cost);
        Ok(())
    }

    /// Asks the client to burn exactly one predicted time slice and
    /// checks the measurement against the prediction.
    async fn sanity_check_work(&self) -> Result<bool> {
        let mut stats = TimingStats::new();
        for _ in 0..self.params.calibrate_rounds {
            let work = (self.time_slice / self.work_cost.user) as i64;
            let tm = self
                .run(Control {
                    concurrent: 1,
                    work,
                    repeat: 1,
                    ..Default::default()
                })
                .await?;
            stats.update(tm.measured);
        }
        debug!("check work timing {} expected {}s", stats, self.time_slice);

        let abs_ratio = ((stats.user.mean() - self.time_slice) / self.time_slice).abs();
        if abs_ratio > self.params.test_tolerance {
            warn!(
                "CPU work not well calibrated (or insufficient CPU): measured {} expected {:.6}s, off by {:.2}%",
                stats.mean(),
                self.time_slice,
                abs_ratio * 100.0
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Measures the per-iteration cost of the client's test loop at
    /// zero work, traced or untraced.
    async fn measure_test_loop(&self, trace: bool) -> Result<Timing> {
        self.estimate_per_multiplier(|multiplier| Control {
            concurrent: 1,
            work: 0,
            repeat: multiplier,
            trace,
            ..Default::default()
        })
        .await
    }

    async fn measure_span_cost(&mut self) -> Result<()> {
        self.span_cost = self.measure_test_loop(true).await?;
        info!("Cost T = {} /span", self.span_cost);
        Ok(())
    }

    /// Runs calibrations until one passes the sanity check, doubling
    /// the time slice on retries past the minimum calibration count.
    /// Span counters reset with each attempt so completion ratios are
    /// scoped to the measurements that follow.
    pub async fn recalibrate(&mut self) -> Result<()> {
        while self.calibrations < self.params.maximum_calibrations {
            if self.calibrations >= self.params.minimum_calibrations {
                let cap = self.params.experiment_duration.as_secs_f64();
                self.time_slice = (self.time_slice * 2.0).min(cap);
            }
            info!(
                "Calibration starting, time slice {:.3}s, rounds {}",
                self.time_slice, self.params.calibrate_rounds
            );
            self.calibrations += 1;
            self.collector.reset();

            self.warmup().await?;
            self.estimate_work_cost().await?;
            if !self.sanity_check_work().await? {
                continue;
            }
            self.measure_span_cost().await?;
            return Ok(());
        }
        Err(BenchError::CalibrationDivergence {
            attempts: self.calibrations,
        })
    }

    /// Estimates what sleeping costs by running matched trial pairs,
    /// one half sleeping between repeats and one half not, in random
    /// order so drift cannot masquerade as sleep cost. The raw trials
    /// land in the output; they do not adjust impairment figures.
    pub async fn estimate_sleep_costs(&mut self, output: &mut Output) -> Result<()> {
        info!("Estimating sleep cost");
        let repeats = self.params.sleep_repeats;
        let mut trials = self.params.sleep_trial_count;

        'outer: loop {
            output.sleeps.clear();
            let mut factor = self.params.sleep_min_work_factor;
            while factor <= self.params.sleep_max_work_factor {
                let equal_work =
                    (DEFAULT_SLEEP_INTERVAL.as_secs_f64() / self.work_cost.user) as i64;

                let mut with = TimingStats::new();
                let mut without = TimingStats::new();

                let warmup = (trials as f64 * WARMUP_RATIO) as usize;
                for i in 0..trials + warmup {
                    let (s1, s2) = if rand::random::<f64>() < 0.5 {
                        (DEFAULT_SLEEP_INTERVAL, Duration::ZERO)
                    } else {
                        (Duration::ZERO, DEFAULT_SLEEP_INTERVAL)
                    };
                    let r1 = self
                        .run(Control {
                            concurrent: 1,
                            work: equal_work * factor,
                            sleep: s1,
                            repeat: repeats,
                            ..Default::default()
                        })
                        .await?;
                    let r2 = self
                        .run(Control {
                            concurrent: 1,
                            work: equal_work * factor,
                            sleep: s2,
                            repeat: repeats,
                            ..Default::default()
                        })
                        .await?;
                    if i < warmup {
                        continue;
                    }
                    let (slept, awake) = if s2.is_zero() { (r1, r2) } else { (r2, r1) };

                    with.update(slept.measured);
                    without.update(awake.measured);

                    output.sleeps.push(SleepCalibration {
                        work_factor: factor,
                        run_and_sleep: slept.measured,
                        run_no_sleep: awake.measured,
                        repeats,
                    });
                }

                let mean_timing = with.mean().sub(without.mean()).div(repeats as f64);
                let mean_cost = mean_timing.user + mean_timing.sys;
                info!(
                    "Sleep mean difference {:.9}s at work factor {}",
                    mean_cost, factor
                );

                if mean_cost < 0.0 {
                    info!("Negative user time, recalibrating");
                    self.recalibrate().await?;
                    continue 'outer;
                }
                if (with.sys.mean() < 0.0 || without.sys.mean() < 0.0) && trials < 1000 {
                    trials *= 2;
                    info!("Negative system time, doubling trials to {}", trials);
                    continue 'outer;
                }

                factor += self.params.sleep_work_factor_incr;
            }
            return Ok(());
        }
    }
}
