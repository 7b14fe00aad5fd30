//! Wall/user/sys time triples and sample statistics.
//!
//! All values are floating seconds. `Timing` supports the arithmetic
//! the calibration and impairment engines need: subtraction, scalar
//! division, and scaled subtraction (`sub_factor`) used to remove fixed
//! per-round overhead multiplied by a repeat count.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One measurement expressed as wall, user, and system CPU seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub wall: f64,
    pub user: f64,
    pub sys: f64,
}

impl Timing {
    pub fn wall_timing(seconds: f64) -> Self {
        Timing {
            wall: seconds,
            ..Default::default()
        }
    }

    pub fn add(self, other: Timing) -> Timing {
        Timing {
            wall: self.wall + other.wall,
            user: self.user + other.user,
            sys: self.sys + other.sys,
        }
    }

    pub fn sub(self, other: Timing) -> Timing {
        Timing {
            wall: self.wall - other.wall,
            user: self.user - other.user,
            sys: self.sys - other.sys,
        }
    }

    pub fn div(self, d: f64) -> Timing {
        Timing {
            wall: self.wall / d,
            user: self.user / d,
            sys: self.sys / d,
        }
    }

    /// Subtract `other` scaled by `factor`, e.g. removing a fixed
    /// per-round cost across `factor` repetitions.
    pub fn sub_factor(self, other: Timing, factor: f64) -> Timing {
        Timing {
            wall: self.wall - other.wall * factor,
            user: self.user - other.user * factor,
            sys: self.sys - other.sys * factor,
        }
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "W: {:.6}s U: {:.6}s S: {:.6}s",
            self.wall, self.user, self.sys
        )
    }
}

/// Append-only sample sequence. Mean and confidence interval are
/// computed on demand so the interval narrows as samples accumulate.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    samples: Vec<f64>,
}

/// z value for a 95% two-sided normal confidence interval.
const NINETY_FIVE_Z: f64 = 1.96;

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn update(&mut self, v: f64) {
        self.samples.push(v);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Sample standard deviation (n-1 denominator).
    pub fn std_dev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .samples
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / (n - 1) as f64;
        var.sqrt()
    }

    pub fn std_err(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        self.std_dev() / (n as f64).sqrt()
    }

    /// 95% normal-approximation confidence interval as (low, high).
    pub fn normal_confidence_interval(&self) -> (f64, f64) {
        let m = self.mean();
        let half = NINETY_FIVE_Z * self.std_err();
        (m - half, m + half)
    }
}

/// Per-component statistics over a sequence of `Timing` samples.
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    pub wall: Stats,
    pub user: Stats,
    pub sys: Stats,
}

impl TimingStats {
    pub fn new() -> Self {
        TimingStats::default()
    }

    pub fn update(&mut self, tm: Timing) {
        self.wall.update(tm.wall);
        self.user.update(tm.user);
        self.sys.update(tm.sys);
    }

    pub fn count(&self) -> usize {
        self.wall.count()
    }

    pub fn mean(&self) -> Timing {
        Timing {
            wall: self.wall.mean(),
            user: self.user.mean(),
            sys: self.sys.mean(),
        }
    }

    pub fn normal_confidence_interval(&self) -> (Timing, Timing) {
        let (wl, wh) = self.wall.normal_confidence_interval();
        let (ul, uh) = self.user.normal_confidence_interval();
        let (sl, sh) = self.sys.normal_confidence_interval();
        (
            Timing {
                wall: wl,
                user: ul,
                sys: sl,
            },
            Timing {
                wall: wh,
                user: uh,
                sys: sh,
            },
        )
    }
}

impl fmt::Display for TimingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (low, high) = self.normal_confidence_interval();
        write!(f, "[{} - {}]", low, high)
    }
}
