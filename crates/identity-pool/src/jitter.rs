//! Randomness seam for refresh thresholds and lock spreading

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;

/// Relative standard deviation of a load-spreading lock.
pub const SPREAD_RATIO: f64 = 0.15;

/// Source of the random draws the pool makes.
pub trait Jitter: Send + Sync {
    /// Uniform integer in `[low, high)`; `low` when the range is empty.
    fn uniform(&self, low: u64, high: u64) -> u64;

    /// Sample from the standard normal distribution.
    fn standard_normal(&self) -> f64;
}

pub type SharedJitter = Arc<dyn Jitter>;

/// Thread-local RNG backed jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn uniform(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        rand::rng().random_range(low..high)
    }

    fn standard_normal(&self) -> f64 {
        // Box-Muller; u1 is kept away from 0 so ln() stays finite.
        let mut rng = rand::rng();
        let u1: f64 = rng.random_range(f64::EPSILON..1.0);
        let u2: f64 = rng.random_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
    }
}

/// Deterministic jitter: every draw returns the configured value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedJitter {
    /// Clamped into `[low, high)` on each draw.
    pub uniform: u64,
    pub normal: f64,
}

impl FixedJitter {
    pub fn new(uniform: u64, normal: f64) -> Self {
        Self { uniform, normal }
    }
}

impl Jitter for FixedJitter {
    fn uniform(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        self.uniform.clamp(low, high - 1)
    }

    fn standard_normal(&self) -> f64 {
        self.normal
    }
}

/// Draw a load-spreading lock duration: `|Normal(mean, 0.15 × mean)|` seconds.
pub fn spread(jitter: &dyn Jitter, mean_secs: f64) -> Duration {
    let secs = (mean_secs + SPREAD_RATIO * mean_secs * jitter.standard_normal()).abs();
    if secs.is_finite() {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs_f64(mean_secs.abs())
    }
}
