//! Running mean and variance of a scalar observable.

use serde::{Deserialize, Serialize};

/// Welford accumulator; serializable so partial runs survive checkpoints.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    samples: u64,
    mean: f64,
    m2: f64,
}

impl Measurement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.samples += 1;
        let delta = value - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Combines two accumulators as if every sample had gone into one.
    pub fn merge(&mut self, other: &Measurement) {
        if other.samples == 0 {
            return;
        }
        if self.samples == 0 {
            *self = other.clone();
            return;
        }
        let (na, nb) = (self.samples as f64, other.samples as f64);
        let n = na + nb;
        let delta = other.mean - self.mean;
        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.samples += other.samples;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance; zero below two samples.
    pub fn variance(&self) -> f64 {
        if self.samples < 2 {
            0.0
        } else {
            self.m2 / (self.samples - 1) as f64
        }
    }

    /// Standard error of the mean, ignoring autocorrelation.
    pub fn error(&self) -> f64 {
        if self.samples < 2 {
            0.0
        } else {
            (self.variance() / self.samples as f64).sqrt()
        }
    }
}
