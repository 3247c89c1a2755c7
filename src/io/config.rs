//! YAML configuration for a DQMC run.
//!
//! ```yaml
//! simulation:
//!   lx: 4
//!   ly: 4
//!   time_slices: 40
//!   beta: 4.0
//!   u: -4.0
//!   mu: 0.0
//!   slices_per_block: 10
//!   max_update_size: 16
//! thermalization: 200
//! sweeps: 1000
//! checkpoint: run.ckpt.yml
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DqmcError, Result};
use crate::propagator::PropagatorOrder;
use crate::stabilization::StabilizationScheme;

fn one() -> usize {
    1
}

fn unit_hopping() -> f64 {
    1.0
}

fn fair_coin() -> f64 {
    0.5
}

fn default_batch() -> usize {
    16
}

fn default_tolerance() -> f64 {
    1.0e-6
}

fn enabled() -> bool {
    true
}

/// How imaginary time is discretized.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeDiscretization {
    /// N Trotter steps of length β/N, sampled with incremental low-rank updates.
    #[default]
    Trotter,
    /// A varying number of interaction vertices at continuous times, sampled
    /// by full re-evaluation. `time_slices` only sizes the Trotter engine.
    Continuous,
}

/// Model and algorithm parameters of one replica.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Parameters {
    #[serde(default = "one")]
    pub lx: usize,
    #[serde(default = "one")]
    pub ly: usize,
    #[serde(default = "one")]
    pub lz: usize,
    /// Number of imaginary-time steps N.
    pub time_slices: usize,
    /// Inverse temperature.
    pub beta: f64,
    /// On-site interaction; negative values are attractive.
    pub u: f64,
    #[serde(default)]
    pub mu: f64,
    /// Uniform magnetic field.
    #[serde(default)]
    pub b: f64,
    /// Staggered on-site field.
    #[serde(default)]
    pub h: f64,
    #[serde(default = "unit_hopping")]
    pub tx: f64,
    #[serde(default = "unit_hopping")]
    pub ty: f64,
    #[serde(default = "unit_hopping")]
    pub tz: f64,
    #[serde(default)]
    pub seed: u64,
    /// Time steps per cached slice; 0 means one slice spanning all of N.
    #[serde(default)]
    pub slices_per_block: usize,
    /// Slices multiplied between two re-factorizations.
    #[serde(default = "one")]
    pub blocks_per_svd: usize,
    #[serde(default)]
    pub stabilization: StabilizationScheme,
    #[serde(default)]
    pub discretization: TimeDiscretization,
    #[serde(default = "default_batch")]
    pub max_update_size: usize,
    /// Metropolis steps per sweep; 0 means `max_update_size`.
    #[serde(default)]
    pub flips_per_update: usize,
    /// Whole-site flips, accepted on a full re-evaluation, per sweep.
    #[serde(default)]
    pub site_flips: usize,
    /// Probability of drawing +A when initializing a field.
    #[serde(default = "fair_coin")]
    pub init_probability: f64,
    #[serde(default)]
    pub order: PropagatorOrder,
    #[serde(default = "default_tolerance")]
    pub drift_tolerance: f64,
    #[serde(default = "enabled")]
    pub verify_phase: bool,
}

/// Quantities derived from the bare parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coupling {
    /// Imaginary-time step β/N.
    pub dt: f64,
    /// Effective coupling g = -U.
    pub g: f64,
    /// Field magnitude A = sqrt(exp(g·dt) - 1).
    pub a: f64,
}

impl Coupling {
    /// Normalization (1 - A²) picked up by every inverted interaction factor.
    pub fn inverse_norm(&self) -> f64 {
        1.0 - self.a * self.a
    }
}

impl Parameters {
    /// Minimal parameter set with every optional knob at its default.
    pub fn new(extents: [usize; 3], time_slices: usize, beta: f64, u: f64) -> Self {
        Self {
            lx: extents[0],
            ly: extents[1],
            lz: extents[2],
            time_slices,
            beta,
            u,
            mu: 0.0,
            b: 0.0,
            h: 0.0,
            tx: unit_hopping(),
            ty: unit_hopping(),
            tz: unit_hopping(),
            seed: 0,
            slices_per_block: 0,
            blocks_per_svd: one(),
            stabilization: StabilizationScheme::default(),
            discretization: TimeDiscretization::default(),
            max_update_size: default_batch(),
            flips_per_update: 0,
            site_flips: 0,
            init_probability: fair_coin(),
            order: PropagatorOrder::default(),
            drift_tolerance: default_tolerance(),
            verify_phase: enabled(),
        }
    }

    pub fn extents(&self) -> [usize; 3] {
        [self.lx, self.ly, self.lz]
    }

    pub fn hoppings(&self) -> [f64; 3] {
        [self.tx, self.ty, self.tz]
    }

    /// Slice block length after resolving 0 and clamping to N.
    pub fn block_length(&self) -> usize {
        match self.slices_per_block {
            0 => self.time_slices,
            m => m.min(self.time_slices),
        }
    }

    pub fn batch_capacity(&self) -> usize {
        self.max_update_size.max(1)
    }

    pub fn flips_per_sweep(&self) -> usize {
        match self.flips_per_update {
            0 => self.batch_capacity(),
            n => n,
        }
    }

    /// Fugacities (λ↑, λ↓) = (exp(β(μ + B/2)), exp(β(μ - B/2))).
    pub fn fugacities(&self) -> (f64, f64) {
        (
            (self.beta * (self.mu + 0.5 * self.b)).exp(),
            (self.beta * (self.mu - 0.5 * self.b)).exp(),
        )
    }

    pub fn coupling(&self) -> Result<Coupling> {
        if self.time_slices == 0 {
            return Err(DqmcError::invalid("time_slices", "must be positive"));
        }
        let dt = self.beta / self.time_slices as f64;
        let g = -self.u;
        let a = ((g * dt).exp() - 1.0).sqrt();
        if !a.is_finite() {
            return Err(DqmcError::invalid(
                "u",
                format!("field magnitude sqrt(exp(-U·dt) - 1) is not real for U={} dt={dt}", self.u),
            ));
        }
        if a >= 1.0 {
            return Err(DqmcError::invalid(
                "time_slices",
                format!("field magnitude {a:.4} >= 1 makes the interaction factor singular; increase N"),
            ));
        }
        Ok(Coupling { dt, g, a })
    }

    /// Field magnitude sqrt(-U) of a continuous-time vertex.
    pub fn vertex_magnitude(&self) -> Result<f64> {
        let a = (-self.u).sqrt();
        if !(a.is_finite() && a < 1.0) {
            return Err(DqmcError::invalid(
                "u",
                format!("continuous-time vertices need 0 <= -U < 1, got U={}", self.u),
            ));
        }
        Ok(a)
    }

    /// Rejects parameter sets the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, extent) in [("lx", self.lx), ("ly", self.ly), ("lz", self.lz)] {
            if extent == 0 {
                return Err(DqmcError::invalid(name, "lattice extent must be at least 1"));
            }
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            return Err(DqmcError::invalid("beta", format!("must be positive and finite, got {}", self.beta)));
        }
        for (name, value) in [("mu", self.mu), ("b", self.b), ("h", self.h), ("tx", self.tx), ("ty", self.ty), ("tz", self.tz)] {
            if !value.is_finite() {
                return Err(DqmcError::invalid(name, "must be finite"));
            }
        }
        if self.blocks_per_svd == 0 {
            return Err(DqmcError::invalid("blocks_per_svd", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.init_probability) {
            return Err(DqmcError::invalid("init_probability", "must lie in [0, 1]"));
        }
        if !(self.drift_tolerance > 0.0) {
            return Err(DqmcError::invalid("drift_tolerance", "must be positive"));
        }
        let (up, dn) = self.fugacities();
        if !(up.is_finite() && up > 0.0 && dn.is_finite() && dn > 0.0) {
            return Err(DqmcError::invalid(
                "mu",
                format!("fugacities exp(β(μ ± B/2)) = ({up:e}, {dn:e}) are not positive and finite"),
            ));
        }
        match self.discretization {
            TimeDiscretization::Trotter => self.coupling().map(|_| ()),
            TimeDiscretization::Continuous => self.vertex_magnitude().map(|_| ()),
        }
    }
}

/// Top-level run description read by the binary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub simulation: Parameters,
    #[serde(default)]
    pub thermalization: usize,
    pub sweeps: usize,
    #[serde(default)]
    pub checkpoint: Option<String>,
}

pub fn read_run_config(filename: impl AsRef<Path>) -> Result<RunConfig> {
    let file = std::fs::File::open(filename)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_yaml::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn defaults_are_filled_from_yaml() {
        let yaml = "simulation:\n  lx: 4\n  ly: 2\n  time_slices: 20\n  beta: 2.0\n  u: -4.0\nsweeps: 10\n";
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        let p = &config.simulation;
        assert_eq!(p.extents(), [4, 2, 1]);
        assert_eq!(p.block_length(), 20);
        assert_eq!(p.flips_per_sweep(), 16);
        assert_eq!(p.order, PropagatorOrder::KineticLast);
        assert_eq!(config.thermalization, 0);
        assert!(p.verify_phase);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn coupling_matches_definition() {
        let p = Parameters::new([2, 2, 1], 16, 2.0, -4.0);
        let c = p.coupling().unwrap();
        assert_relative_eq!(c.dt, 0.125, epsilon = 1e-15);
        assert_relative_eq!(c.a, (0.5f64.exp() - 1.0).sqrt(), epsilon = 1e-15);
        assert_relative_eq!(c.inverse_norm(), 2.0 - 0.5f64.exp(), epsilon = 1e-14);
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut p = Parameters::new([0, 1, 1], 8, 1.0, -1.0);
        assert!(matches!(p.validate(), Err(DqmcError::InvalidParameters { name: "lx", .. })));
        p.lx = 2;
        p.time_slices = 0;
        assert!(p.validate().is_err());
        p.time_slices = 8;
        p.beta = -1.0;
        assert!(p.validate().is_err());
        p.beta = 1.0;
        p.u = 2.0;
        assert!(matches!(p.validate(), Err(DqmcError::InvalidParameters { name: "u", .. })));
        p.u = -40.0;
        assert!(matches!(p.validate(), Err(DqmcError::InvalidParameters { name: "time_slices", .. })));
    }

    #[test]
    fn rejects_overflowing_fugacities() {
        let mut p = Parameters::new([2, 2, 1], 8, 1.0, -1.0);
        p.mu = 800.0;
        assert!(matches!(p.validate(), Err(DqmcError::InvalidParameters { name: "mu", .. })));
        p.mu = 0.0;
        p.beta = 100.0;
        p.time_slices = 800;
        p.b = -20.0;
        assert!(matches!(p.validate(), Err(DqmcError::InvalidParameters { name: "mu", .. })));
        p.b = 2.0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn strategies_are_read_from_yaml() {
        let yaml = "simulation:\n  lx: 2\n  time_slices: 8\n  beta: 1.0\n  u: -0.5\n  stabilization: svd\n  discretization: continuous\n  order: symmetric\n  site_flips: 2\nsweeps: 1\n";
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        let p = &config.simulation;
        assert_eq!(p.stabilization, StabilizationScheme::Svd);
        assert_eq!(p.discretization, TimeDiscretization::Continuous);
        assert_eq!(p.order, PropagatorOrder::Symmetric);
        assert_eq!(p.site_flips, 2);
        assert_relative_eq!(p.vertex_magnitude().unwrap(), 0.5f64.sqrt(), epsilon = 1e-15);
        assert!(p.validate().is_ok());

        let mut strong = p.clone();
        strong.u = -1.5;
        assert!(matches!(strong.validate(), Err(DqmcError::InvalidParameters { name: "u", .. })));
        assert_eq!(Parameters::new([1, 1, 1], 1, 1.0, 0.0).stabilization, StabilizationScheme::Qr);
    }

    #[test]
    fn block_length_is_clamped() {
        let mut p = Parameters::new([2, 1, 1], 10, 1.0, -1.0);
        p.slices_per_block = 25;
        assert_eq!(p.block_length(), 10);
        p.slices_per_block = 3;
        assert_eq!(p.block_length(), 3);
    }
}
