//! Equal-time and time-displaced observables from the stabilized factorization.
//!
//! The up species is measured directly, ρ↑ = I - (I + λ↑M)⁻¹. The down
//! species is carried in its particle-hole transformed representation,
//! ρ↓ = (I + λ↓M)⁻¹, which is what turns the attractive model with field B
//! into the repulsive model at chemical potential B/2.

use nalgebra::DMatrix;

use crate::io::Parameters;
use crate::lattice::{Axis, LatticeGeometry};
use crate::propagator::SpectralPropagator;
use crate::stabilization::{Species, StabilizedFactorization};

/// One measurement of every observable, already multiplied by the sign
/// where the estimator requires it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableSample {
    pub sign: f64,
    pub density: f64,
    pub magnetization: f64,
    pub kinetic: f64,
    pub interaction: f64,
    pub order_parameter: f64,
    pub chi_af: f64,
    pub chi_d: f64,
    /// Spin-spin correlation at x-distance `k + 1`.
    pub spin_correlation: Vec<f64>,
    pub site_density_up: Vec<f64>,
    pub site_density_dn: Vec<f64>,
    /// Present only when a staggered field is applied.
    pub staggered_magnetization: Option<f64>,
}

impl ObservableSample {
    /// Flat list of named scalars for accumulation and reporting.
    pub fn named_values(&self) -> Vec<(String, f64)> {
        let mut values = vec![
            ("sign".to_string(), self.sign),
            ("density".to_string(), self.density),
            ("magnetization".to_string(), self.magnetization),
            ("kinetic".to_string(), self.kinetic),
            ("interaction".to_string(), self.interaction),
            ("order_parameter".to_string(), self.order_parameter),
            ("chi_af".to_string(), self.chi_af),
            ("chi_d".to_string(), self.chi_d),
        ];
        for (k, &c) in self.spin_correlation.iter().enumerate() {
            values.push((format!("spin_correlation_{}", k + 1), c));
        }
        for (i, (&up, &dn)) in self.site_density_up.iter().zip(&self.site_density_dn).enumerate() {
            values.push((format!("density_up_{i}"), up));
            values.push((format!("density_dn_{i}"), dn));
        }
        if let Some(m) = self.staggered_magnetization {
            values.push(("staggered_magnetization".to_string(), m));
        }
        values
    }
}

/// Propagators from time 0 to `tau` for both species.
///
/// `up` is B(τ)·e^{τ(μ+B/2)}·(I + λ↑M)⁻¹, which at τ = β is the up Green's
/// function. `down` starts from I - (I + λ↓M)⁻¹ in the particle-hole
/// transformed representation.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeDisplacedGreens {
    pub tau: f64,
    pub up: DMatrix<f64>,
    pub down: DMatrix<f64>,
}

/// Turns a rebuilt factorization into an [`ObservableSample`].
#[derive(Debug, Clone)]
pub struct ObservableExtractor {
    geometry: LatticeGeometry,
    kinetic: SpectralPropagator,
    beta: f64,
    g: f64,
    mu: f64,
    b: f64,
    h: f64,
}

impl ObservableExtractor {
    pub fn new(geometry: &LatticeGeometry, parameters: &Parameters) -> Self {
        Self {
            geometry: geometry.clone(),
            kinetic: SpectralPropagator::new(geometry, 0.0),
            beta: parameters.beta,
            g: -parameters.u,
            mu: parameters.mu,
            b: parameters.b,
            h: parameters.h,
        }
    }

    /// tr(H₀·ρ)/V
    fn kinetic_energy(&self, rho: &DMatrix<f64>) -> f64 {
        self.kinetic.apply_dispersion(rho).trace() / self.geometry.volume() as f64
    }

    /// d-wave pair correlation between two time-displaced propagators.
    fn pair_correlation(&self, up: &DMatrix<f64>, dn: &DMatrix<f64>) -> f64 {
        let v = self.geometry.volume();
        let g = &self.geometry;
        // (axis, step) offsets with their d-wave form factor.
        let bonds = [(Axis::X, 1, 1.0), (Axis::X, -1, 1.0), (Axis::Y, 1, -1.0), (Axis::Y, -1, -1.0)];
        let mut total = 0.0;
        for x in 0..v {
            for y in 0..v {
                let mut d = 0.0;
                for &(axis_y, step_y, form_y) in &bonds {
                    let y_shifted = g.shift(y, axis_y, step_y);
                    for &(axis_x, step_x, form_x) in &bonds {
                        d += form_x * form_y * dn[(g.shift(x, axis_x, step_x), y_shifted)];
                    }
                }
                total += up[(x, y)] * d;
            }
        }
        total / (v * v) as f64
    }

    /// Walks the resolvents through `steps`, given as (propagator, duration)
    /// pairs in time order, and returns one entry per step.
    pub fn time_displaced_greens<'a>(
        &self,
        factorization: &StabilizedFactorization,
        steps: impl IntoIterator<Item = (&'a DMatrix<f64>, f64)>,
    ) -> Vec<TimeDisplacedGreens> {
        let v = self.geometry.volume();
        let mut up = factorization.resolvent(Species::Up).clone();
        let mut down = DMatrix::<f64>::identity(v, v) - factorization.resolvent(Species::Down);
        let mut tau = 0.0;
        steps
            .into_iter()
            .map(|(step, duration)| {
                tau += duration;
                up = step * &up * (duration * (0.5 * self.b + self.mu)).exp();
                down = step * &down * (duration * (-0.5 * self.b + self.mu)).exp();
                TimeDisplacedGreens { tau, up: up.clone(), down: down.clone() }
            })
            .collect()
    }

    /// Measures everything from a rebuilt factorization and the propagators
    /// it was built from, as (propagator, duration) pairs in time order.
    pub fn extract<'a>(
        &self,
        factorization: &StabilizedFactorization,
        steps: impl IntoIterator<Item = (&'a DMatrix<f64>, f64)>,
    ) -> ObservableSample {
        let v = self.geometry.volume();
        let volume = v as f64;
        let s = factorization.sign();
        let identity = DMatrix::<f64>::identity(v, v);
        let rho_up = &identity - factorization.resolvent(Species::Up);
        let rho_dn = factorization.resolvent(Species::Down).clone();

        let diag_up = rho_up.diagonal();
        let diag_dn = rho_dn.diagonal();
        let n_up = diag_up.sum();
        let n_dn = diag_dn.sum();
        let local_moment = &diag_up - &diag_dn;
        let staggered = local_moment.dot(self.geometry.staggering()) / volume;

        let mut previous = 0.0;
        let chi_d: f64 = self
            .time_displaced_greens(factorization, steps)
            .iter()
            .map(|g| {
                let duration = g.tau - previous;
                previous = g.tau;
                duration * self.pair_correlation(&g.up, &g.down)
            })
            .sum();

        let lx = self.geometry.extent(Axis::X);
        let spin_correlation = (1..=lx / 2)
            .map(|k| {
                let mut ssz = 0.0;
                for x in 0..v {
                    let y = self.geometry.shift(x, Axis::X, k as isize);
                    ssz += rho_up[(x, x)] * rho_up[(y, y)] + rho_dn[(x, x)] * rho_dn[(y, y)];
                    ssz -= rho_up[(x, x)] * rho_dn[(y, y)] + rho_dn[(x, x)] * rho_up[(y, y)];
                    ssz -= rho_up[(x, y)] * rho_up[(y, x)] + rho_dn[(x, y)] * rho_dn[(y, x)];
                }
                0.25 * s * ssz
            })
            .collect();

        ObservableSample {
            sign: s,
            density: s * (n_up + n_dn) / volume,
            magnetization: s * (n_up - n_dn) / (2.0 * volume),
            kinetic: s * (self.kinetic_energy(&rho_up) - self.kinetic_energy(&rho_dn)),
            interaction: s * self.g * diag_up.component_mul(&diag_dn).sum(),
            order_parameter: local_moment.norm_squared(),
            chi_af: s * self.beta * staggered * staggered,
            chi_d: s * chi_d,
            spin_correlation,
            site_density_up: diag_up.iter().map(|d| s * d).collect(),
            site_density_dn: diag_dn.iter().map(|d| s * d).collect(),
            staggered_magnetization: (self.h != 0.0).then_some(s * staggered),
        }
    }
}
