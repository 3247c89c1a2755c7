//! Kinetic propagator exp(∓τ·H₀) applied through the lattice Fourier transform.
//!
//! H₀ is diagonal in momentum space, so one application is a forward FFT, a
//! per-mode multiplication and an inverse FFT. rustfft leaves the round trip
//! scaled by the number of modes, which is divided out here.

use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::lattice::LatticeGeometry;

/// Direction of imaginary-time evolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDirection {
    /// exp(-τ·H₀)
    Forward,
    /// exp(+τ·H₀)
    Backward,
}

#[derive(Clone)]
struct AxisPlan {
    length: usize,
    stride: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

/// exp(∓τ·H₀) for a fixed imaginary-time step τ.
#[derive(Clone)]
pub struct SpectralPropagator {
    tau: f64,
    volume: usize,
    axes: Vec<AxisPlan>,
    decay: DVector<f64>,
    growth: DVector<f64>,
    dispersion: DVector<f64>,
}

impl fmt::Debug for SpectralPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralPropagator")
            .field("tau", &self.tau)
            .field("volume", &self.volume)
            .field("axes", &self.axes.iter().map(|a| a.length).collect::<Vec<_>>())
            .finish()
    }
}

impl SpectralPropagator {
    pub fn new(geometry: &LatticeGeometry, tau: f64) -> Self {
        let [lx, ly, lz] = geometry.extents();
        let mut planner = FftPlanner::new();
        let axes = [(lx, ly * lz), (ly, lz), (lz, 1)]
            .into_iter()
            .filter(|&(length, _)| length > 1)
            .map(|(length, stride)| AxisPlan {
                length,
                stride,
                forward: planner.plan_fft_forward(length),
                inverse: planner.plan_fft_inverse(length),
            })
            .collect();

        let dispersion = geometry.dispersion().clone();
        Self {
            tau,
            volume: geometry.volume(),
            axes,
            decay: dispersion.map(|e| (-tau * e).exp()),
            growth: dispersion.map(|e| (tau * e).exp()),
            dispersion,
        }
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    fn factors(&self, direction: TimeDirection) -> &DVector<f64> {
        match direction {
            TimeDirection::Forward => &self.decay,
            TimeDirection::Backward => &self.growth,
        }
    }

    /// Multi-dimensional FFT, one axis at a time.
    fn transform(&self, data: &mut [Complex64], inverse: bool) {
        let mut line = Vec::new();
        for axis in &self.axes {
            let plan = if inverse { &axis.inverse } else { &axis.forward };
            line.resize(axis.length, Complex64::new(0.0, 0.0));
            for base in 0..self.volume {
                if (base / axis.stride) % axis.length != 0 {
                    continue;
                }
                for (k, c) in line.iter_mut().enumerate() {
                    *c = data[base + k * axis.stride];
                }
                plan.process(&mut line);
                for (k, c) in line.iter().enumerate() {
                    data[base + k * axis.stride] = *c;
                }
            }
        }
    }

    /// Spectral multiply of a complex buffer by the per-mode `factors`.
    fn apply_factors(&self, data: &mut [Complex64], factors: &DVector<f64>) {
        self.transform(data, false);
        for (c, &f) in data.iter_mut().zip(factors.iter()) {
            *c *= f;
        }
        self.transform(data, true);
        let norm = self.volume as f64;
        for c in data.iter_mut() {
            *c /= norm;
        }
    }

    pub fn apply_complex(&self, data: &mut [Complex64], direction: TimeDirection) {
        debug_assert_eq!(data.len(), self.volume);
        self.apply_factors(data, self.factors(direction));
    }

    fn apply_real(&self, values: &mut [f64], buffer: &mut Vec<Complex64>, factors: &DVector<f64>) {
        buffer.clear();
        buffer.extend(values.iter().map(|&v| Complex64::new(v, 0.0)));
        self.apply_factors(buffer, factors);
        // ε(k) = ε(-k), so the imaginary part is round-off.
        for (v, c) in values.iter_mut().zip(buffer.iter()) {
            *v = c.re;
        }
    }

    pub fn apply_vector(&self, vector: &mut DVector<f64>, direction: TimeDirection) {
        let mut buffer = Vec::with_capacity(self.volume);
        self.apply_real(vector.as_mut_slice(), &mut buffer, self.factors(direction));
    }

    /// matrix ← exp(∓τ·H₀)·matrix
    pub fn apply_columns(&self, matrix: &mut DMatrix<f64>, direction: TimeDirection) {
        self.map_columns(matrix, self.factors(direction));
    }

    /// matrix ← matrix·exp(∓τ·H₀)
    pub fn apply_rows(&self, matrix: &mut DMatrix<f64>, direction: TimeDirection) {
        // H₀ is symmetric: (M·E)ᵗ = E·Mᵗ.
        let mut transposed = matrix.transpose();
        self.map_columns(&mut transposed, self.factors(direction));
        *matrix = transposed.transpose();
    }

    /// matrix ← exp(-τ·H₀)·matrix for an arbitrary τ, reusing this propagator's plans.
    pub fn evolve_columns(&self, matrix: &mut DMatrix<f64>, tau: f64) {
        let factors = self.dispersion.map(|e| (-tau * e).exp());
        self.map_columns(matrix, &factors);
    }

    /// H₀·matrix, used for kinetic-energy measurements.
    pub fn apply_dispersion(&self, matrix: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = matrix.clone();
        self.map_columns(&mut out, &self.dispersion);
        out
    }

    fn map_columns(&self, matrix: &mut DMatrix<f64>, factors: &DVector<f64>) {
        debug_assert_eq!(matrix.nrows(), self.volume);
        let mut buffer = Vec::with_capacity(self.volume);
        for mut column in matrix.column_iter_mut() {
            self.apply_real(column.as_mut_slice(), &mut buffer, factors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Dense reference exp(-τ·H₀) from the real-space hopping matrix.
    fn dense_kinetic(geometry: &LatticeGeometry) -> DMatrix<f64> {
        let v = geometry.volume();
        let t = geometry.hoppings();
        let mut h = DMatrix::zeros(v, v);
        for site in 0..v {
            for (d, axis) in [crate::lattice::Axis::X, crate::lattice::Axis::Y, crate::lattice::Axis::Z]
                .into_iter()
                .enumerate()
            {
                if t[d] == 0.0 {
                    continue;
                }
                h[(geometry.shift(site, axis, 1), site)] -= t[d];
                h[(geometry.shift(site, axis, -1), site)] -= t[d];
            }
        }
        h
    }

    #[test]
    fn dispersion_matches_real_space_hamiltonian() {
        let g = LatticeGeometry::new([4, 3, 1], [1.0, 0.7, 0.0], 0.0).unwrap();
        let p = SpectralPropagator::new(&g, 0.1);
        let identity = DMatrix::identity(g.volume(), g.volume());
        let h = p.apply_dispersion(&identity);
        assert_relative_eq!(h, dense_kinetic(&g), epsilon = 1e-12);
    }

    #[test]
    fn forward_then_backward_is_identity() {
        let g = LatticeGeometry::new([4, 2, 3], [1.0, 0.5, 0.3], 0.0).unwrap();
        let p = SpectralPropagator::new(&g, 0.25);
        let original = DMatrix::<f64>::new_random(g.volume(), 5);
        let mut m = original.clone();
        p.apply_columns(&mut m, TimeDirection::Forward);
        p.apply_columns(&mut m, TimeDirection::Backward);
        assert_relative_eq!(m, original, epsilon = 1e-12);
    }

    #[test]
    fn row_form_is_right_multiplication() {
        let g = LatticeGeometry::new([3, 3, 1], [1.0, 1.0, 0.0], 0.0).unwrap();
        let p = SpectralPropagator::new(&g, 0.2);
        let v = g.volume();
        let mut e = DMatrix::identity(v, v);
        p.apply_columns(&mut e, TimeDirection::Forward);
        let m = DMatrix::<f64>::new_random(4, v);
        let mut rows = m.clone();
        p.apply_rows(&mut rows, TimeDirection::Forward);
        assert_relative_eq!(rows, &m * &e, epsilon = 1e-12);
    }

    #[test]
    fn arbitrary_step_matches_a_dedicated_propagator() {
        let g = LatticeGeometry::new([4, 3, 1], [1.0, 0.6, 0.0], 0.0).unwrap();
        let unit = SpectralPropagator::new(&g, 0.0);
        let fixed = SpectralPropagator::new(&g, 0.37);
        let mut evolved = DMatrix::identity(g.volume(), g.volume());
        let mut reference = evolved.clone();
        unit.evolve_columns(&mut evolved, 0.37);
        fixed.apply_columns(&mut reference, TimeDirection::Forward);
        assert_relative_eq!(evolved, reference, epsilon = 1e-12);
    }

    #[test]
    fn vector_and_column_forms_agree() {
        let g = LatticeGeometry::new([6, 1, 1], [1.0, 0.0, 0.0], 0.0).unwrap();
        let p = SpectralPropagator::new(&g, 0.3);
        let mut v = DVector::from_fn(6, |i, _| i as f64 - 2.0);
        let mut m = DMatrix::from_column_slice(6, 1, v.as_slice());
        p.apply_vector(&mut v, TimeDirection::Backward);
        p.apply_columns(&mut m, TimeDirection::Backward);
        assert_relative_eq!(v, m.column(0).into_owned(), epsilon = 1e-12);
    }

    #[test]
    fn uniform_vector_decays_with_band_bottom() {
        let g = LatticeGeometry::new([4, 4, 1], [1.0, 1.0, 0.0], 0.0).unwrap();
        let p = SpectralPropagator::new(&g, 0.5);
        let mut v = DVector::from_element(16, 1.0);
        p.apply_vector(&mut v, TimeDirection::Forward);
        for x in v.iter() {
            assert_relative_eq!(*x, (0.5f64 * 4.0).exp(), epsilon = 1e-12);
        }
    }
}
