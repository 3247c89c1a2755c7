//! Dense imaginary-time slices built from interaction and kinetic factors.
//!
//! One time step is B_t = L·D_t·R with D_t = diag((1 + σ_t)·exp(-dt·p)). The
//! kinetic factors L and R depend on [`PropagatorOrder`]. No stabilization
//! happens here; long products are handled by the stabilization module.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::spectral::{SpectralPropagator, TimeDirection};
use crate::field::{FieldConfiguration, Staleness};
use crate::io::Coupling;
use crate::lattice::LatticeGeometry;

/// Placement of the kinetic factor inside one time step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropagatorOrder {
    /// B = exp(-dt·H₀)·D
    #[default]
    KineticLast,
    /// B = D·exp(-dt·H₀)
    KineticFirst,
    /// B = exp(-dt·H₀/2)·D·exp(-dt·H₀/2)
    Symmetric,
}

/// Builds forward and inverse products of time steps.
#[derive(Debug, Clone)]
pub struct SliceAccumulator {
    order: PropagatorOrder,
    left: Option<SpectralPropagator>,
    right: Option<SpectralPropagator>,
    /// exp(-dt·p) per site.
    potential_decay: DVector<f64>,
    inverse_norm: f64,
    volume: usize,
}

impl SliceAccumulator {
    pub fn new(geometry: &LatticeGeometry, coupling: &Coupling, order: PropagatorOrder) -> Self {
        let dt = coupling.dt;
        let (left, right) = match order {
            PropagatorOrder::KineticLast => (Some(SpectralPropagator::new(geometry, dt)), None),
            PropagatorOrder::KineticFirst => (None, Some(SpectralPropagator::new(geometry, dt))),
            PropagatorOrder::Symmetric => {
                let half = SpectralPropagator::new(geometry, 0.5 * dt);
                (Some(half.clone()), Some(half))
            }
        };
        Self {
            order,
            left,
            right,
            potential_decay: geometry.potential().map(|p| (-dt * p).exp()),
            inverse_norm: coupling.inverse_norm(),
            volume: geometry.volume(),
        }
    }

    pub fn order(&self) -> PropagatorOrder {
        self.order
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    /// Diagonal entry of D_t at `site` for field value `sigma`.
    pub fn interaction(&self, sigma: f64, site: usize) -> f64 {
        (1.0 + sigma) * self.potential_decay[site]
    }

    /// Change of D_t at `site` when its field `sigma` is negated.
    pub fn flip_delta(&self, sigma: f64, site: usize) -> f64 {
        -2.0 * sigma * self.potential_decay[site]
    }

    fn inverse_interaction(&self, sigma: f64, site: usize) -> f64 {
        (1.0 - sigma) / (self.potential_decay[site] * self.inverse_norm)
    }

    /// B_{end-1}···B_start.
    pub fn forward(&self, fields: &FieldConfiguration, start: usize, end: usize) -> DMatrix<f64> {
        let mut m = DMatrix::identity(self.volume, self.volume);
        for t in start..end {
            if let Some(right) = &self.right {
                right.apply_columns(&mut m, TimeDirection::Forward);
            }
            for (x, &sigma) in fields.slice(t).iter().enumerate() {
                m.row_mut(x).scale_mut(self.interaction(sigma, x));
            }
            if let Some(left) = &self.left {
                left.apply_columns(&mut m, TimeDirection::Forward);
            }
        }
        m
    }

    /// (B_{end-1}···B_start)⁻¹, composed without a matrix inversion.
    pub fn backward(&self, fields: &FieldConfiguration, start: usize, end: usize) -> DMatrix<f64> {
        let mut m = DMatrix::identity(self.volume, self.volume);
        for t in start..end {
            if let Some(right) = &self.right {
                right.apply_rows(&mut m, TimeDirection::Backward);
            }
            for (x, &sigma) in fields.slice(t).iter().enumerate() {
                m.column_mut(x).scale_mut(self.inverse_interaction(sigma, x));
            }
            if let Some(left) = &self.left {
                left.apply_rows(&mut m, TimeDirection::Backward);
            }
        }
        m
    }

    /// vector ← B_{end-1}···B_start·vector
    pub fn push_forward(&self, fields: &FieldConfiguration, vector: &mut DVector<f64>, start: usize, end: usize) {
        for t in start..end {
            self.apply_right(vector);
            for (x, &sigma) in fields.slice(t).iter().enumerate() {
                vector[x] *= self.interaction(sigma, x);
            }
            self.apply_left(vector);
        }
    }

    /// vector ← (B_{end-1}···B_start)ᵗ·vector, i.e. Bᵗ = R·D·L applied from `end-1` down.
    pub fn push_transposed(&self, fields: &FieldConfiguration, vector: &mut DVector<f64>, start: usize, end: usize) {
        for t in (start..end).rev() {
            self.apply_left(vector);
            for (x, &sigma) in fields.slice(t).iter().enumerate() {
                vector[x] *= self.interaction(sigma, x);
            }
            self.apply_right(vector);
        }
    }

    pub fn apply_left(&self, vector: &mut DVector<f64>) {
        if let Some(left) = &self.left {
            left.apply_vector(vector, TimeDirection::Forward);
        }
    }

    pub fn apply_right(&self, vector: &mut DVector<f64>) {
        if let Some(right) = &self.right {
            right.apply_vector(vector, TimeDirection::Forward);
        }
    }
}

/// Cached product over logical times `start..end`.
#[derive(Debug, Clone)]
pub struct Slice {
    pub start: usize,
    pub end: usize,
    pub matrix: DMatrix<f64>,
    valid: bool,
}

impl Slice {
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Slices covering `0..N` in blocks of `block` time steps.
#[derive(Debug, Clone)]
pub struct SliceCache {
    block: usize,
    slices: Vec<Slice>,
}

impl SliceCache {
    pub fn new(time_slices: usize, block: usize, volume: usize) -> Self {
        let block = block.clamp(1, time_slices.max(1));
        let slices = (0..time_slices)
            .step_by(block)
            .map(|start| Slice {
                start,
                end: (start + block).min(time_slices),
                matrix: DMatrix::identity(volume, volume),
                valid: false,
            })
            .collect();
        Self { block, slices }
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Index of the slice containing logical time `t`.
    pub fn slice_of(&self, t: usize) -> usize {
        t / self.block
    }

    pub fn get(&self, index: usize) -> &Slice {
        &self.slices[index]
    }

    pub fn is_valid(&self) -> bool {
        self.slices.iter().all(|s| s.valid)
    }

    /// Slices for consumers that require the cache to be current.
    pub fn slices(&self) -> &[Slice] {
        debug_assert!(self.is_valid(), "consulting a stale slice cache");
        &self.slices
    }

    pub fn invalidate(&mut self, staleness: Staleness) {
        match staleness {
            Staleness::None => {}
            Staleness::All => self.slices.iter_mut().for_each(|s| s.valid = false),
            Staleness::Times { start, end } => {
                for s in self.slices.iter_mut().filter(|s| s.start < end && start < s.end) {
                    s.valid = false;
                }
            }
        }
    }

    /// Recomputes every stale slice from the fields; returns how many were rebuilt.
    pub fn refresh(&mut self, accumulator: &SliceAccumulator, fields: &FieldConfiguration) -> usize {
        let mut rebuilt = 0;
        for s in self.slices.iter_mut().filter(|s| !s.valid) {
            s.matrix = accumulator.forward(fields, s.start, s.end);
            s.valid = true;
            rebuilt += 1;
        }
        rebuilt
    }

    /// Folds an exact low-rank change `Σ u_k·v_kᵗ` into the slice made stale by a flip.
    pub fn patch(&mut self, staleness: Staleness, columns: &[DVector<f64>], rows: &[DVector<f64>]) {
        let Staleness::Times { start, end } = staleness else {
            panic!("only a single-time flip can be patched, got {staleness:?}");
        };
        let index = self.slice_of(start);
        let slice = &mut self.slices[index];
        debug_assert!(end <= slice.end, "flip range crosses a slice boundary");
        debug_assert!(slice.valid, "patching a stale slice");
        for (u, v) in columns.iter().zip(rows.iter()) {
            slice.matrix.ger(1.0, u, v, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Parameters;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn setup(order: PropagatorOrder) -> (SliceAccumulator, FieldConfiguration) {
        let mut p = Parameters::new([3, 2, 1], 6, 1.5, -3.0);
        p.h = 0.3;
        let geometry = LatticeGeometry::new(p.extents(), p.hoppings(), p.h).unwrap();
        let coupling = p.coupling().unwrap();
        let mut rng = Pcg64::seed_from_u64(11);
        let fields = FieldConfiguration::initialize(6, 6, coupling.a, 0.5, &mut rng).unwrap();
        (SliceAccumulator::new(&geometry, &coupling, order), fields)
    }

    #[test]
    fn backward_inverts_forward() {
        for order in [PropagatorOrder::KineticLast, PropagatorOrder::KineticFirst, PropagatorOrder::Symmetric] {
            let (acc, fields) = setup(order);
            let product = acc.forward(&fields, 1, 5) * acc.backward(&fields, 1, 5);
            assert_relative_eq!(product, DMatrix::identity(6, 6), epsilon = 1e-10);
        }
    }

    #[test]
    fn forward_composes_over_ranges() {
        let (acc, fields) = setup(PropagatorOrder::KineticLast);
        let whole = acc.forward(&fields, 0, 6);
        let split = acc.forward(&fields, 4, 6) * acc.forward(&fields, 0, 4);
        assert_relative_eq!(whole, split, epsilon = 1e-12);
    }

    #[test]
    fn vector_pushes_match_dense_slices() {
        for order in [PropagatorOrder::KineticLast, PropagatorOrder::Symmetric] {
            let (acc, fields) = setup(order);
            let v = DVector::from_fn(6, |i, _| 0.5 + i as f64);
            let mut pushed = v.clone();
            acc.push_forward(&fields, &mut pushed, 2, 5);
            assert_relative_eq!(pushed, acc.forward(&fields, 2, 5) * &v, epsilon = 1e-12);
            let mut transposed = v.clone();
            acc.push_transposed(&fields, &mut transposed, 2, 5);
            assert_relative_eq!(transposed, acc.forward(&fields, 2, 5).transpose() * &v, epsilon = 1e-12);
        }
    }

    #[test]
    fn flip_patch_is_exact() {
        let (acc, mut fields) = setup(PropagatorOrder::KineticFirst);
        let mut cache = SliceCache::new(6, 3, 6);
        cache.refresh(&acc, &fields);
        let (t, x) = (1, 4);
        let sigma = fields.get(t as isize, x);

        // u = B_2·L·δe_x, v = (R·B_0)ᵗ e_x within the window 0..3
        let mut u = DVector::zeros(6);
        u[x] = acc.flip_delta(sigma, x);
        acc.apply_left(&mut u);
        acc.push_forward(&fields, &mut u, t + 1, 3);
        let mut v = DVector::zeros(6);
        v[x] = 1.0;
        acc.apply_right(&mut v);
        acc.push_transposed(&fields, &mut v, 0, t);

        let stale = fields.flip(t as isize, x);
        cache.patch(stale, &[u], &[v]);
        assert_relative_eq!(cache.get(0).matrix, acc.forward(&fields, 0, 3), epsilon = 1e-12);
    }

    #[test]
    fn invalidation_tracks_ranges() {
        let (acc, mut fields) = setup(PropagatorOrder::KineticLast);
        let mut cache = SliceCache::new(6, 4, 6);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1).end, 6);
        assert_eq!(cache.refresh(&acc, &fields), 2);
        cache.invalidate(fields.flip(5, 0));
        assert!(cache.get(0).is_valid());
        assert!(!cache.get(1).is_valid());
        assert_eq!(cache.refresh(&acc, &fields), 1);
        cache.invalidate(fields.shift_origin(2));
        assert!(!cache.is_valid());
    }
}
