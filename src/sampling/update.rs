//! Low-rank determinant updates for field flips.
//!
//! All flips happen inside the first slice window `[start, end)`. Flipping
//! the fields of sites `x_k` at time `t` changes that slice S₀ by exactly
//! `Σ u_k·v_kᵗ`, so the full product becomes M·(I + U_b·V_bᵗ) with the
//! columns of U_b expressed against S₀ at the last rebuild. The weight
//! ratio per species is then the small determinant det(I + V_bᵗ·G·U_b).

use std::ops::Range;

use log::trace;
use nalgebra::{DMatrix, DVector};

use crate::field::FieldConfiguration;
use crate::propagator::{SliceAccumulator, SliceCache};
use crate::stabilization::{Species, StabilizedFactorization};

/// Accepted low-rank changes not yet folded into the factorization.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    capacity: usize,
    /// S₀⁻¹·u per accepted flip.
    columns: Vec<DVector<f64>>,
    /// v per accepted flip.
    rows: Vec<DVector<f64>>,
    log_weight: f64,
    sign: f64,
}

impl UpdateBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            columns: Vec::with_capacity(capacity),
            rows: Vec::with_capacity(capacity),
            log_weight: 0.0,
            sign: 1.0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Whether `k` more columns fit.
    pub fn has_room(&self, k: usize) -> bool {
        self.len() + k <= self.capacity
    }

    /// Log-weight change relative to the cached factorization.
    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    /// Sign change relative to the cached factorization.
    pub fn sign(&self) -> f64 {
        self.sign
    }

    pub fn clear(&mut self) {
        self.columns.clear();
        self.rows.clear();
        self.log_weight = 0.0;
        self.sign = 1.0;
    }
}

/// A flip of one or several fields at one time, with its weight change.
#[derive(Debug, Clone)]
pub struct Proposal {
    time: usize,
    sites: Vec<usize>,
    /// Slice changes `u_k`.
    updates: Vec<DVector<f64>>,
    /// Slice changes `v_k`.
    rows: Vec<DVector<f64>>,
    /// `S₀⁻¹·u_k`.
    columns: Vec<DVector<f64>>,
    /// Cumulative log|ratio| of batch and proposal against the cached factorization.
    pub log_weight: f64,
    /// Cumulative sign of batch and proposal.
    pub sign: f64,
}

impl Proposal {
    pub fn time(&self) -> usize {
        self.time
    }

    pub fn sites(&self) -> &[usize] {
        &self.sites
    }

    /// Change of the log-weight relative to the current state; the Metropolis exponent.
    pub fn delta(&self, batch: &UpdateBatch) -> f64 {
        self.log_weight - batch.log_weight
    }

    pub fn rank(&self) -> usize {
        self.sites.len()
    }
}

/// Proposes and applies low-rank field flips against a cached factorization.
#[derive(Debug, Clone)]
pub struct DeterminantUpdateEngine {
    batch: UpdateBatch,
    window: Range<usize>,
    /// S₀⁻¹ at the last rebuild.
    slice_inverse: DMatrix<f64>,
}

impl DeterminantUpdateEngine {
    pub fn new(volume: usize, capacity: usize) -> Self {
        Self {
            batch: UpdateBatch::new(capacity),
            window: 0..0,
            slice_inverse: DMatrix::identity(volume, volume),
        }
    }

    /// Re-anchors on a freshly rebuilt factorization: empties the batch and
    /// recomputes S₀⁻¹ from the fields.
    pub fn reset(&mut self, accumulator: &SliceAccumulator, fields: &FieldConfiguration, cache: &SliceCache) {
        let first = cache.get(0);
        self.window = first.start..first.end;
        self.slice_inverse = accumulator.backward(fields, first.start, first.end);
        self.batch.clear();
    }

    pub fn batch(&self) -> &UpdateBatch {
        &self.batch
    }

    /// Logical times that may be flipped.
    pub fn window(&self) -> Range<usize> {
        self.window.clone()
    }

    /// The pair (u, v) with ΔS₀ = u·vᵗ for negating the field at (t, x).
    pub fn compute_uv(
        &self,
        accumulator: &SliceAccumulator,
        fields: &FieldConfiguration,
        time: usize,
        site: usize,
    ) -> (DVector<f64>, DVector<f64>) {
        let volume = accumulator.volume();
        let sigma = fields.get(time as isize, site);

        let mut u = DVector::zeros(volume);
        u[site] = accumulator.flip_delta(sigma, site);
        accumulator.apply_left(&mut u);
        accumulator.push_forward(fields, &mut u, time + 1, self.window.end);

        let mut v = DVector::zeros(volume);
        v[site] = 1.0;
        accumulator.apply_right(&mut v);
        accumulator.push_transposed(fields, &mut v, self.window.start, time);
        (u, v)
    }

    /// Weight change for negating the fields of `sites` at `time`.
    ///
    /// The sites must be distinct; their slice changes then add up exactly.
    pub fn propose(
        &self,
        accumulator: &SliceAccumulator,
        fields: &FieldConfiguration,
        factorization: &StabilizedFactorization,
        time: usize,
        sites: Vec<usize>,
    ) -> Proposal {
        debug_assert!(self.window.contains(&time), "flip at t={time} outside window {:?}", self.window);
        let mut updates = Vec::with_capacity(sites.len());
        let mut rows = Vec::with_capacity(sites.len());
        let mut columns = Vec::with_capacity(sites.len());
        for &site in &sites {
            let (u, v) = self.compute_uv(accumulator, fields, time, site);
            columns.push(&self.slice_inverse * &u);
            updates.push(u);
            rows.push(v);
        }

        let volume = accumulator.volume();
        let all_columns: Vec<&DVector<f64>> = self.batch.columns.iter().chain(columns.iter()).collect();
        let all_rows: Vec<&DVector<f64>> = self.batch.rows.iter().chain(rows.iter()).collect();
        let rank = all_columns.len();
        let left = DMatrix::from_fn(rank, volume, |i, j| all_rows[i][j]);
        let right = DMatrix::from_fn(volume, rank, |i, j| all_columns[j][i]);

        let mut log_weight = 0.0;
        let mut sign = 1.0;
        for species in Species::BOTH {
            let det = bordered_determinant(factorization, species, &left, &right);
            log_weight += det.abs().ln();
            sign *= if det < 0.0 { -1.0 } else { 1.0 };
        }
        trace!("proposal t={time} sites={sites:?} log-weight {log_weight}");
        Proposal {
            time,
            sites,
            updates,
            rows,
            columns,
            log_weight,
            sign,
        }
    }

    /// Applies an accepted proposal to the fields, slice 0 and the batch.
    pub fn accept(&mut self, proposal: Proposal, fields: &mut FieldConfiguration, cache: &mut SliceCache) {
        let staleness = fields.flip_many(proposal.time as isize, &proposal.sites);
        cache.patch(staleness, &proposal.updates, &proposal.rows);
        self.batch.columns.extend(proposal.columns);
        self.batch.rows.extend(proposal.rows);
        self.batch.log_weight = proposal.log_weight;
        self.batch.sign = proposal.sign;
    }
}

/// det(I + V_bᵗ·G·U_b) for the Green's function of `species`.
fn bordered_determinant(
    factorization: &StabilizedFactorization,
    species: Species,
    left: &DMatrix<f64>,
    right: &DMatrix<f64>,
) -> f64 {
    let k = right.ncols();
    let small = DMatrix::identity(k, k) + left * factorization.greens(species) * right;
    small.lu().determinant()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Parameters;
    use crate::lattice::LatticeGeometry;
    use crate::propagator::PropagatorOrder;
    use crate::stabilization::StabilizationScheme;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    struct Fixture {
        acc: SliceAccumulator,
        fields: FieldConfiguration,
        cache: SliceCache,
        factorization: StabilizedFactorization,
        engine: DeterminantUpdateEngine,
    }

    fn fixture(order: PropagatorOrder) -> Fixture {
        let mut p = Parameters::new([2, 2, 1], 8, 1.0, -3.0);
        p.mu = 0.2;
        p.b = 0.4;
        p.slices_per_block = 4;
        let geometry = LatticeGeometry::new(p.extents(), p.hoppings(), 0.2).unwrap();
        let coupling = p.coupling().unwrap();
        let acc = SliceAccumulator::new(&geometry, &coupling, order);
        let mut rng = Pcg64::seed_from_u64(3);
        let fields = FieldConfiguration::initialize(8, 4, coupling.a, 0.5, &mut rng).unwrap();
        let mut cache = SliceCache::new(8, 4, 4);
        cache.refresh(&acc, &fields);
        let mut factorization = StabilizedFactorization::new(4, p.fugacities(), StabilizationScheme::Qr, 1, false);
        factorization.rebuild(&cache).unwrap();
        let mut engine = DeterminantUpdateEngine::new(4, 4);
        engine.reset(&acc, &fields, &cache);
        Fixture { acc, fields, cache, factorization, engine }
    }

    fn rebuilt_log_weight(f: &Fixture) -> (f64, f64) {
        let mut cache = SliceCache::new(8, 4, 4);
        cache.refresh(&f.acc, &f.fields);
        let mut fresh = f.factorization.clone();
        let summary = fresh.rebuild(&cache).unwrap();
        (summary.log_weight, summary.sign)
    }

    #[test]
    fn single_flip_ratio_matches_rebuild() {
        for order in [PropagatorOrder::KineticLast, PropagatorOrder::KineticFirst, PropagatorOrder::Symmetric] {
            let mut f = fixture(order);
            let base = f.factorization.probability();
            let base_sign = f.factorization.sign();
            let proposal = f.engine.propose(&f.acc, &f.fields, &f.factorization, 2, vec![1]);
            let expected = proposal.log_weight + base;
            let expected_sign = proposal.sign * base_sign;
            f.engine.accept(proposal, &mut f.fields, &mut f.cache);
            let (log_weight, sign) = rebuilt_log_weight(&f);
            assert_relative_eq!(log_weight, expected, epsilon = 1e-8);
            assert_eq!(sign, expected_sign);
        }
    }

    #[test]
    fn multi_site_flip_matches_rebuild() {
        let mut f = fixture(PropagatorOrder::KineticLast);
        let base = f.factorization.probability();
        let first = f.engine.propose(&f.acc, &f.fields, &f.factorization, 0, vec![2]);
        f.engine.accept(first, &mut f.fields, &mut f.cache);
        let second = f.engine.propose(&f.acc, &f.fields, &f.factorization, 3, vec![0, 3]);
        assert_eq!(second.rank(), 2);
        let expected = second.log_weight + base;
        f.engine.accept(second, &mut f.fields, &mut f.cache);
        assert_eq!(f.engine.batch().len(), 3);
        assert!(!f.engine.batch().has_room(2));
        let (log_weight, _) = rebuilt_log_weight(&f);
        assert_relative_eq!(log_weight, expected, epsilon = 1e-8);
    }

    #[test]
    fn patched_slice_matches_recomputed_slice() {
        let mut f = fixture(PropagatorOrder::Symmetric);
        let proposal = f.engine.propose(&f.acc, &f.fields, &f.factorization, 1, vec![3]);
        assert_eq!(proposal.time(), 1);
        assert_eq!(proposal.sites(), &[3]);
        f.engine.accept(proposal, &mut f.fields, &mut f.cache);
        assert_relative_eq!(f.cache.get(0).matrix, f.acc.forward(&f.fields, 0, 4), epsilon = 1e-12);
    }

    #[test]
    fn delta_is_relative_to_batch() {
        let mut f = fixture(PropagatorOrder::KineticLast);
        let first = f.engine.propose(&f.acc, &f.fields, &f.factorization, 1, vec![0]);
        assert_relative_eq!(first.delta(f.engine.batch()), first.log_weight);
        f.engine.accept(first.clone(), &mut f.fields, &mut f.cache);
        let second = f.engine.propose(&f.acc, &f.fields, &f.factorization, 2, vec![1]);
        assert_relative_eq!(second.delta(f.engine.batch()), second.log_weight - first.log_weight);
    }
}
