//! Stabilized factorizations of the full time-ordered product and its
//! per-species derivatives.
//!
//! With M = S_last···S_0 the weight of a field configuration is
//! det(I + λ↑M)·det(I + λ↓M). M and both I + λσM are kept in U·D·T form so
//! that scales spanning hundreds of decades never meet in one
//! floating-point number; the Green's functions G_σ = I - (I + λσM)⁻¹ are
//! bounded and kept dense.

use log::debug;
use nalgebra::linalg::Schur;
use nalgebra::DMatrix;

use super::udt::{StabilizationScheme, UdtFactorization, MAX_ITERATIONS};
use crate::error::Result;
use crate::propagator::SliceCache;

/// Condition number below which the eigenvalue phase check is trusted.
const PHASE_CONDITION_LIMIT: f64 = 1e10;

/// Spin species.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Species {
    Up,
    Down,
}

impl Species {
    pub const BOTH: [Species; 2] = [Species::Up, Species::Down];

    fn index(self) -> usize {
        match self {
            Species::Up => 0,
            Species::Down => 1,
        }
    }
}

/// Result of one rebuild.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebuildSummary {
    pub log_weight: f64,
    pub sign: f64,
    /// cos(eigenvalue phase)·sign, when the product was well conditioned
    /// enough to check.
    pub phase_cosine: Option<f64>,
}

impl RebuildSummary {
    /// A weight is physical unless the phase check ran and disagreed.
    pub fn is_physical(&self) -> bool {
        self.phase_cosine.map_or(true, |c| c >= 0.99)
    }
}

/// Factorizations of M and I + λσM, and the dense G_σ, for both species.
#[derive(Debug, Clone)]
pub struct StabilizedFactorization {
    scheme: StabilizationScheme,
    blocks_per_svd: usize,
    fugacities: [f64; 2],
    verify_phase: bool,
    base: UdtFactorization,
    species: [UdtFactorization; 2],
    resolvents: [DMatrix<f64>; 2],
    greens: [DMatrix<f64>; 2],
}

impl StabilizedFactorization {
    pub fn new(
        volume: usize,
        fugacities: (f64, f64),
        scheme: StabilizationScheme,
        blocks_per_svd: usize,
        verify_phase: bool,
    ) -> Self {
        let identity = UdtFactorization::identity(volume, scheme);
        let half = DMatrix::identity(volume, volume) * 0.5;
        Self {
            scheme,
            blocks_per_svd: blocks_per_svd.max(1),
            fugacities: [fugacities.0, fugacities.1],
            verify_phase,
            base: identity.clone(),
            species: [identity.clone(), identity],
            resolvents: [half.clone(), half.clone()],
            greens: [half.clone(), half],
        }
    }

    /// Recomputes every factorization from a current slice cache.
    pub fn rebuild(&mut self, cache: &SliceCache) -> Result<RebuildSummary> {
        self.rebuild_from(cache.slices().iter().map(|slice| &slice.matrix))
    }

    /// Recomputes every factorization from time-ordered propagators, earliest first.
    pub fn rebuild_from<'a>(&mut self, steps: impl IntoIterator<Item = &'a DMatrix<f64>>) -> Result<RebuildSummary> {
        let mut base = UdtFactorization::identity(self.base.dim(), self.scheme);
        let mut pending = 0;
        for step in steps {
            base.left_multiply(step);
            pending += 1;
            if pending == self.blocks_per_svd {
                base.absorb_u()?;
                pending = 0;
            }
        }
        if pending > 0 {
            base.absorb_u()?;
        }

        for species in Species::BOTH {
            let mut shifted = base.clone();
            shifted.add_identity(self.fugacity(species))?;
            let resolvent = shifted.inverse()?;
            let n = resolvent.nrows();
            self.greens[species.index()] = DMatrix::identity(n, n) - &resolvent;
            self.resolvents[species.index()] = resolvent;
            self.species[species.index()] = shifted;
        }
        self.base = base;

        let summary = RebuildSummary {
            log_weight: self.probability(),
            sign: self.sign(),
            phase_cosine: self.phase_check()?,
        };
        Ok(summary)
    }

    /// Eigenvalue route to the weight's phase, only while M is well conditioned.
    fn phase_check(&self) -> Result<Option<f64>> {
        if !self.verify_phase || !(self.base.condition() < PHASE_CONDITION_LIMIT) {
            return Ok(None);
        }
        let Some(schur) = Schur::try_new(self.base.matrix(), f64::EPSILON, MAX_ITERATIONS) else {
            debug!("schur decomposition did not converge, skipping phase check");
            return Ok(None);
        };
        let eigenvalues = schur.complex_eigenvalues();
        let mut phase = 0.0;
        let mut magnitude = 0.0;
        for &lambda in &self.fugacities {
            for e in eigenvalues.iter() {
                let factor = e * lambda + 1.0;
                phase += factor.arg();
                magnitude += factor.norm().ln();
            }
        }
        let difference = magnitude - self.probability();
        if difference.abs() > 1e-6 {
            debug!("eigenvalue log-weight differs from factorized log-weight by {difference:e}");
        }
        Ok(Some(phase.cos() * self.sign()))
    }

    /// ln|det(I + λ↑M)| + ln|det(I + λ↓M)|.
    pub fn probability(&self) -> f64 {
        self.species.iter().map(UdtFactorization::log_abs_det).sum()
    }

    /// Sign of det(I + λ↑M)·det(I + λ↓M); always ±1.
    pub fn sign(&self) -> f64 {
        self.species.iter().map(UdtFactorization::orientation).product()
    }

    pub fn scheme(&self) -> StabilizationScheme {
        self.scheme
    }

    pub fn fugacity(&self, species: Species) -> f64 {
        self.fugacities[species.index()]
    }

    /// Factorization of M.
    pub fn base(&self) -> &UdtFactorization {
        &self.base
    }

    /// Factorization of I + λσM.
    pub fn species(&self, species: Species) -> &UdtFactorization {
        &self.species[species.index()]
    }

    /// G_σ = λσM·(I + λσM)⁻¹ = I - (I + λσM)⁻¹.
    pub fn greens(&self, species: Species) -> &DMatrix<f64> {
        &self.greens[species.index()]
    }

    /// (I + λσM)⁻¹.
    pub fn resolvent(&self, species: Species) -> &DMatrix<f64> {
        &self.resolvents[species.index()]
    }
}
