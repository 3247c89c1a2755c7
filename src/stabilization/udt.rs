//! U·diag(D)·T records of possibly very ill-conditioned matrices.
//!
//! U is orthogonal, D carries every scale and T is well conditioned, so a
//! product whose scales span hundreds of decades never puts them into one
//! floating-point number. Column-pivoted QR keeps each scale to relative
//! accuracy; an SVD is available as the alternative scheme.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{DqmcError, Result};

/// Iteration cap for nalgebra's iterative decompositions.
pub(crate) const MAX_ITERATIONS: usize = 1000;

/// How a product is re-orthogonalized.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationScheme {
    /// Householder QR with column pivoting; T = D⁻¹·R·Pᵗ is unit upper triangular up to the permutation.
    #[default]
    Qr,
    /// Singular value decomposition; T stays orthogonal.
    Svd,
}

/// Factorization `U·diag(D)·T` with orthogonal `U` and positive, finite `D`.
///
/// Between re-factorizations `u` may temporarily hold a non-orthogonal
/// matrix (see [`UdtFactorization::left_multiply`]).
#[derive(Debug, Clone, PartialEq)]
pub struct UdtFactorization {
    scheme: StabilizationScheme,
    pub u: DMatrix<f64>,
    pub d: DVector<f64>,
    pub t: DMatrix<f64>,
}

fn checked_scales(d: DVector<f64>, stage: &'static str) -> Result<DVector<f64>> {
    if d.iter().all(|s| s.is_finite() && *s > 0.0) {
        Ok(d)
    } else {
        Err(DqmcError::Decomposition { stage })
    }
}

/// matrix = Q·diag(D)·X with orthogonal Q.
fn split(
    matrix: DMatrix<f64>,
    scheme: StabilizationScheme,
    stage: &'static str,
) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(DqmcError::Decomposition { stage });
    }
    match scheme {
        StabilizationScheme::Qr => {
            // nalgebra leaves diag(R) non-negative and folds the signs into Q.
            let (q, mut r, p) = matrix.col_piv_qr().unpack();
            let d = checked_scales(r.diagonal(), stage)?;
            p.inv_permute_columns(&mut r);
            for (i, &s) in d.iter().enumerate() {
                r.row_mut(i).scale_mut(s.recip());
            }
            Ok((q, d, r))
        }
        StabilizationScheme::Svd => {
            let svd = matrix
                .try_svd(true, true, f64::EPSILON, MAX_ITERATIONS)
                .ok_or(DqmcError::Decomposition { stage })?;
            let u = svd.u.ok_or(DqmcError::Decomposition { stage })?;
            let vt = svd.v_t.ok_or(DqmcError::Decomposition { stage })?;
            let d = checked_scales(svd.singular_values, stage)?;
            Ok((u, d, vt))
        }
    }
}

fn sign_of_determinant(m: &DMatrix<f64>) -> f64 {
    if m.clone().lu().determinant() > 0.0 {
        1.0
    } else {
        -1.0
    }
}

impl UdtFactorization {
    pub fn identity(n: usize, scheme: StabilizationScheme) -> Self {
        Self {
            scheme,
            u: DMatrix::identity(n, n),
            d: DVector::from_element(n, 1.0),
            t: DMatrix::identity(n, n),
        }
    }

    pub fn from_matrix(matrix: DMatrix<f64>, scheme: StabilizationScheme) -> Result<Self> {
        let (u, d, t) = split(matrix, scheme, "initial factorization")?;
        Ok(Self { scheme, u, d, t })
    }

    pub fn scheme(&self) -> StabilizationScheme {
        self.scheme
    }

    pub fn dim(&self) -> usize {
        self.d.len()
    }

    /// U ← matrix·U; call [`absorb_u`](Self::absorb_u) before U is needed orthogonal again.
    pub fn left_multiply(&mut self, matrix: &DMatrix<f64>) {
        self.u = matrix * &self.u;
    }

    /// Re-orthogonalizes: U·diag(D) = U'·diag(D')·X, T ← X·T.
    pub fn absorb_u(&mut self) -> Result<()> {
        let mut scaled = self.u.clone();
        for (j, &s) in self.d.iter().enumerate() {
            scaled.column_mut(j).scale_mut(s);
        }
        let (u, d, x) = split(scaled, self.scheme, "stabilization")?;
        self.u = u;
        self.d = d;
        self.t = x * &self.t;
        Ok(())
    }

    /// Becomes the factorization of I + λ·U·D·T.
    ///
    /// With D_b = max(λD, 1) and D_s = min(λD, 1),
    /// I + λ·U·D·T = U·D_b·(D_b⁻¹·Uᵗ + D_s·T); the bracket is well
    /// conditioned and becomes the new T. U must be orthogonal.
    pub fn add_identity(&mut self, lambda: f64) -> Result<()> {
        let scaled = checked_scales(self.d.map(|s| lambda * s), "identity shift")?;
        let big = scaled.map(|s| s.max(1.0));
        let small = scaled.map(|s| s.min(1.0));
        let n = self.dim();
        self.t = DMatrix::from_fn(n, n, |i, j| self.u[(j, i)] / big[i] + small[i] * self.t[(i, j)]);
        self.d = big;
        Ok(())
    }

    /// (U·D·T)⁻¹ = T⁻¹·D⁻¹·Uᵗ, re-factored in place. U must be orthogonal.
    pub fn invert_in_place(&mut self) -> Result<()> {
        let t_inverse = self
            .t
            .clone()
            .lu()
            .try_inverse()
            .ok_or(DqmcError::Decomposition { stage: "inversion" })?;
        self.t = std::mem::replace(&mut self.u, t_inverse).transpose();
        self.d.apply(|s| *s = s.recip());
        self.absorb_u()
    }

    pub fn inverted(&self) -> Result<Self> {
        let mut inverse = self.clone();
        inverse.invert_in_place()?;
        Ok(inverse)
    }

    /// Dense T⁻¹·D⁻¹·Uᵗ, solved without forming the product.
    pub fn inverse(&self) -> Result<DMatrix<f64>> {
        let mut rhs = self.u.transpose();
        for (i, &s) in self.d.iter().enumerate() {
            rhs.row_mut(i).scale_mut(s.recip());
        }
        self.t
            .clone()
            .lu()
            .solve(&rhs)
            .ok_or(DqmcError::Decomposition { stage: "inverse" })
    }

    /// Dense U·D·T.
    pub fn matrix(&self) -> DMatrix<f64> {
        let mut left = self.u.clone();
        for (j, &s) in self.d.iter().enumerate() {
            left.column_mut(j).scale_mut(s);
        }
        left * &self.t
    }

    /// ln|det| = Σ ln D + ln|det T|.
    pub fn log_abs_det(&self) -> f64 {
        let scales: f64 = self.d.iter().map(|s| s.ln()).sum();
        scales + self.t.clone().lu().determinant().abs().ln()
    }

    /// Sign of the determinant of the product.
    pub fn orientation(&self) -> f64 {
        sign_of_determinant(&self.u) * sign_of_determinant(&self.t)
    }

    /// Ratio of the extreme scales.
    pub fn condition(&self) -> f64 {
        self.d.max() / self.d.min()
    }
}
