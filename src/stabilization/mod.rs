//! Stabilization module - graded U·D·T products of imaginary-time slices.

mod udt;
mod factorization;

pub use udt::{StabilizationScheme, UdtFactorization};
pub use factorization::{RebuildSummary, Species, StabilizedFactorization};
