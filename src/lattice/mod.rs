//! Lattice module - geometry and dispersion of the periodic lattice.

mod geometry;

pub use geometry::{Axis, LatticeGeometry};
