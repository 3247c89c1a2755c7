//! Propagator module - kinetic and interaction factors of the imaginary-time evolution.

mod spectral;
mod slices;

pub use spectral::{SpectralPropagator, TimeDirection};
pub use slices::{PropagatorOrder, Slice, SliceAccumulator, SliceCache};
