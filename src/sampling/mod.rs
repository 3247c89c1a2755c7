//! Sampling module - determinant updates, the Trotter Metropolis loop and the continuous-time sampler.

mod traits;
mod update;
mod metropolis;
mod continuous;

pub use traits::Replica;
pub use update::{DeterminantUpdateEngine, Proposal, UpdateBatch};
pub use metropolis::{ResyncReport, SamplerState, Simulation, SweepReport, FOLD_IN_HISTORY};
pub use continuous::ContinuousTimeSimulation;
