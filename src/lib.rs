//! Rust DQMC - determinant quantum Monte Carlo for the Hubbard model
//!
//! This crate samples auxiliary-field configurations of the attractive
//! Hubbard model at finite temperature. The weight of a configuration is a
//! product of two fermion determinants, kept numerically stable through
//! graded UDT factorizations (pivoted QR or SVD) of long imaginary-time
//! products. On Trotter slices it is updated incrementally with low-rank
//! determinant ratios; a continuous-time variant samples interaction
//! vertices instead.

pub mod error;
pub mod io;
pub mod lattice;
pub mod field;
pub mod propagator;
pub mod stabilization;
pub mod sampling;
pub mod observables;

// Re-export commonly used types at crate root
pub use error::{Consistency, DqmcError, DriftReport, PhaseDiagnostic, Result};
pub use io::{read_run_config, Checkpoint, Coupling, Parameters, ReplicaState, RunConfig, TimeDiscretization};
pub use lattice::{Axis, LatticeGeometry};
pub use field::{FieldConfiguration, Staleness, Vertex, VertexConfiguration};
pub use propagator::{PropagatorOrder, SliceAccumulator, SliceCache, SpectralPropagator, TimeDirection};
pub use stabilization::{RebuildSummary, Species, StabilizationScheme, StabilizedFactorization, UdtFactorization};
pub use sampling::{
    ContinuousTimeSimulation, DeterminantUpdateEngine, Proposal, Replica, ResyncReport, SamplerState, Simulation,
    SweepReport,
};
pub use observables::{Measurement, ObservableExtractor, ObservableSample, TimeDisplacedGreens};
