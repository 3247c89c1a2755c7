//! Traits shared by the samplers.

use rand::Rng;

use super::metropolis::SweepReport;
use crate::error::Result;
use crate::io::{Checkpoint, Parameters, ReplicaState};
use crate::observables::{ObservableSample, TimeDisplacedGreens};

/// One Markov chain whose weight is a product of two fermion determinants.
pub trait Replica: Sized {
    /// Builds a replica with a fresh configuration.
    fn start<R: Rng + ?Sized>(parameters: Parameters, rng: &mut R) -> Result<Self>;
    fn resume(checkpoint: &Checkpoint) -> Result<Self>;
    fn sweep<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<SweepReport>;
    fn measure(&mut self) -> Result<ObservableSample>;
    fn time_displaced_greens(&mut self) -> Result<Vec<TimeDisplacedGreens>>;
    fn parameters(&self) -> &Parameters;
    /// ln|weight|
    fn log_weight(&self) -> f64;
    fn sign(&self) -> f64;
    /// Raw configuration for a checkpoint.
    fn snapshot(&self) -> ReplicaState;
}
