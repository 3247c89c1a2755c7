//! IO module - configuration files and checkpoints.

mod config;
mod checkpoint;

pub use config::{read_run_config, Coupling, Parameters, RunConfig, TimeDiscretization};
pub use checkpoint::{Checkpoint, ReplicaState};
