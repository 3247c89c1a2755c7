//! YAML checkpoints of a replica.
//!
//! Only raw state is stored: parameters, the fields (with their time origin)
//! or the continuous-time vertices, the generator and the running summaries.
//! Slices and factorizations are rebuilt on load.

use std::collections::BTreeMap;
use std::path::Path;

use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use super::config::Parameters;
use crate::error::Result;
use crate::field::{FieldConfiguration, VertexConfiguration};
use crate::observables::Measurement;

/// Configuration of whichever sampler wrote the checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Fields(FieldConfiguration),
    Vertices(VertexConfiguration),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub parameters: Parameters,
    pub state: ReplicaState,
    pub rng: Pcg64,
    #[serde(default)]
    pub summaries: BTreeMap<String, Measurement>,
    #[serde(default)]
    pub thermalization_done: usize,
    #[serde(default)]
    pub sweeps_done: usize,
}

impl Checkpoint {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_yaml::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DqmcError;
    use rand::{Rng, SeedableRng};

    #[test]
    fn yaml_round_trip_keeps_generator_stream() {
        let parameters = Parameters::new([2, 2, 1], 8, 1.0, -2.0);
        let mut rng = Pcg64::seed_from_u64(17);
        let a = parameters.coupling().unwrap().a;
        let mut fields = FieldConfiguration::initialize(8, 4, a, 0.5, &mut rng).unwrap();
        fields.shift_origin(3);
        let mut summaries = BTreeMap::new();
        let mut density = Measurement::new();
        density.add(0.9);
        density.add(1.1);
        summaries.insert("density".to_string(), density);
        let checkpoint = Checkpoint {
            parameters,
            state: ReplicaState::Fields(fields),
            rng: rng.clone(),
            summaries,
            thermalization_done: 10,
            sweeps_done: 2,
        };

        let yaml = serde_yaml::to_string(&checkpoint).unwrap();
        let mut loaded: Checkpoint = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(loaded.state, checkpoint.state);
        match &loaded.state {
            ReplicaState::Fields(fields) => assert_eq!(fields.origin(), 3),
            other => panic!("expected fields, got {other:?}"),
        }
        assert_eq!(loaded.summaries, checkpoint.summaries);
        assert_eq!(loaded.rng.gen::<u64>(), rng.gen::<u64>());
    }

    #[test]
    fn vertices_survive_the_round_trip() {
        let mut parameters = Parameters::new([2, 1, 1], 8, 1.0, -0.25);
        parameters.discretization = crate::io::TimeDiscretization::Continuous;
        let mut rng = Pcg64::seed_from_u64(4);
        let mut vertices = VertexConfiguration::empty(1.0, 2, 0.5).unwrap();
        let fields = vertices.draw_fields(&mut rng);
        vertices.insert(0.375, fields).unwrap();
        let checkpoint = Checkpoint {
            parameters,
            state: ReplicaState::Vertices(vertices),
            rng,
            summaries: BTreeMap::new(),
            thermalization_done: 0,
            sweeps_done: 0,
        };
        let yaml = serde_yaml::to_string(&checkpoint).unwrap();
        let loaded: Checkpoint = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Checkpoint::load("/nonexistent/dqmc/checkpoint.yml").unwrap_err();
        assert!(matches!(err, DqmcError::Io(_)));
    }
}
