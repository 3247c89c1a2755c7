//! Field module - auxiliary fields on time slices and on continuous-time vertices.

mod configuration;
mod vertices;

pub use configuration::{FieldConfiguration, Staleness};
pub use vertices::{Vertex, VertexConfiguration};
