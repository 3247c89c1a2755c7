//! Interaction vertices of the continuous-time expansion.
//!
//! Each vertex sits at a time in `[0, β)` and carries one field ±A per site.
//! Vertices are kept sorted by time.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DqmcError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Vertex {
    time: f64,
    fields: Vec<f64>,
}

impl Vertex {
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn fields(&self) -> &[f64] {
        &self.fields
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VertexConfiguration {
    beta: f64,
    volume: usize,
    magnitude: f64,
    vertices: Vec<Vertex>,
}

impl VertexConfiguration {
    /// No vertices: the free propagator over the whole of `[0, β)`.
    pub fn empty(beta: f64, volume: usize, magnitude: f64) -> Result<Self> {
        if !(beta.is_finite() && beta > 0.0) {
            return Err(DqmcError::invalid("beta", "must be positive and finite"));
        }
        if volume == 0 {
            return Err(DqmcError::invalid("volume", "must be positive"));
        }
        if !(magnitude.is_finite() && magnitude >= 0.0) {
            return Err(DqmcError::invalid("vertices", format!("field magnitude {magnitude} is not usable")));
        }
        Ok(Self { beta, volume, magnitude, vertices: Vec::new() })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Independent fair ±A draws for every site.
    pub fn draw_fields<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        (0..self.volume)
            .map(|_| if rng.gen_bool(0.5) { self.magnitude } else { -self.magnitude })
            .collect()
    }

    /// Inserts a vertex and returns its position in time order.
    pub fn insert(&mut self, time: f64, fields: Vec<f64>) -> Result<usize> {
        if !(0.0..self.beta).contains(&time) {
            return Err(DqmcError::invalid("vertices", format!("time {time} outside [0, {})", self.beta)));
        }
        self.check_fields(&fields)?;
        let index = self.vertices.partition_point(|v| v.time < time);
        if self.vertices.get(index).is_some_and(|v| v.time == time) {
            return Err(DqmcError::invalid("vertices", format!("a vertex already sits at time {time}")));
        }
        self.vertices.insert(index, Vertex { time, fields });
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> Vertex {
        self.vertices.remove(index)
    }

    /// Re-inserts a vertex taken out with [`remove`](Self::remove).
    pub fn put_back(&mut self, vertex: Vertex) {
        let index = self.vertices.partition_point(|v| v.time < vertex.time);
        self.vertices.insert(index, vertex);
    }

    pub fn has_vertex_at(&self, time: f64) -> bool {
        self.vertices.iter().any(|v| v.time == time)
    }

    /// Negates the fields of `sites` on vertex `index`.
    pub fn flip_many(&mut self, index: usize, sites: &[usize]) {
        let fields = &mut self.vertices[index].fields;
        for &x in sites {
            fields[x] = -fields[x];
        }
    }

    /// Gaps between consecutive vertices, starting at 0 and closing at β.
    /// There is always one more gap than vertices.
    pub fn gaps(&self) -> Vec<f64> {
        let mut previous = 0.0;
        let mut gaps: Vec<f64> = self
            .vertices
            .iter()
            .map(|v| {
                let gap = v.time - previous;
                previous = v.time;
                gap
            })
            .collect();
        gaps.push(self.beta - previous);
        gaps
    }

    fn check_fields(&self, fields: &[f64]) -> Result<()> {
        if fields.len() != self.volume {
            return Err(DqmcError::invalid(
                "vertices",
                format!("{} fields on a lattice of {} sites", fields.len(), self.volume),
            ));
        }
        if fields.iter().any(|v| v.abs() != self.magnitude) {
            return Err(DqmcError::invalid("vertices", format!("every field must be ±{}", self.magnitude)));
        }
        Ok(())
    }

    /// Checks what a deserialized configuration may violate: strictly
    /// increasing times inside `[0, β)` and V fields of ±A on every vertex.
    pub fn validate(&self) -> Result<()> {
        if !(self.beta.is_finite() && self.beta > 0.0) || self.volume == 0 {
            return Err(DqmcError::invalid("vertices", "empty or unbounded configuration"));
        }
        let mut previous: Option<f64> = None;
        for vertex in &self.vertices {
            if !(0.0..self.beta).contains(&vertex.time) || previous.is_some_and(|p| vertex.time <= p) {
                return Err(DqmcError::invalid(
                    "vertices",
                    format!("time {} is out of order or outside [0, {})", vertex.time, self.beta),
                ));
            }
            self.check_fields(&vertex.fields)?;
            previous = Some(vertex.time);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn insertion_keeps_time_order() {
        let mut rng = Pcg64::seed_from_u64(1);
        let mut c = VertexConfiguration::empty(2.0, 3, 0.5).unwrap();
        for time in [1.5, 0.25, 1.0, 0.0] {
            let fields = c.draw_fields(&mut rng);
            c.insert(time, fields).unwrap();
        }
        let times: Vec<f64> = c.vertices().iter().map(Vertex::time).collect();
        assert_eq!(times, vec![0.0, 0.25, 1.0, 1.5]);
        assert_eq!(c.gaps(), vec![0.0, 0.25, 0.75, 0.5, 0.5]);
        assert_relative_eq!(c.gaps().iter().sum::<f64>(), 2.0);
        assert!(c.validate().is_ok());

        let before = c.clone();
        let removed = c.remove(2);
        assert_eq!(removed.time(), 1.0);
        assert_eq!(c.len(), 3);
        assert!(!c.has_vertex_at(1.0));
        c.put_back(removed);
        assert_eq!(c, before);
    }

    #[test]
    fn rejects_bad_vertices() {
        let mut c = VertexConfiguration::empty(1.0, 2, 0.5).unwrap();
        assert!(c.insert(1.0, vec![0.5, 0.5]).is_err());
        assert!(c.insert(-0.1, vec![0.5, 0.5]).is_err());
        assert!(c.insert(0.5, vec![0.5]).is_err());
        assert!(c.insert(0.5, vec![0.5, 0.4]).is_err());
        c.insert(0.5, vec![0.5, -0.5]).unwrap();
        assert!(c.insert(0.5, vec![0.5, 0.5]).is_err());
        assert!(VertexConfiguration::empty(0.0, 2, 0.5).is_err());
    }

    #[test]
    fn flips_negate_selected_sites() {
        let mut c = VertexConfiguration::empty(1.0, 4, 0.3).unwrap();
        c.insert(0.2, vec![0.3; 4]).unwrap();
        c.flip_many(0, &[1, 3]);
        assert_eq!(c.vertices()[0].fields(), &[0.3, -0.3, 0.3, -0.3]);
    }

    #[test]
    fn validation_catches_unordered_yaml() {
        let yaml = "beta: 1.0\nvolume: 1\nmagnitude: 0.5\nvertices:\n  - {time: 0.6, fields: [0.5]}\n  - {time: 0.2, fields: [-0.5]}\n";
        let loaded: VertexConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert!(loaded.validate().is_err());
    }
}
