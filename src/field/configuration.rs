//! Auxiliary Hubbard–Stratonovich fields on the space-time lattice.

use rand::distributions::{Bernoulli, Distribution};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DqmcError, Result};

/// Cached slice ranges made stale by a field mutation, in logical time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    None,
    /// Logical times `start..end`.
    Times { start: usize, end: usize },
    All,
}

/// One field value ±A per (time slice, site).
///
/// Logical time `t` lives in storage row `(t + origin) mod N`, which lets the
/// time origin move in constant time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldConfiguration {
    time_slices: usize,
    volume: usize,
    magnitude: f64,
    origin: usize,
    values: Vec<f64>,
}

impl FieldConfiguration {
    /// Draws every field independently: +A with probability `p`, -A otherwise.
    pub fn initialize<R: Rng + ?Sized>(
        time_slices: usize,
        volume: usize,
        magnitude: f64,
        p: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let coin = Bernoulli::new(p).map_err(|e| DqmcError::invalid("init_probability", e.to_string()))?;
        let mut fields = Self::filled(time_slices, volume, magnitude)?;
        for value in fields.values.iter_mut() {
            if !coin.sample(rng) {
                *value = -magnitude;
            }
        }
        Ok(fields)
    }

    /// Every field set to +A.
    pub fn filled(time_slices: usize, volume: usize, magnitude: f64) -> Result<Self> {
        if time_slices == 0 {
            return Err(DqmcError::invalid("time_slices", "must be positive"));
        }
        if volume == 0 {
            return Err(DqmcError::invalid("volume", "must be positive"));
        }
        Ok(Self {
            time_slices,
            volume,
            magnitude,
            origin: 0,
            values: vec![magnitude; time_slices * volume],
        })
    }

    pub fn time_slices(&self) -> usize {
        self.time_slices
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Wraps any logical time onto `0..N`.
    pub fn wrap(&self, t: isize) -> usize {
        t.rem_euclid(self.time_slices as isize) as usize
    }

    fn storage_row(&self, t: usize) -> usize {
        (t + self.origin) % self.time_slices
    }

    /// Fields of logical time `t` (already in `0..N`).
    pub fn slice(&self, t: usize) -> &[f64] {
        let row = self.storage_row(t);
        &self.values[row * self.volume..(row + 1) * self.volume]
    }

    pub fn get(&self, t: isize, x: usize) -> f64 {
        self.slice(self.wrap(t))[x]
    }

    pub fn flip(&mut self, t: isize, x: usize) -> Staleness {
        self.flip_many(t, &[x])
    }

    /// Negates several fields sharing one time slice.
    pub fn flip_many(&mut self, t: isize, sites: &[usize]) -> Staleness {
        if sites.is_empty() {
            return Staleness::None;
        }
        let t = self.wrap(t);
        let row = self.storage_row(t);
        for &x in sites {
            assert!(x < self.volume, "site {x} outside lattice of {} sites", self.volume);
            let value = &mut self.values[row * self.volume + x];
            *value = -*value;
        }
        Staleness::Times { start: t, end: t + 1 }
    }

    /// Negates the field of `site` at every time.
    pub fn flip_all_times(&mut self, site: usize) -> Staleness {
        assert!(site < self.volume, "site {site} outside lattice of {} sites", self.volume);
        for row in 0..self.time_slices {
            let value = &mut self.values[row * self.volume + site];
            *value = -*value;
        }
        Staleness::All
    }

    /// Checks the invariants a deserialized configuration may violate:
    /// N·V values, every value exactly ±A and an origin inside `0..N`.
    pub fn validate(&self) -> Result<()> {
        if self.time_slices == 0 || self.volume == 0 {
            return Err(DqmcError::invalid("fields", "configuration has no time slices or no sites"));
        }
        let expected = self.time_slices * self.volume;
        if self.values.len() != expected {
            return Err(DqmcError::invalid(
                "fields",
                format!("{} values stored, {}x{} needs {expected}", self.values.len(), self.time_slices, self.volume),
            ));
        }
        if self.origin >= self.time_slices {
            return Err(DqmcError::invalid(
                "fields",
                format!("origin {} outside 0..{}", self.origin, self.time_slices),
            ));
        }
        if let Some(i) = self.values.iter().position(|v| v.abs() != self.magnitude) {
            return Err(DqmcError::invalid(
                "fields",
                format!("value {} at index {i} is not ±{}", self.values[i], self.magnitude),
            ));
        }
        Ok(())
    }

    /// Moves logical time 0 by `delta` slices.
    pub fn shift_origin(&mut self, delta: isize) -> Staleness {
        let delta = self.wrap(delta);
        if delta == 0 {
            return Staleness::None;
        }
        self.origin = (self.origin + delta) % self.time_slices;
        Staleness::All
    }

    /// Number of fields currently at +A.
    pub fn count_positive(&self) -> usize {
        self.values.iter().filter(|&&v| v > 0.0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn initialization_respects_magnitude_and_seed() {
        let mut rng = Pcg64::seed_from_u64(7);
        let a = FieldConfiguration::initialize(8, 4, 0.3, 0.5, &mut rng).unwrap();
        let mut rng = Pcg64::seed_from_u64(7);
        let b = FieldConfiguration::initialize(8, 4, 0.3, 0.5, &mut rng).unwrap();
        assert_eq!(a, b);
        for t in 0..8 {
            assert!(a.slice(t).iter().all(|v| v.abs() == 0.3));
        }
        let positive = a.count_positive();
        assert!(positive > 0 && positive < 32);
    }

    #[test]
    fn biased_coin_extremes() {
        let mut rng = Pcg64::seed_from_u64(1);
        let all_up = FieldConfiguration::initialize(4, 3, 0.2, 1.0, &mut rng).unwrap();
        assert_eq!(all_up.count_positive(), 12);
        let all_down = FieldConfiguration::initialize(4, 3, 0.2, 0.0, &mut rng).unwrap();
        assert_eq!(all_down.count_positive(), 0);
        assert!(FieldConfiguration::initialize(4, 3, 0.2, 1.5, &mut rng).is_err());
    }

    #[test]
    fn flip_reports_stale_time() {
        let mut f = FieldConfiguration::filled(5, 2, 0.4).unwrap();
        assert_eq!(f.flip(-1, 1), Staleness::Times { start: 4, end: 5 });
        assert_eq!(f.get(4, 1), -0.4);
        assert_eq!(f.flip_many(2, &[]), Staleness::None);
        f.flip_many(7, &[0, 1]);
        assert_eq!(f.slice(2), &[-0.4, -0.4]);
    }

    #[test]
    fn origin_shift_relabels_time() {
        let mut f = FieldConfiguration::filled(4, 1, 1.0).unwrap();
        f.flip(2, 0);
        assert_eq!(f.shift_origin(1), Staleness::All);
        assert_eq!(f.get(1, 0), -1.0);
        assert_eq!(f.shift_origin(-4), Staleness::None);
        assert_eq!(f.shift_origin(-1), Staleness::All);
        assert_eq!(f.get(2, 0), -1.0);
        assert_eq!(f.origin(), 0);
    }

    #[test]
    fn flipping_a_site_negates_every_time() {
        let mut f = FieldConfiguration::filled(3, 2, 0.5).unwrap();
        f.shift_origin(1);
        assert_eq!(f.flip_all_times(1), Staleness::All);
        for t in 0..3 {
            assert_eq!(f.get(t, 0), 0.5);
            assert_eq!(f.get(t, 1), -0.5);
        }
        f.flip_all_times(1);
        assert_eq!(f.count_positive(), 6);
    }

    #[test]
    fn validation_catches_corrupted_checkpoints() {
        let mut rng = Pcg64::seed_from_u64(3);
        let good = FieldConfiguration::initialize(4, 3, 0.25, 0.5, &mut rng).unwrap();
        assert!(good.validate().is_ok());

        let mut truncated = good.clone();
        truncated.values.truncate(7);
        assert!(matches!(truncated.validate(), Err(DqmcError::InvalidParameters { name: "fields", .. })));

        let mut off_lattice = good.clone();
        off_lattice.values[5] = 0.3;
        assert!(off_lattice.validate().is_err());

        let mut bad_origin = good.clone();
        bad_origin.origin = 4;
        assert!(bad_origin.validate().is_err());

        let yaml = "time_slices: 2\nvolume: 2\nmagnitude: 0.5\norigin: 0\nvalues: [0.5, -0.5, 0.5]\n";
        let loaded: FieldConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert!(loaded.validate().is_err());
    }

    proptest! {
        #[test]
        fn time_index_wraps_for_any_integer(t in any::<i32>(), shift in any::<i32>()) {
            let mut f = FieldConfiguration::filled(7, 3, 0.5).unwrap();
            f.shift_origin(shift as isize);
            let wrapped = f.wrap(t as isize);
            prop_assert!(wrapped < 7);
            f.flip(t as isize, 2);
            prop_assert_eq!(f.get(t as isize, 2), -0.5);
            prop_assert_eq!(f.get(t as isize + 7, 2), -0.5);
            prop_assert_eq!(f.count_positive(), 20);
        }
    }
}
