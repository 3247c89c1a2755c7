//! Periodic hyper-cubic lattice with nearest-neighbour hopping.

use std::f64::consts::PI;

use nalgebra::DVector;

use crate::error::{DqmcError, Result};

/// Spatial axis of the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Immutable lattice description.
///
/// Sites and momentum modes share the layout `x·Ly·Lz + y·Lz + z`.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeGeometry {
    extents: [usize; 3],
    hoppings: [f64; 3],
    volume: usize,
    /// Kinetic eigenvalue ε(k) of every momentum mode.
    dispersion: DVector<f64>,
    /// On-site staggered potential ±h.
    potential: DVector<f64>,
    /// +1 on the even sublattice, -1 on the odd one.
    staggering: DVector<f64>,
}

impl LatticeGeometry {
    pub fn new(extents: [usize; 3], hoppings: [f64; 3], staggered_field: f64) -> Result<Self> {
        if let Some(axis) = extents.iter().position(|&l| l == 0) {
            let name = ["lx", "ly", "lz"][axis];
            return Err(DqmcError::invalid(name, "lattice extent must be at least 1"));
        }
        // An axis of length one has no neighbours to hop to.
        let mut hoppings = hoppings;
        for (t, &l) in hoppings.iter_mut().zip(extents.iter()) {
            if l < 2 {
                *t = 0.0;
            }
        }
        let [lx, ly, lz] = extents;
        let volume = lx * ly * lz;

        let mut dispersion = DVector::zeros(volume);
        let mut potential = DVector::zeros(volume);
        let mut staggering = DVector::zeros(volume);
        for i in 0..volume {
            let k = [(i / lz / ly) % lx, (i / lz) % ly, i % lz];
            dispersion[i] = -2.0
                * (0..3)
                    .map(|d| hoppings[d] * (2.0 * PI * k[d] as f64 / extents[d] as f64).cos())
                    .sum::<f64>();
            let parity = (k[0] + k[1] + k[2]) % 2;
            staggering[i] = if parity == 0 { 1.0 } else { -1.0 };
            potential[i] = staggering[i] * staggered_field;
        }

        Ok(Self { extents, hoppings, volume, dispersion, potential, staggering })
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn extents(&self) -> [usize; 3] {
        self.extents
    }

    pub fn extent(&self, axis: Axis) -> usize {
        self.extents[axis.index()]
    }

    /// Hopping amplitudes after dropping axes of length one.
    pub fn hoppings(&self) -> [f64; 3] {
        self.hoppings
    }

    pub fn dispersion(&self) -> &DVector<f64> {
        &self.dispersion
    }

    pub fn potential(&self) -> &DVector<f64> {
        &self.potential
    }

    pub fn staggering(&self) -> &DVector<f64> {
        &self.staggering
    }

    pub fn coordinates(&self, site: usize) -> [usize; 3] {
        let [lx, ly, lz] = self.extents;
        [(site / lz / ly) % lx, (site / lz) % ly, site % lz]
    }

    pub fn site(&self, coordinates: [usize; 3]) -> usize {
        let [_, ly, lz] = self.extents;
        (coordinates[0] * ly + coordinates[1]) * lz + coordinates[2]
    }

    /// Site reached from `site` by `k` steps along `axis`, with periodic wrapping.
    pub fn shift(&self, site: usize, axis: Axis, k: isize) -> usize {
        let mut c = self.coordinates(site);
        let d = axis.index();
        let l = self.extents[d] as isize;
        c[d] = (c[d] as isize + k).rem_euclid(l) as usize;
        self.site(c)
    }
}
