//! Continuous-time sampler over interaction vertices.
//!
//! The propagator is
//! M = e^{-(β-t_n)H₀}·D_n·e^{-(t_n-t_{n-1})H₀}···D_1·e^{-t_1·H₀}
//! with D_i = diag(1 + σ_i). A step flips one field on a random vertex,
//! removes a vertex or inserts one at a uniform time, and every move is
//! accepted on a full re-evaluation of the weight.

use log::{debug, trace};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Exp1};

use super::metropolis::{SamplerState, SweepReport};
use super::traits::Replica;
use crate::error::{DqmcError, PhaseDiagnostic, Result};
use crate::field::VertexConfiguration;
use crate::io::{Checkpoint, Parameters, ReplicaState};
use crate::lattice::LatticeGeometry;
use crate::observables::{ObservableExtractor, ObservableSample, TimeDisplacedGreens};
use crate::propagator::SpectralPropagator;
use crate::stabilization::{RebuildSummary, StabilizedFactorization};

const FLIP_PROBABILITY: f64 = 0.90;
const REMOVE_PROBABILITY: f64 = 0.05;

/// Propagators of one vertex configuration and the factorization built from them.
#[derive(Debug, Clone)]
struct Evaluation {
    steps: Vec<DMatrix<f64>>,
    durations: Vec<f64>,
    factorization: StabilizedFactorization,
    summary: RebuildSummary,
}

#[derive(Debug, Clone)]
pub struct ContinuousTimeSimulation {
    parameters: Parameters,
    geometry: LatticeGeometry,
    kinetic: SpectralPropagator,
    vertices: VertexConfiguration,
    extractor: ObservableExtractor,
    current: Evaluation,
    state: SamplerState,
}

impl ContinuousTimeSimulation {
    /// A replica without vertices.
    pub fn new(parameters: Parameters) -> Result<Self> {
        let magnitude = parameters.vertex_magnitude()?;
        let volume = parameters.extents().iter().product();
        let vertices = VertexConfiguration::empty(parameters.beta, volume, magnitude)?;
        Self::with_vertices(parameters, vertices)
    }

    pub fn with_vertices(parameters: Parameters, vertices: VertexConfiguration) -> Result<Self> {
        parameters.validate()?;
        let magnitude = parameters.vertex_magnitude()?;
        if parameters.h != 0.0 {
            return Err(DqmcError::invalid("h", "a staggered field needs the Trotter discretization"));
        }
        vertices.validate()?;
        let geometry = LatticeGeometry::new(parameters.extents(), parameters.hoppings(), parameters.h)?;
        let volume = geometry.volume();
        if vertices.volume() != volume
            || vertices.beta() != parameters.beta
            || (vertices.magnitude() - magnitude).abs() > 1e-12
        {
            return Err(DqmcError::invalid(
                "vertices",
                format!(
                    "configuration has V={} β={} A={}, parameters need V={volume} β={} A={magnitude}",
                    vertices.volume(),
                    vertices.beta(),
                    vertices.magnitude(),
                    parameters.beta
                ),
            ));
        }

        let kinetic = SpectralPropagator::new(&geometry, 0.0);
        let extractor = ObservableExtractor::new(&geometry, &parameters);
        let template = StabilizedFactorization::new(
            volume,
            parameters.fugacities(),
            parameters.stabilization,
            parameters.blocks_per_svd,
            parameters.verify_phase,
        );
        let current = evaluate(&kinetic, &vertices, template)?;
        if !current.summary.is_physical() {
            return Err(DqmcError::NonPhysicalWeight(Box::new(diagnostic(0.0, &current.summary))));
        }
        Ok(Self {
            parameters,
            geometry,
            kinetic,
            vertices,
            extractor,
            current,
            state: SamplerState::Idle,
        })
    }

    pub fn restore(checkpoint: &Checkpoint) -> Result<Self> {
        match &checkpoint.state {
            ReplicaState::Vertices(vertices) => Self::with_vertices(checkpoint.parameters.clone(), vertices.clone()),
            ReplicaState::Fields(_) => Err(DqmcError::invalid(
                "checkpoint",
                "holds Trotter fields, not continuous-time vertices",
            )),
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn geometry(&self) -> &LatticeGeometry {
        &self.geometry
    }

    pub fn vertices(&self) -> &VertexConfiguration {
        &self.vertices
    }

    pub fn factorization(&self) -> &StabilizedFactorization {
        &self.current.factorization
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn log_weight(&self) -> f64 {
        self.current.summary.log_weight
    }

    pub fn sign(&self) -> f64 {
        self.current.summary.sign
    }

    /// Re-evaluates the (already mutated) vertices and accepts against
    /// `log_prior`, the log of the proposal density ratio.
    fn settle<R: Rng + ?Sized>(&mut self, log_prior: f64, rng: &mut R) -> Result<bool> {
        self.state = SamplerState::ProposalPending;
        let candidate = evaluate(&self.kinetic, &self.vertices, self.current.factorization.clone())?;
        let threshold: f64 = Exp1.sample(rng);
        let delta = candidate.summary.log_weight - self.log_weight() + log_prior;
        if candidate.summary.is_physical() && -threshold < delta {
            self.current = candidate;
            self.state = SamplerState::Accepted;
            Ok(true)
        } else {
            if !candidate.summary.is_physical() {
                debug!("{}", diagnostic(self.log_weight(), &candidate.summary));
            }
            self.state = SamplerState::Rejected;
            Ok(false)
        }
    }

    /// Negates one field on a random vertex; rejected outright without vertices.
    pub fn try_flip<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool> {
        if self.vertices.is_empty() {
            self.state = SamplerState::Rejected;
            return Ok(false);
        }
        let index = rng.gen_range(0..self.vertices.len());
        let site = [rng.gen_range(0..self.geometry.volume())];
        self.vertices.flip_many(index, &site);
        let outcome = self.settle(0.0, rng);
        if !matches!(outcome, Ok(true)) {
            self.vertices.flip_many(index, &site);
        }
        outcome
    }

    /// Adds a vertex with random fields at a uniform time in `[0, β)`.
    pub fn try_insert<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool> {
        let beta = self.parameters.beta;
        let time = rng.gen_range(0.0..beta);
        if self.vertices.has_vertex_at(time) {
            self.state = SamplerState::Rejected;
            return Ok(false);
        }
        let fields = self.vertices.draw_fields(rng);
        let index = self.vertices.insert(time, fields)?;
        let log_prior = beta.ln() - (self.vertices.len() as f64).ln();
        let outcome = self.settle(log_prior, rng);
        if !matches!(outcome, Ok(true)) {
            self.vertices.remove(index);
        }
        outcome
    }

    /// Removes a uniformly chosen vertex.
    pub fn try_remove<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool> {
        if self.vertices.is_empty() {
            self.state = SamplerState::Rejected;
            return Ok(false);
        }
        let index = rng.gen_range(0..self.vertices.len());
        let removed = self.vertices.remove(index);
        let log_prior = ((self.vertices.len() + 1) as f64).ln() - self.parameters.beta.ln();
        let outcome = self.settle(log_prior, rng);
        if !matches!(outcome, Ok(true)) {
            self.vertices.put_back(removed);
        }
        outcome
    }

    /// One flip, removal or insertion with probabilities 0.90, 0.05, 0.05.
    /// A removal drawn without vertices becomes a flip.
    pub fn metropolis_step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool> {
        let u: f64 = rng.gen();
        if u < FLIP_PROBABILITY || (u < FLIP_PROBABILITY + REMOVE_PROBABILITY && self.vertices.is_empty()) {
            self.try_flip(rng)
        } else if u < FLIP_PROBABILITY + REMOVE_PROBABILITY {
            self.try_remove(rng)
        } else {
            self.try_insert(rng)
        }
    }

    pub fn sweep<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for _ in 0..self.parameters.flips_per_sweep() {
            report.attempted += 1;
            let accepted = self.metropolis_step(rng)?;
            if accepted {
                report.accepted += 1;
            }
            report.acceptance.add(if accepted { 1.0 } else { 0.0 });
            report.sign.add(self.sign());
        }
        debug!(
            "continuous-time sweep: {}/{} accepted, {} vertices, log-weight {:.6}, sign {}",
            report.accepted,
            report.attempted,
            self.vertices.len(),
            self.log_weight(),
            self.sign()
        );
        Ok(report)
    }

    fn steps(&self) -> impl Iterator<Item = (&DMatrix<f64>, f64)> {
        self.current.steps.iter().zip(self.current.durations.iter().copied())
    }

    pub fn measure(&self) -> ObservableSample {
        self.extractor.extract(&self.current.factorization, self.steps())
    }

    /// G(τ, 0) at every vertex time and at β.
    pub fn time_displaced_greens(&self) -> Vec<TimeDisplacedGreens> {
        self.extractor.time_displaced_greens(&self.current.factorization, self.steps())
    }
}

fn diagnostic(current_log_weight: f64, summary: &RebuildSummary) -> PhaseDiagnostic {
    PhaseDiagnostic {
        flip: None,
        current_log_weight,
        rebuilt_log_weight: summary.log_weight,
        phase_cosine: summary.phase_cosine.unwrap_or(f64::NAN),
    }
}

/// One propagator per vertex, D_i·e^{-(t_i - t_{i-1})H₀}, then the closing e^{-(β - t_n)H₀}.
fn evaluate(
    kinetic: &SpectralPropagator,
    vertices: &VertexConfiguration,
    mut factorization: StabilizedFactorization,
) -> Result<Evaluation> {
    let v = vertices.volume();
    let durations = vertices.gaps();
    let mut steps = Vec::with_capacity(durations.len());
    for (i, &gap) in durations.iter().enumerate() {
        let mut step = DMatrix::identity(v, v);
        kinetic.evolve_columns(&mut step, gap);
        if let Some(vertex) = vertices.vertices().get(i) {
            for (x, sigma) in vertex.fields().iter().enumerate() {
                step.row_mut(x).scale_mut(1.0 + sigma);
            }
        }
        steps.push(step);
    }
    let summary = factorization.rebuild_from(&steps)?;
    trace!("evaluated {} vertices, log-weight {:.9}", vertices.len(), summary.log_weight);
    Ok(Evaluation { steps, durations, factorization, summary })
}

impl Replica for ContinuousTimeSimulation {
    fn start<R: Rng + ?Sized>(parameters: Parameters, _rng: &mut R) -> Result<Self> {
        ContinuousTimeSimulation::new(parameters)
    }

    fn resume(checkpoint: &Checkpoint) -> Result<Self> {
        ContinuousTimeSimulation::restore(checkpoint)
    }

    fn sweep<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<SweepReport> {
        ContinuousTimeSimulation::sweep(self, rng)
    }

    fn measure(&mut self) -> Result<ObservableSample> {
        Ok(ContinuousTimeSimulation::measure(self))
    }

    fn time_displaced_greens(&mut self) -> Result<Vec<TimeDisplacedGreens>> {
        Ok(ContinuousTimeSimulation::time_displaced_greens(self))
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn log_weight(&self) -> f64 {
        ContinuousTimeSimulation::log_weight(self)
    }

    fn sign(&self) -> f64 {
        ContinuousTimeSimulation::sign(self)
    }

    fn snapshot(&self) -> ReplicaState {
        ReplicaState::Vertices(self.vertices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::TimeDiscretization;
    use crate::propagator::TimeDirection;
    use crate::stabilization::Species;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn parameters() -> Parameters {
        let mut p = Parameters::new([2, 2, 1], 8, 1.5, -0.5);
        p.discretization = TimeDiscretization::Continuous;
        p.mu = 0.3;
        p.b = 0.4;
        p.max_update_size = 8;
        p
    }

    fn dense_log_weight(p: &Parameters, m: &DMatrix<f64>) -> f64 {
        let (up, dn) = p.fugacities();
        let v = m.nrows();
        let identity = DMatrix::<f64>::identity(v, v);
        [up, dn]
            .iter()
            .map(|&lambda| (&identity + m * lambda).lu().determinant().abs().ln())
            .sum()
    }

    fn kinetic(geometry: &LatticeGeometry, tau: f64) -> DMatrix<f64> {
        let mut e = DMatrix::identity(geometry.volume(), geometry.volume());
        SpectralPropagator::new(geometry, tau).apply_columns(&mut e, TimeDirection::Forward);
        e
    }

    #[test]
    fn no_vertices_is_the_free_gas() {
        let p = parameters();
        let sim = ContinuousTimeSimulation::new(p.clone()).unwrap();
        let (up, dn) = p.fugacities();
        let expected: f64 = sim
            .geometry()
            .dispersion()
            .iter()
            .map(|&e| (1.0 + up * (-p.beta * e).exp()).ln() + (1.0 + dn * (-p.beta * e).exp()).ln())
            .sum();
        assert_relative_eq!(sim.log_weight(), expected, epsilon = 1e-10);
        assert_eq!(sim.sign(), 1.0);
        assert_eq!(sim.time_displaced_greens().len(), 1);
    }

    #[test]
    fn single_vertex_matches_dense_product() {
        let p = parameters();
        let a = p.vertex_magnitude().unwrap();
        let mut vertices = VertexConfiguration::empty(p.beta, 4, a).unwrap();
        vertices.insert(0.6, vec![a, -a, -a, a]).unwrap();
        let sim = ContinuousTimeSimulation::with_vertices(p.clone(), vertices).unwrap();

        let g = sim.geometry();
        let d = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0 + a, 1.0 - a, 1.0 - a, 1.0 + a]));
        let m = kinetic(g, p.beta - 0.6) * d * kinetic(g, 0.6);
        assert_relative_eq!(sim.log_weight(), dense_log_weight(&p, &m), epsilon = 1e-9);

        let displaced = sim.time_displaced_greens();
        assert_eq!(displaced.len(), 2);
        assert_relative_eq!(displaced[0].tau, 0.6, epsilon = 1e-15);
        assert_relative_eq!(displaced[1].up, *sim.factorization().greens(Species::Up), epsilon = 1e-9);
    }

    #[test]
    fn moves_keep_the_weight_consistent() {
        let p = parameters();
        let mut rng = Pcg64::seed_from_u64(21);
        let mut sim = ContinuousTimeSimulation::new(p.clone()).unwrap();
        let mut accepted = 0;
        for _ in 0..400 {
            if sim.try_insert(&mut rng).unwrap() {
                accepted += 1;
            }
            if sim.vertices().len() >= 3 {
                break;
            }
        }
        assert!(accepted >= 3, "no insertion accepted");
        for _ in 0..10 {
            let report = sim.sweep(&mut rng).unwrap();
            assert_eq!(report.attempted, 8);
            assert_eq!(report.acceptance.samples(), 8);
            assert_eq!(report.warnings(), 0);
            let fresh = ContinuousTimeSimulation::with_vertices(p.clone(), sim.vertices().clone()).unwrap();
            assert_relative_eq!(sim.log_weight(), fresh.log_weight(), epsilon = 1e-9);
            assert_eq!(sim.sign(), fresh.sign());
        }
        let sample = sim.measure();
        assert!(sample.density.is_finite());
        assert!(sample.chi_d.is_finite());
    }

    #[test]
    fn rejected_removal_puts_the_vertex_back() {
        let p = parameters();
        let a = p.vertex_magnitude().unwrap();
        let mut vertices = VertexConfiguration::empty(p.beta, 4, a).unwrap();
        vertices.insert(0.2, vec![a; 4]).unwrap();
        vertices.insert(1.1, vec![-a; 4]).unwrap();
        let mut sim = ContinuousTimeSimulation::with_vertices(p, vertices.clone()).unwrap();
        let mut rng = Pcg64::seed_from_u64(5);
        for _ in 0..20 {
            let before = sim.vertices().clone();
            let weight = sim.log_weight();
            if !sim.try_remove(&mut rng).unwrap() {
                assert_eq!(sim.vertices(), &before);
                assert_eq!(sim.log_weight(), weight);
                assert_eq!(sim.state(), SamplerState::Rejected);
            }
        }
    }

    #[test]
    fn checkpoints_are_tied_to_their_discretization() {
        let p = parameters();
        let mut rng = Pcg64::seed_from_u64(2);
        let mut sim = ContinuousTimeSimulation::new(p.clone()).unwrap();
        sim.sweep(&mut rng).unwrap();
        let checkpoint = Checkpoint {
            parameters: p,
            state: sim.snapshot(),
            rng,
            summaries: Default::default(),
            thermalization_done: 1,
            sweeps_done: 0,
        };
        let restored = ContinuousTimeSimulation::restore(&checkpoint).unwrap();
        assert_relative_eq!(restored.log_weight(), sim.log_weight(), epsilon = 1e-12);
        assert!(crate::sampling::Simulation::restore(&checkpoint).is_err());
    }

    #[test]
    fn rejects_unsupported_parameters() {
        let mut p = parameters();
        p.h = 0.2;
        assert!(matches!(
            ContinuousTimeSimulation::new(p.clone()),
            Err(DqmcError::InvalidParameters { name: "h", .. })
        ));
        p.h = 0.0;
        p.u = -2.0;
        assert!(ContinuousTimeSimulation::new(p).is_err());
    }
}
