//! Metropolis control loop over the auxiliary fields of one replica.
//!
//! The loop proposes flips inside the first slice window, tracks the weight
//! incrementally through the update batch and periodically rebuilds
//! everything from the raw fields to check that the tracking did not drift.
//! Whole-site flips bypass the low-rank machinery and are accepted on a full
//! re-evaluation.

use std::collections::VecDeque;

use log::{debug, trace, warn};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Exp1};

use super::traits::Replica;
use super::update::{DeterminantUpdateEngine, Proposal};
use crate::error::{Consistency, DqmcError, DriftReport, PhaseDiagnostic, Result};
use crate::field::{FieldConfiguration, Staleness};
use crate::io::{Checkpoint, Coupling, Parameters, ReplicaState};
use crate::lattice::LatticeGeometry;
use crate::observables::{Measurement, ObservableExtractor, ObservableSample, TimeDisplacedGreens};
use crate::propagator::{SliceAccumulator, SliceCache};
use crate::stabilization::{RebuildSummary, StabilizedFactorization};

/// Fold-in reports kept between two sweeps or calls to
/// [`Simulation::take_fold_ins`]; older ones are dropped.
pub const FOLD_IN_HISTORY: usize = 64;

/// Where the sampler is in its propose/accept/resynchronize cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    ProposalPending,
    Accepted,
    Rejected,
    Resynchronizing,
}

/// Outcome of one rebuild-and-verify pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncReport {
    /// Slices recomputed from the fields.
    pub rebuilt_slices: usize,
    /// Pending flips folded in.
    pub folded_flips: usize,
    pub consistency: Consistency,
    pub log_weight: f64,
    pub sign: f64,
}

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub attempted: usize,
    pub accepted: usize,
    pub site_flips_attempted: usize,
    pub site_flips_accepted: usize,
    /// 1 or 0 per Metropolis step.
    pub acceptance: Measurement,
    /// Sign of the configuration after every Metropolis step.
    pub sign: Measurement,
    pub resyncs: Vec<ResyncReport>,
}

impl SweepReport {
    pub fn acceptance_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.accepted as f64 / self.attempted as f64
        }
    }

    /// Number of resynchronizations that reported drift.
    pub fn warnings(&self) -> usize {
        self.resyncs.iter().filter(|r| !r.consistency.is_ok()).count()
    }
}

/// One replica: fields, caches, factorization and acceptance state.
#[derive(Debug, Clone)]
pub struct Simulation {
    parameters: Parameters,
    geometry: LatticeGeometry,
    coupling: Coupling,
    accumulator: SliceAccumulator,
    fields: FieldConfiguration,
    cache: SliceCache,
    factorization: StabilizedFactorization,
    engine: DeterminantUpdateEngine,
    extractor: ObservableExtractor,
    plog: f64,
    psign: f64,
    state: SamplerState,
    last_flip: Option<(usize, usize)>,
    fold_ins: VecDeque<ResyncReport>,
}

impl Simulation {
    /// Builds a replica with fields drawn from `rng`.
    pub fn new<R: Rng + ?Sized>(parameters: Parameters, rng: &mut R) -> Result<Self> {
        parameters.validate()?;
        let coupling = parameters.coupling()?;
        let volume = parameters.extents().iter().product();
        let fields = FieldConfiguration::initialize(
            parameters.time_slices,
            volume,
            coupling.a,
            parameters.init_probability,
            rng,
        )?;
        Self::with_fields(parameters, fields)
    }

    /// Builds a replica around an existing field configuration.
    pub fn with_fields(parameters: Parameters, fields: FieldConfiguration) -> Result<Self> {
        parameters.validate()?;
        fields.validate()?;
        let coupling = parameters.coupling()?;
        let geometry = LatticeGeometry::new(parameters.extents(), parameters.hoppings(), parameters.h)?;
        let volume = geometry.volume();
        if fields.time_slices() != parameters.time_slices || fields.volume() != volume {
            return Err(DqmcError::invalid(
                "fields",
                format!(
                    "configuration is {}x{}, parameters need {}x{volume}",
                    fields.time_slices(),
                    fields.volume(),
                    parameters.time_slices
                ),
            ));
        }
        if (fields.magnitude() - coupling.a).abs() > 1e-12 * coupling.a.max(1.0) {
            return Err(DqmcError::invalid(
                "fields",
                format!("field magnitude {} does not match A = {}", fields.magnitude(), coupling.a),
            ));
        }

        let accumulator = SliceAccumulator::new(&geometry, &coupling, parameters.order);
        let cache = SliceCache::new(parameters.time_slices, parameters.block_length(), volume);
        let factorization = StabilizedFactorization::new(
            volume,
            parameters.fugacities(),
            parameters.stabilization,
            parameters.blocks_per_svd,
            parameters.verify_phase,
        );
        let engine = DeterminantUpdateEngine::new(volume, parameters.batch_capacity());
        let extractor = ObservableExtractor::new(&geometry, &parameters);

        let mut simulation = Self {
            parameters,
            geometry,
            coupling,
            accumulator,
            fields,
            cache,
            factorization,
            engine,
            extractor,
            plog: 0.0,
            psign: 1.0,
            state: SamplerState::Resynchronizing,
            last_flip: None,
            fold_ins: VecDeque::new(),
        };
        simulation.cache.refresh(&simulation.accumulator, &simulation.fields);
        let summary = simulation.factorization.rebuild(&simulation.cache)?;
        if !summary.is_physical() {
            return Err(DqmcError::NonPhysicalWeight(Box::new(simulation.diagnostic(&summary))));
        }
        simulation.anchor(&summary);
        Ok(simulation)
    }

    /// Rebuilds a replica from a checkpoint; caches and factorizations are recomputed.
    pub fn restore(checkpoint: &Checkpoint) -> Result<Self> {
        match &checkpoint.state {
            ReplicaState::Fields(fields) => Self::with_fields(checkpoint.parameters.clone(), fields.clone()),
            ReplicaState::Vertices(_) => Err(DqmcError::invalid(
                "checkpoint",
                "holds continuous-time vertices, not Trotter fields",
            )),
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn geometry(&self) -> &LatticeGeometry {
        &self.geometry
    }

    pub fn coupling(&self) -> &Coupling {
        &self.coupling
    }

    pub fn fields(&self) -> &FieldConfiguration {
        &self.fields
    }

    pub fn cache(&self) -> &SliceCache {
        &self.cache
    }

    pub fn factorization(&self) -> &StabilizedFactorization {
        &self.factorization
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Accepted flips not yet folded into the factorization.
    pub fn pending_flips(&self) -> usize {
        self.engine.batch().len()
    }

    /// Log-weight change of the pending flips.
    pub fn pending_log_weight(&self) -> f64 {
        self.engine.batch().log_weight()
    }

    /// Tracked ln|weight| of the current configuration.
    pub fn log_weight(&self) -> f64 {
        self.plog + self.engine.batch().log_weight()
    }

    /// Tracked sign of the current configuration.
    pub fn sign(&self) -> f64 {
        self.psign * self.engine.batch().sign()
    }

    fn anchor(&mut self, summary: &RebuildSummary) {
        self.plog = summary.log_weight;
        self.psign = summary.sign;
        self.engine.reset(&self.accumulator, &self.fields, &self.cache);
        self.state = SamplerState::Idle;
    }

    fn diagnostic(&self, summary: &RebuildSummary) -> PhaseDiagnostic {
        PhaseDiagnostic {
            flip: self.last_flip,
            current_log_weight: self.log_weight(),
            rebuilt_log_weight: summary.log_weight,
            phase_cosine: summary.phase_cosine.unwrap_or(f64::NAN),
        }
    }

    /// Weight change for negating the fields of `sites` at logical time `time`.
    ///
    /// `time` must lie in the first slice window and the sites must be
    /// distinct. A batch without room for the proposal is folded in first.
    pub fn propose(&mut self, time: usize, sites: Vec<usize>) -> Result<Proposal> {
        let window = self.engine.window();
        if !window.contains(&time) {
            return Err(DqmcError::invalid("time", format!("{time} outside the flip window {window:?}")));
        }
        let volume = self.geometry.volume();
        if sites.is_empty() || sites.len() > self.engine.batch().capacity() {
            return Err(DqmcError::invalid(
                "sites",
                format!("a proposal flips 1..={} sites, got {}", self.engine.batch().capacity(), sites.len()),
            ));
        }
        for (i, &x) in sites.iter().enumerate() {
            if x >= volume || sites[..i].contains(&x) {
                return Err(DqmcError::invalid("sites", format!("site {x} is out of range or repeated")));
            }
        }
        if !self.engine.batch().has_room(sites.len()) {
            let report = self.resynchronize()?;
            self.record_fold_in(report);
        }

        self.last_flip = Some((time, sites[0]));
        let proposal = self.engine.propose(&self.accumulator, &self.fields, &self.factorization, time, sites);
        self.state = SamplerState::ProposalPending;
        Ok(proposal)
    }

    /// Applies a proposal; folds the batch in once it is full.
    pub fn accept(&mut self, proposal: Proposal) -> Result<()> {
        trace!("accepting flip t={} sites={:?}", proposal.time(), proposal.sites());
        self.engine.accept(proposal, &mut self.fields, &mut self.cache);
        self.state = SamplerState::Accepted;
        if self.engine.batch().is_full() {
            let report = self.resynchronize()?;
            self.record_fold_in(report);
        }
        Ok(())
    }

    pub fn reject(&mut self, _proposal: Proposal) {
        self.state = SamplerState::Rejected;
    }

    /// One Metropolis step at a random site of the flip window; returns whether it was accepted.
    pub fn metropolis_step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool> {
        let time = rng.gen_range(self.engine.window());
        let site = rng.gen_range(0..self.geometry.volume());
        let proposal = self.propose(time, vec![site])?;
        let threshold: f64 = Exp1.sample(rng);
        if -threshold < proposal.delta(self.engine.batch()) {
            self.accept(proposal)?;
            Ok(true)
        } else {
            self.reject(proposal);
            Ok(false)
        }
    }

    /// Negates the field of `site` at every time and accepts on a full
    /// re-evaluation of the weight. Pending flips are folded in first; a
    /// non-physical candidate is rejected.
    pub fn try_site_flip<R: Rng + ?Sized>(&mut self, site: usize, rng: &mut R) -> Result<bool> {
        let volume = self.geometry.volume();
        if site >= volume {
            return Err(DqmcError::invalid("site", format!("{site} outside a lattice of {volume} sites")));
        }
        self.fold_pending()?;
        let cache = self.cache.clone();
        let factorization = self.factorization.clone();
        self.last_flip = Some((0, site));
        self.state = SamplerState::ProposalPending;

        let staleness = self.fields.flip_all_times(site);
        self.cache.invalidate(staleness);
        self.cache.refresh(&self.accumulator, &self.fields);
        let candidate = self.factorization.rebuild(&self.cache);
        let summary = match candidate {
            Ok(summary) => summary,
            Err(e) => {
                self.revert_site_flip(site, cache, factorization);
                return Err(e);
            }
        };
        let threshold: f64 = Exp1.sample(rng);
        if summary.is_physical() && -threshold < summary.log_weight - self.plog {
            trace!("accepting site flip x={site}, log-weight {:.6}", summary.log_weight);
            self.anchor(&summary);
            self.state = SamplerState::Accepted;
            Ok(true)
        } else {
            if !summary.is_physical() {
                debug!("site flip x={site} leads to a non-physical weight, rejected");
            }
            self.revert_site_flip(site, cache, factorization);
            Ok(false)
        }
    }

    fn revert_site_flip(&mut self, site: usize, cache: SliceCache, factorization: StabilizedFactorization) {
        self.fields.flip_all_times(site);
        self.cache = cache;
        self.factorization = factorization;
        self.state = SamplerState::Rejected;
    }

    /// `flips_per_sweep` Metropolis steps, `site_flips` whole-site flips, a
    /// random time-origin shift and a verified rebuild of every slice.
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
        for _ in 0..self.parameters.site_flips {
            let site = rng.gen_range(0..self.geometry.volume());
            report.site_flips_attempted += 1;
            if self.try_site_flip(site, rng)? {
                report.site_flips_accepted += 1;
            }
        }
        let shift = rng.gen_range(0..self.parameters.time_slices) as isize;
        self.fields.shift_origin(shift);
        self.cache.invalidate(Staleness::All);
        let resync = self.resynchronize()?;
        report.resyncs.extend(self.fold_ins.drain(..));
        report.resyncs.push(resync);
        debug!(
            "sweep: {}/{} accepted, log-weight {:.6}, sign {}",
            report.accepted,
            report.attempted,
            self.log_weight(),
            self.sign()
        );
        Ok(report)
    }

    /// Refreshes stale slices, rebuilds the factorization and checks it
    /// against the tracked weight. The rebuilt values become the new truth.
    pub fn resynchronize(&mut self) -> Result<ResyncReport> {
        self.state = SamplerState::Resynchronizing;
        let folded_flips = self.engine.batch().len();
        let tracked_log_weight = self.log_weight();
        let tracked_sign = self.sign();

        let rebuilt_slices = self.cache.refresh(&self.accumulator, &self.fields);
        let summary = self.factorization.rebuild(&self.cache)?;
        let consistency = if !summary.is_physical() {
            Consistency::Fatal(Box::new(self.diagnostic(&summary)))
        } else {
            let drift = DriftReport {
                tracked_log_weight,
                rebuilt_log_weight: summary.log_weight,
                tracked_sign,
                rebuilt_sign: summary.sign,
            };
            if drift.log_weight_error().abs() > self.parameters.drift_tolerance || !drift.sign_agrees() {
                warn!(
                    "weight drift after {folded_flips} pending flips: log-weight {:e}, sign {} -> {}",
                    drift.log_weight_error(),
                    tracked_sign,
                    summary.sign
                );
                Consistency::Warning(drift)
            } else {
                Consistency::Ok
            }
        };
        let consistency = consistency.into_result()?;
        debug!("resynchronized {rebuilt_slices} slices, {folded_flips} pending flips, log-weight {:.9}", summary.log_weight);

        self.anchor(&summary);
        Ok(ResyncReport {
            rebuilt_slices,
            folded_flips,
            consistency,
            log_weight: summary.log_weight,
            sign: summary.sign,
        })
    }

    fn fold_pending(&mut self) -> Result<()> {
        if !self.engine.batch().is_empty() || !self.cache.is_valid() {
            let report = self.resynchronize()?;
            self.record_fold_in(report);
        }
        Ok(())
    }

    fn record_fold_in(&mut self, report: ResyncReport) {
        if self.fold_ins.len() == FOLD_IN_HISTORY {
            self.fold_ins.pop_front();
        }
        self.fold_ins.push_back(report);
    }

    /// Slice propagators with their imaginary-time durations, earliest first.
    fn steps(&self) -> impl Iterator<Item = (&DMatrix<f64>, f64)> {
        let dt = self.coupling.dt;
        self.cache.slices().iter().map(move |slice| (&slice.matrix, (slice.end - slice.start) as f64 * dt))
    }

    /// Measures every observable, folding pending flips in first.
    pub fn measure(&mut self) -> Result<ObservableSample> {
        self.fold_pending()?;
        Ok(self.extractor.extract(&self.factorization, self.steps()))
    }

    /// G(τ, 0) at the end of every slice, folding pending flips in first.
    pub fn time_displaced_greens(&mut self) -> Result<Vec<TimeDisplacedGreens>> {
        self.fold_pending()?;
        Ok(self.extractor.time_displaced_greens(&self.factorization, self.steps()))
    }

    /// Reports of fold-ins that happened outside [`sweep`](Self::sweep), at
    /// most the last [`FOLD_IN_HISTORY`].
    pub fn take_fold_ins(&mut self) -> Vec<ResyncReport> {
        std::mem::take(&mut self.fold_ins).into()
    }
}

impl Replica for Simulation {
    fn start<R: Rng + ?Sized>(parameters: Parameters, rng: &mut R) -> Result<Self> {
        Simulation::new(parameters, rng)
    }

    fn resume(checkpoint: &Checkpoint) -> Result<Self> {
        Simulation::restore(checkpoint)
    }

    fn sweep<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<SweepReport> {
        Simulation::sweep(self, rng)
    }

    fn measure(&mut self) -> Result<ObservableSample> {
        Simulation::measure(self)
    }

    fn time_displaced_greens(&mut self) -> Result<Vec<TimeDisplacedGreens>> {
        Simulation::time_displaced_greens(self)
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn log_weight(&self) -> f64 {
        Simulation::log_weight(self)
    }

    fn sign(&self) -> f64 {
        Simulation::sign(self)
    }

    fn snapshot(&self) -> ReplicaState {
        ReplicaState::Fields(self.fields.clone())
    }
}
