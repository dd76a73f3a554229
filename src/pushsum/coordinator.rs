use rand::{rngs::StdRng, SeedableRng};

use super::{
    ledger::MassLedger,
    reader::EstimateReader,
    state::{NoPartnerPolicy, NodeState, Phase},
};
use crate::common::{
    config::{RoundOptions, Termination},
    error::{PushSumError, Result},
};
use crate::network::{NodeId, Overlay};

/*
    A round is two phases over the whole population:

      1. broadcast: every node asks the overlay for a partner, keeps half of its
         (value, weight) and hands the other half to the partner's buffers.
      2. commit: every node replaces its state with its buffers and clears them.

    No node may commit before every node has broadcast. The sequential
    coordinator enforces that by construction: `begin_round` hands out a
    `BroadcastPhase`, which only turns into a `CommitPhase` once every node has
    broadcast. A round that is abandoned half way (dropped, or failed) is rolled
    back to the snapshot taken when it began, so a partial round is never
    committed.
*/

/// What one completed round looked like.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoundReport {
    pub round: u64,
    /// Largest change of any node's estimate compared to the previous round.
    pub max_delta: f64,
    /// Nodes that found no partner this round.
    pub isolated: usize,
    /// Mass dropped this round by the lossy no-partner policy.
    pub lost_value: f64,
    pub lost_weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub rounds: u64,
    /// Whether a convergence tolerance was reached. Always false for a
    /// fixed-round run.
    pub converged: bool,
    pub last_delta: Option<f64>,
}

/// Decides after each round whether a run should stop.
pub(crate) struct RunTracker {
    termination: Termination,
    rounds: u64,
    converged: bool,
    last_delta: Option<f64>,
}

impl RunTracker {
    pub(crate) fn new(termination: Termination) -> Self {
        RunTracker {
            termination,
            rounds: 0,
            converged: false,
            last_delta: None,
        }
    }

    pub(crate) fn should_continue(&self) -> bool {
        !self.converged && self.rounds < self.termination.max_rounds()
    }

    pub(crate) fn observe(&mut self, report: &RoundReport) {
        self.rounds += 1;
        self.last_delta = Some(report.max_delta);
        if let Termination::Converged { tolerance, .. } = self.termination {
            self.converged = report.max_delta <= tolerance;
        }
    }

    pub(crate) fn summary(&self) -> RunSummary {
        RunSummary {
            rounds: self.rounds,
            converged: self.converged,
            last_delta: self.last_delta,
        }
    }
}

pub(crate) fn max_delta(previous: &[f64], next: &[f64]) -> f64 {
    previous
        .iter()
        .zip(next)
        .fold(0.0, |acc: f64, (a, b)| acc.max((a - b).abs()))
}

/// Runs the priming commit over freshly initialized nodes.
pub(crate) fn prime(states: &mut [NodeState]) -> Result<()> {
    for state in states.iter_mut() {
        match state.phase() {
            Phase::Priming => state.commit()?,
            Phase::Uninitialized => return Err(PushSumError::NotInitialized { node: state.id() }),
            actual => {
                return Err(PushSumError::PhaseOrder {
                    node: state.id(),
                    expected: Phase::Priming,
                    actual,
                })
            }
        }
    }
    Ok(())
}

/// Checks that the overlay and the node list describe the same population.
pub(crate) fn check_population<O: Overlay + ?Sized>(overlay: &O, states: &[NodeState]) -> Result<()> {
    if overlay.len() != states.len() {
        return Err(PushSumError::Config(format!(
            "overlay has {} nodes, population has {}",
            overlay.len(),
            states.len()
        )));
    }
    for (i, state) in states.iter().enumerate() {
        if state.id() != NodeId(i) {
            return Err(PushSumError::Config(format!("node {} stored at index {}", state.id(), i)));
        }
    }
    Ok(())
}

/// Single-threaded round coordinator.
pub struct Coordinator<O: Overlay> {
    overlay: O,
    states: Vec<NodeState>,
    options: RoundOptions,
    rng: StdRng,
    ledger: MassLedger,
    estimates: Vec<f64>,
    round: u64,
    halted: bool,
}

impl<O: Overlay> Coordinator<O> {
    /// Takes ownership of initialized nodes and performs the priming commit.
    pub fn new(overlay: O, mut states: Vec<NodeState>, options: RoundOptions) -> Result<Self> {
        check_population(&overlay, &states)?;
        prime(&mut states)?;

        let ledger = MassLedger::open(&states, options.conservation_tolerance);
        let estimates = states.iter().map(NodeState::estimate).collect::<Result<Vec<_>>>()?;
        let (value, weight) = ledger.initial();
        tracing::info!(nodes = states.len(), total_value = value, total_weight = weight, "coordinator primed");

        Ok(Coordinator {
            overlay,
            states,
            options,
            rng: StdRng::seed_from_u64(options.seed),
            ledger,
            estimates,
            round: 0,
            halted: false,
        })
    }

    /// Completed rounds.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn states(&self) -> &[NodeState] {
        &self.states
    }

    pub fn ledger(&self) -> &MassLedger {
        &self.ledger
    }

    pub fn reader(&self) -> EstimateReader<'_> {
        EstimateReader::new(&self.states)
    }

    pub fn overlay(&self) -> &O {
        &self.overlay
    }

    /// Opens the broadcast phase of the next round.
    pub fn begin_round(&mut self) -> Result<BroadcastPhase<'_, O>> {
        if self.halted {
            return Err(PushSumError::Halted);
        }
        let dirty = self.states.iter().find_map(|s| s.ensure_quiescent().err());
        if let Some(err) = dirty {
            return Err(self.halt(err));
        }

        let size = self.states.len();
        let round = self.round + 1;
        tracing::trace!(round, "broadcast phase open");
        Ok(BroadcastPhase(RoundInProgress {
            snapshot: self.states.clone(),
            coordinator: self,
            round,
            broadcast: vec![false; size],
            isolated: 0,
            lost_value: 0.0,
            lost_weight: 0.0,
            armed: true,
        }))
    }

    /// One full round: broadcast everywhere, then commit everywhere.
    pub fn run_round(&mut self) -> Result<RoundReport> {
        let mut phase = self.begin_round()?;
        phase.broadcast_all()?;
        phase.finish()?.commit()
    }

    pub fn run(&mut self, termination: Termination) -> Result<RunSummary> {
        tracing::info!(nodes = self.states.len(), ?termination, "starting sequential run");
        let mut tracker = RunTracker::new(termination);
        while tracker.should_continue() {
            let report = self.run_round()?;
            tracker.observe(&report);
        }

        let summary = tracker.summary();
        tracing::info!(
            rounds = summary.rounds,
            converged = summary.converged,
            last_delta = ?summary.last_delta,
            "run finished"
        );
        Ok(summary)
    }

    fn halt(&mut self, error: PushSumError) -> PushSumError {
        if error.is_fatal() {
            self.halted = true;
            tracing::error!(round = self.round + 1, %error, "coordinator halted");
        }
        error
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.halt(e))
    }
}

struct RoundInProgress<'a, O: Overlay> {
    coordinator: &'a mut Coordinator<O>,
    snapshot: Vec<NodeState>,
    round: u64,
    broadcast: Vec<bool>,
    isolated: usize,
    lost_value: f64,
    lost_weight: f64,
    /// Roll back to `snapshot` when dropped.
    armed: bool,
}

impl<O: Overlay> Drop for RoundInProgress<'_, O> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.states.copy_from_slice(&self.snapshot);
            tracing::debug!(round = self.round, "round rolled back");
        }
    }
}

/// First phase of a round. Obtained from [`Coordinator::begin_round`].
pub struct BroadcastPhase<'a, O: Overlay>(RoundInProgress<'a, O>);

impl<'a, O: Overlay> BroadcastPhase<'a, O> {
    pub fn round(&self) -> u64 {
        self.0.round
    }

    /// Nodes that have not broadcast yet.
    pub fn pending(&self) -> usize {
        self.0.broadcast.iter().filter(|done| !**done).count()
    }

    /// Broadcasts one node to the partner the overlay picks for it.
    pub fn broadcast(&mut self, id: NodeId) -> Result<()> {
        let round = self.0.round;
        let policy = self.0.coordinator.options.no_partner;
        let c = &mut *self.0.coordinator;
        let size = c.states.len();
        if id.0 >= size {
            return Err(PushSumError::UnknownNode { node: id, size });
        }

        let partner = c.overlay.neighbor_for(id, round, &mut c.rng);
        if let Some(p) = partner {
            if p.0 >= size {
                return Err(c.halt(PushSumError::RoundAborted {
                    round,
                    reason: format!("overlay picked unknown node {} for {}", p, id),
                }));
            }
        }

        let result = c.states[id.0].broadcast(partner, policy);
        match c.guard(result)? {
            Some(share) => {
                let result = c.states[share.to.0].receive(&share);
                c.guard(result)?;
            }
            None => {
                self.0.isolated += 1;
                if policy == NoPartnerPolicy::Discard {
                    let state = &c.states[id.0];
                    self.0.lost_value += state.value() / 2.0;
                    self.0.lost_weight += state.weight() / 2.0;
                }
                tracing::trace!(round, node = %id, ?policy, "no partner");
            }
        }
        self.0.broadcast[id.0] = true;
        Ok(())
    }

    /// Broadcasts every node that has not broadcast yet.
    pub fn broadcast_all(&mut self) -> Result<()> {
        for i in 0..self.0.broadcast.len() {
            if !self.0.broadcast[i] {
                self.broadcast(NodeId(i))?;
            }
        }
        Ok(())
    }

    /// Passes the barrier. Fails, rolls back and halts the coordinator if any
    /// node has not broadcast.
    pub fn finish(mut self) -> Result<CommitPhase<'a, O>> {
        let pending = self.pending();
        if pending > 0 {
            let err = PushSumError::IncompleteBroadcast { round: self.0.round, pending };
            return Err(self.0.coordinator.halt(err));
        }
        Ok(CommitPhase(self.0))
    }
}

/// Second phase of a round; every node has broadcast.
pub struct CommitPhase<'a, O: Overlay>(RoundInProgress<'a, O>);

impl<O: Overlay> CommitPhase<'_, O> {
    pub fn round(&self) -> u64 {
        self.0.round
    }

    pub fn commit(mut self) -> Result<RoundReport> {
        let round = self.0.round;
        let (lost_value, lost_weight) = (self.0.lost_value, self.0.lost_weight);
        let c = &mut *self.0.coordinator;

        for i in 0..c.states.len() {
            let result = c.states[i].commit();
            c.guard(result)?;
        }

        let mut ledger = c.ledger;
        ledger.record_loss(lost_value, lost_weight);
        let verified = ledger.verify(round, &c.states);
        c.guard(verified)?;

        let estimates = c.states.iter().map(NodeState::estimate).collect::<Result<Vec<_>>>();
        let estimates = c.guard(estimates)?;
        let max_delta = max_delta(&c.estimates, &estimates);

        c.ledger = ledger;
        c.estimates = estimates;
        c.round = round;
        self.0.armed = false;

        if self.0.isolated > 0 && c.options.no_partner == NoPartnerPolicy::Discard {
            tracing::warn!(round, isolated = self.0.isolated, lost_value, lost_weight, "mass dropped by isolated nodes");
        }
        tracing::debug!(round, max_delta, isolated = self.0.isolated, "round committed");
        for state in &c.states {
            tracing::trace!(round, node = %state.id(), state = %state, "committed");
        }

        Ok(RoundReport {
            round,
            max_delta,
            isolated: self.0.isolated,
            lost_value,
            lost_weight,
        })
    }
}
