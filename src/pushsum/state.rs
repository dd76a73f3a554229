use std::fmt;

use serde::{Deserialize, Serialize};

use super::message::Share;
use crate::common::error::{PushSumError, Result};
use crate::network::NodeId;

/// Where a node stands in the round cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    /// Value and/or weight not yet set.
    Uninitialized,
    /// Initialized; buffers mirror the initial state until the priming commit.
    Priming,
    AwaitingBroadcast,
    AwaitingCommit,
}

/// What happens to the gossip half when the overlay offers no partner.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoPartnerPolicy {
    /// The second half is dropped. Mass leaves the system for that round.
    #[default]
    Discard,
    /// The node keeps the second half too, conserving mass.
    Retain,
}

/// Push-Sum state of a single node.
///
/// `value` and `weight` are only written by [`NodeState::commit`]; shares for
/// the round in progress accumulate in the buffers. The struct is flat, so a
/// snapshot is a plain copy.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct NodeState {
    id: NodeId,
    true_value: f64,
    value: f64,
    weight: f64,
    value_buffer: f64,
    weight_buffer: f64,
    value_set: bool,
    weight_set: bool,
    phase: Phase,
    /// Rounds committed since priming.
    round: u64,
}

impl NodeState {
    pub fn new(id: NodeId) -> Self {
        NodeState {
            id,
            true_value: 0.0,
            value: 0.0,
            weight: 0.0,
            value_buffer: 0.0,
            weight_buffer: 0.0,
            value_set: false,
            weight_set: false,
            phase: Phase::Uninitialized,
            round: 0,
        }
    }

    pub fn initialize_value(&mut self, value: f64) -> Result<()> {
        if self.value_set || self.phase != Phase::Uninitialized {
            return Err(PushSumError::AlreadyInitialized { node: self.id });
        }
        if !value.is_finite() {
            return Err(PushSumError::InvalidValue { node: self.id, value });
        }
        self.true_value = value;
        self.value = value;
        self.value_buffer = value;
        self.value_set = true;
        self.advance_initialization();
        Ok(())
    }

    pub fn initialize_weight(&mut self, weight: f64) -> Result<()> {
        if self.weight_set || self.phase != Phase::Uninitialized {
            return Err(PushSumError::AlreadyInitialized { node: self.id });
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(PushSumError::InvalidWeight { node: self.id, weight });
        }
        self.weight = weight;
        self.weight_buffer = weight;
        self.weight_set = true;
        self.advance_initialization();
        Ok(())
    }

    fn advance_initialization(&mut self) {
        if self.value_set && self.weight_set {
            self.phase = Phase::Priming;
        }
    }

    /// Sends half of the committed state to this node's own buffers and
    /// returns the other half addressed to `partner`.
    ///
    /// Without a partner the second half is dropped under
    /// [`NoPartnerPolicy::Discard`] and kept under [`NoPartnerPolicy::Retain`];
    /// either way no share is returned.
    pub fn broadcast(&mut self, partner: Option<NodeId>, policy: NoPartnerPolicy) -> Result<Option<Share>> {
        self.expect_phase(Phase::AwaitingBroadcast)?;
        if partner == Some(self.id) {
            return Err(PushSumError::SelfPartner { node: self.id });
        }

        let half = self.value / 2.0;
        let half_weight = self.weight / 2.0;

        self.value_buffer += half;
        self.weight_buffer += half_weight;
        self.phase = Phase::AwaitingCommit;

        match partner {
            Some(to) => Ok(Some(Share {
                round: self.round_in_progress(),
                from: self.id,
                to,
                value: half,
                weight: half_weight,
            })),
            None => {
                if policy == NoPartnerPolicy::Retain {
                    self.value_buffer += half;
                    self.weight_buffer += half_weight;
                }
                Ok(None)
            }
        }
    }

    /// Folds a share from the round in progress into the buffers.
    pub fn receive(&mut self, share: &Share) -> Result<()> {
        match self.phase {
            Phase::AwaitingBroadcast | Phase::AwaitingCommit => {}
            actual => {
                return Err(PushSumError::PhaseOrder {
                    node: self.id,
                    expected: Phase::AwaitingBroadcast,
                    actual,
                })
            }
        }
        if share.to != self.id {
            return Err(PushSumError::Misaddressed { node: self.id, to: share.to });
        }
        if share.round != self.round_in_progress() {
            return Err(PushSumError::StaleShare {
                node: self.id,
                from: share.from,
                expected: self.round_in_progress(),
                got: share.round,
            });
        }
        self.value_buffer += share.value;
        self.weight_buffer += share.weight;
        Ok(())
    }

    /// Buffers become the committed state and are reset to zero.
    pub fn commit(&mut self) -> Result<()> {
        match self.phase {
            Phase::Priming => {}
            Phase::AwaitingCommit => self.round += 1,
            Phase::Uninitialized => return Err(PushSumError::NotInitialized { node: self.id }),
            actual => {
                return Err(PushSumError::PhaseOrder {
                    node: self.id,
                    expected: Phase::AwaitingCommit,
                    actual,
                })
            }
        }
        self.value = self.value_buffer;
        self.weight = self.weight_buffer;
        self.value_buffer = 0.0;
        self.weight_buffer = 0.0;
        self.phase = Phase::AwaitingBroadcast;
        Ok(())
    }

    /// Local estimate of the population mean, `value / weight`.
    pub fn estimate(&self) -> Result<f64> {
        if matches!(self.phase, Phase::Uninitialized | Phase::Priming) {
            return Err(PushSumError::NotInitialized { node: self.id });
        }
        let estimate = self.value / self.weight;
        if self.weight == 0.0 || !estimate.is_finite() {
            return Err(PushSumError::WeightCollapse {
                node: self.id,
                value: self.value,
                weight: self.weight,
            });
        }
        Ok(estimate)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's original observation; never changed after initialization.
    pub fn true_value(&self) -> f64 {
        self.true_value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn buffers(&self) -> (f64, f64) {
        (self.value_buffer, self.weight_buffer)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rounds_committed(&self) -> u64 {
        self.round
    }

    pub fn round_in_progress(&self) -> u64 {
        self.round + 1
    }

    pub fn is_initialized(&self) -> bool {
        self.phase != Phase::Uninitialized
    }

    pub(crate) fn ensure_quiescent(&self) -> Result<()> {
        if self.value_buffer != 0.0 || self.weight_buffer != 0.0 {
            return Err(PushSumError::BufferNotQuiescent {
                node: self.id,
                value_buffer: self.value_buffer,
                weight_buffer: self.weight_buffer,
            });
        }
        Ok(())
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        match self.phase {
            actual if actual == expected => Ok(()),
            Phase::Uninitialized => Err(PushSumError::NotInitialized { node: self.id }),
            actual => Err(PushSumError::PhaseOrder {
                node: self.id,
                expected,
                actual,
            }),
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6e}, {:.6e})", self.value, self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primed(id: usize, value: f64, weight: f64) -> NodeState {
        let mut state = NodeState::new(NodeId(id));
        state.initialize_value(value).unwrap();
        state.initialize_weight(weight).unwrap();
        state.commit().unwrap();
        state
    }

    #[test]
    fn test_initialize_mirrors_into_buffers() {
        let mut state = NodeState::new(NodeId(0));
        state.initialize_value(3.0).unwrap();
        assert_eq!(state.phase(), Phase::Uninitialized);
        state.initialize_weight(2.0).unwrap();

        assert_eq!(state.phase(), Phase::Priming);
        assert_eq!(state.true_value(), 3.0);
        assert_eq!(state.buffers(), (3.0, 2.0));

        state.commit().unwrap();
        assert_eq!(state.phase(), Phase::AwaitingBroadcast);
        assert_eq!(state.buffers(), (0.0, 0.0));
        assert_eq!((state.value(), state.weight()), (3.0, 2.0));
        assert_eq!(state.rounds_committed(), 0);
        assert_eq!(state.estimate().unwrap(), 1.5);
    }

    #[test]
    fn test_initialize_twice_rejected() {
        let mut state = NodeState::new(NodeId(4));
        state.initialize_value(1.0).unwrap();
        assert_eq!(
            state.initialize_value(2.0),
            Err(PushSumError::AlreadyInitialized { node: NodeId(4) })
        );

        let mut state = primed(1, 1.0, 1.0);
        assert!(state.initialize_weight(1.0).is_err());
    }

    #[test]
    fn test_initialize_rejects_bad_numbers() {
        let mut state = NodeState::new(NodeId(0));
        assert!(matches!(state.initialize_value(f64::NAN), Err(PushSumError::InvalidValue { .. })));
        assert!(matches!(state.initialize_weight(0.0), Err(PushSumError::InvalidWeight { .. })));
        assert!(matches!(state.initialize_weight(-1.0), Err(PushSumError::InvalidWeight { .. })));
    }

    #[test]
    fn test_broadcast_before_initialization_fails() {
        let mut state = NodeState::new(NodeId(2));
        assert_eq!(
            state.broadcast(None, NoPartnerPolicy::Discard),
            Err(PushSumError::NotInitialized { node: NodeId(2) })
        );
        assert_eq!(state.commit(), Err(PushSumError::NotInitialized { node: NodeId(2) }));
        assert!(state.estimate().is_err());
    }

    #[test]
    fn test_broadcast_splits_in_half() {
        let mut state = primed(0, 8.0, 1.0);
        let share = state.broadcast(Some(NodeId(1)), NoPartnerPolicy::Discard).unwrap().unwrap();

        assert_eq!(share.round, 1);
        assert_eq!(share.from, NodeId(0));
        assert_eq!(share.to, NodeId(1));
        assert_eq!((share.value, share.weight), (4.0, 0.5));
        assert_eq!(state.buffers(), (4.0, 0.5));
        // committed state untouched until commit
        assert_eq!((state.value(), state.weight()), (8.0, 1.0));
        assert_eq!(state.phase(), Phase::AwaitingCommit);
    }

    #[test]
    fn test_broadcast_to_self_rejected() {
        let mut state = primed(3, 1.0, 1.0);
        assert_eq!(
            state.broadcast(Some(NodeId(3)), NoPartnerPolicy::Discard),
            Err(PushSumError::SelfPartner { node: NodeId(3) })
        );
    }

    #[test]
    fn test_double_broadcast_rejected() {
        let mut state = primed(0, 1.0, 1.0);
        state.broadcast(None, NoPartnerPolicy::Retain).unwrap();
        assert!(matches!(
            state.broadcast(None, NoPartnerPolicy::Retain),
            Err(PushSumError::PhaseOrder { actual: Phase::AwaitingCommit, .. })
        ));
    }

    #[test]
    fn test_commit_resets_buffers() {
        let mut a = primed(0, 6.0, 1.0);
        let mut b = primed(1, 2.0, 1.0);
        let to_b = a.broadcast(Some(NodeId(1)), NoPartnerPolicy::Discard).unwrap().unwrap();
        let to_a = b.broadcast(Some(NodeId(0)), NoPartnerPolicy::Discard).unwrap().unwrap();
        a.receive(&to_a).unwrap();
        b.receive(&to_b).unwrap();

        a.commit().unwrap();
        b.commit().unwrap();

        assert_eq!(a.buffers(), (0.0, 0.0));
        assert_eq!(b.buffers(), (0.0, 0.0));
        assert_eq!(a.value() + b.value(), 8.0);
        assert_eq!(a.weight() + b.weight(), 2.0);
        assert_eq!(a.estimate().unwrap(), 4.0);
        assert_eq!(a.rounds_committed(), 1);
    }

    #[test]
    fn test_no_partner_discard_keeps_half() {
        let mut state = primed(0, 5.0, 2.0);
        assert_eq!(state.broadcast(None, NoPartnerPolicy::Discard).unwrap(), None);
        state.commit().unwrap();
        assert_eq!((state.value(), state.weight()), (2.5, 1.0));
        assert_eq!(state.estimate().unwrap(), 2.5);
    }

    #[test]
    fn test_no_partner_retain_keeps_everything() {
        let mut state = primed(0, 5.0, 2.0);
        state.broadcast(None, NoPartnerPolicy::Retain).unwrap();
        state.commit().unwrap();
        assert_eq!((state.value(), state.weight()), (5.0, 2.0));
    }

    #[test]
    fn test_receive_rejects_share_from_other_round() {
        let mut a = primed(0, 1.0, 1.0);
        let mut b = primed(1, 1.0, 1.0);

        // a finishes its round before b has broadcast
        a.broadcast(None, NoPartnerPolicy::Discard).unwrap();
        a.commit().unwrap();

        let late = b.broadcast(Some(NodeId(0)), NoPartnerPolicy::Discard).unwrap().unwrap();
        assert_eq!(
            a.receive(&late),
            Err(PushSumError::StaleShare {
                node: NodeId(0),
                from: NodeId(1),
                expected: 2,
                got: 1,
            })
        );
    }

    #[test]
    fn test_receive_rejects_misaddressed_share() {
        let mut a = primed(0, 1.0, 1.0);
        let share = Share { round: 1, from: NodeId(1), to: NodeId(2), value: 1.0, weight: 1.0 };
        assert!(matches!(a.receive(&share), Err(PushSumError::Misaddressed { .. })));
    }

    #[test]
    fn test_weight_collapse_reported() {
        let mut state = primed(0, 1.0, 1.0);
        state.broadcast(Some(NodeId(1)), NoPartnerPolicy::Discard).unwrap();
        // simulate total loss of mass
        state.value_buffer = 0.0;
        state.weight_buffer = 0.0;
        state.commit().unwrap();
        assert!(matches!(state.estimate(), Err(PushSumError::WeightCollapse { .. })));
    }

    #[test]
    fn test_display_scientific() {
        let state = primed(0, 8.0, 1.0);
        assert_eq!(state.to_string(), "(8.000000e0, 1.000000e0)");
    }
}
