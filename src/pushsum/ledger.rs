use super::state::NodeState;
use crate::common::error::{PushSumError, Result};

/// Tracks total mass in the system so conservation can be checked after
/// every commit phase, including mass knowingly dropped by the lossy
/// no-partner policy.
///
/// The tolerance is relative to the absolute mass `Σ|v_i|`, not to the net
/// sum: values of mixed sign may cancel to a net near zero while every
/// addition still rounds at the scale of the individual values. Gossip and
/// discarding never increase `Σ|v_i|`, so the initial magnitude bounds it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MassLedger {
    initial_value: f64,
    initial_weight: f64,
    magnitude_value: f64,
    magnitude_weight: f64,
    lost_value: f64,
    lost_weight: f64,
    tolerance: f64,
}

impl MassLedger {
    pub fn open(states: &[NodeState], tolerance: f64) -> Self {
        let (initial_value, initial_weight) = totals(states);
        let (magnitude_value, magnitude_weight) = magnitudes(states);
        MassLedger {
            initial_value,
            initial_weight,
            magnitude_value,
            magnitude_weight,
            lost_value: 0.0,
            lost_weight: 0.0,
            tolerance,
        }
    }

    /// Mass a node gave up without a receiver.
    pub fn record_loss(&mut self, value: f64, weight: f64) {
        self.lost_value += value;
        self.lost_weight += weight;
    }

    pub fn initial(&self) -> (f64, f64) {
        (self.initial_value, self.initial_weight)
    }

    pub fn lost(&self) -> (f64, f64) {
        (self.lost_value, self.lost_weight)
    }

    /// Checks the committed state of `round` against the books.
    pub fn verify(&self, round: u64, states: &[NodeState]) -> Result<()> {
        let (value, weight) = totals(states);
        let (magnitude_value, magnitude_weight) = magnitudes(states);
        self.check(
            round,
            "value",
            self.initial_value - self.lost_value,
            value,
            self.magnitude_value.max(magnitude_value),
        )?;
        self.check(
            round,
            "weight",
            self.initial_weight - self.lost_weight,
            weight,
            self.magnitude_weight.max(magnitude_weight),
        )
    }

    fn check(&self, round: u64, quantity: &'static str, expected: f64, actual: f64, magnitude: f64) -> Result<()> {
        let scale = magnitude.max(expected.abs()).max(actual.abs()).max(1.0);
        if (expected - actual).abs() > self.tolerance * scale {
            return Err(PushSumError::ConservationViolated {
                round,
                quantity,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Sum of committed value and weight.
pub fn totals(states: &[NodeState]) -> (f64, f64) {
    states
        .iter()
        .fold((0.0, 0.0), |(v, w), s| (v + s.value(), w + s.weight()))
}

fn magnitudes(states: &[NodeState]) -> (f64, f64) {
    states
        .iter()
        .fold((0.0, 0.0), |(v, w), s| (v + s.value().abs(), w + s.weight().abs()))
}
