use thiserror::Error;

use crate::network::NodeId;
use crate::pushsum::Phase;

pub type Result<T> = std::result::Result<T, PushSumError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PushSumError {
    #[error("node {node} used before value and weight were initialized")]
    NotInitialized { node: NodeId },

    #[error("node {node} initialized twice")]
    AlreadyInitialized { node: NodeId },

    #[error("node {node}: value {value} is not finite")]
    InvalidValue { node: NodeId, value: f64 },

    #[error("node {node}: weight {weight} must be finite and positive")]
    InvalidWeight { node: NodeId, weight: f64 },

    #[error("node {node}: expected phase {expected:?}, found {actual:?}")]
    PhaseOrder {
        node: NodeId,
        expected: Phase,
        actual: Phase,
    },

    #[error("node {node}: share from {from} tagged round {got}, round in progress is {expected}")]
    StaleShare {
        node: NodeId,
        from: NodeId,
        expected: u64,
        got: u64,
    },

    #[error("node {node}: share addressed to {to}")]
    Misaddressed { node: NodeId, to: NodeId },

    #[error("overlay returned node {node} as its own partner")]
    SelfPartner { node: NodeId },

    #[error("unknown node {node} (population size {size})")]
    UnknownNode { node: NodeId, size: usize },

    #[error("round {round}: commit requested while {pending} node(s) have not broadcast")]
    IncompleteBroadcast { round: u64, pending: usize },

    #[error("node {node}: weight collapsed (value {value}, weight {weight})")]
    WeightCollapse { node: NodeId, value: f64, weight: f64 },

    #[error("round {round}: {quantity} not conserved, expected {expected}, found {actual}")]
    ConservationViolated {
        round: u64,
        quantity: &'static str,
        expected: f64,
        actual: f64,
    },

    #[error("node {node}: buffers not empty before broadcast ({value_buffer}, {weight_buffer})")]
    BufferNotQuiescent {
        node: NodeId,
        value_buffer: f64,
        weight_buffer: f64,
    },

    #[error("coordinator halted after an earlier failure")]
    Halted,

    #[error("round {round} aborted: {reason}")]
    RoundAborted { round: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PushSumError {
    /// Invariant and ordering violations stop the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PushSumError::Config(_) | PushSumError::UnknownNode { .. })
    }
}
