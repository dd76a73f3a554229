use super::state::{NoPartnerPolicy, NodeState};
use crate::common::error::PushSumError;
use crate::network::NodeId;

/*
    A node never writes into another node's buffers. Broadcasting yields a share
    addressed to the partner; the partner (or whoever owns its state) folds the
    share in. Every share is stamped with the round it belongs to, so a share
    that crosses the commit barrier is detected instead of silently applied to
    the next round.
*/

/// Half of a node's (value, weight) handed to a partner for one round.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Share {
    pub round: u64,
    pub from: NodeId,
    pub to: NodeId,
    pub value: f64,
    pub weight: f64,
}

/// Inbound mailbox traffic of a node processor.
#[derive(Clone, Debug)]
pub enum Message {
    /// Start of the broadcast phase for `round`.
    Broadcast {
        round: u64,
        partner: Option<NodeId>,
        policy: NoPartnerPolicy,
    },
    /// Gossip share from a peer.
    Deliver(Share),
    /// Barrier passed; fold buffers into state.
    Commit { round: u64 },
    Shutdown,
}

/// Reports sent from node processors back to the cluster.
#[derive(Clone, Debug)]
pub enum Ack {
    Broadcast {
        node: NodeId,
        round: u64,
        /// Whether a share left the node this round.
        shared: bool,
    },
    Committed {
        node: NodeId,
        round: u64,
        state: NodeState,
    },
    Failed {
        node: NodeId,
        round: u64,
        error: PushSumError,
    },
}

impl Ack {
    pub fn node(&self) -> NodeId {
        match self {
            Ack::Broadcast { node, .. } | Ack::Committed { node, .. } | Ack::Failed { node, .. } => *node,
        }
    }

    pub fn round(&self) -> u64 {
        match self {
            Ack::Broadcast { round, .. } | Ack::Committed { round, .. } | Ack::Failed { round, .. } => *round,
        }
    }
}
