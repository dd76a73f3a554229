/*
    Push-Sum computes the mean of values spread over a network without any
    coordinator node. Every node holds a (value, weight) pair, initially its own
    observation and weight 1. Each round, every node keeps half of its pair and
    pushes the other half to one random neighbor; once all pushes of the round
    are in, every node adopts the sum of what it received. The totals of value
    and weight never change, and every node's value / weight drifts toward
    total value / total weight.

    The two phases of a round must not interleave: a node that folds in its
    shares while others are still sending would mix shares of two rounds and
    break conservation. `Coordinator` (single thread) and `Cluster` (a tokio
    task per node) both separate the phases with a barrier.
*/

pub mod common;
pub mod network;
pub mod pushsum;

pub use common::{PushSumError, Result, RoundOptions, SimulationConfig, Termination};
pub use network::{FullMesh, NodeId, Overlay, Peers};
pub use pushsum::{Cluster, Coordinator, EstimateReader, NoPartnerPolicy, NodeState};
