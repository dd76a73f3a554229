use rand::RngCore;

use super::NodeId;

/// Topology consulted by the round coordinator for partner selection.
pub trait Overlay: Send + Sync {
    /// Number of nodes in the population.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Partner of `node` for `round`, or `None` when the node has nobody to
    /// gossip with this round. Must never return `node` itself.
    fn neighbor_for(&self, node: NodeId, round: u64, rng: &mut dyn RngCore) -> Option<NodeId>;
}

impl<O: Overlay + ?Sized> Overlay for Box<O> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn neighbor_for(&self, node: NodeId, round: u64, rng: &mut dyn RngCore) -> Option<NodeId> {
        (**self).neighbor_for(node, round, rng)
    }
}
