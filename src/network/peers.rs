use rand::{seq::index, seq::SliceRandom, Rng, RngCore};

use super::{NodeId, Overlay};
use crate::common::error::{PushSumError, Result};

/// Every node is linked to every other node. Partners are drawn uniformly
/// without materializing the link lists.
#[derive(Debug, Clone, Copy)]
pub struct FullMesh {
    size: usize,
}

impl FullMesh {
    pub fn new(size: usize) -> Self {
        FullMesh { size }
    }
}

impl Overlay for FullMesh {
    fn len(&self) -> usize {
        self.size
    }

    fn neighbor_for(&self, node: NodeId, _round: u64, rng: &mut dyn RngCore) -> Option<NodeId> {
        if self.size < 2 || node.0 >= self.size {
            return None;
        }
        let pick = rng.gen_range(0..self.size - 1);
        Some(NodeId(if pick >= node.0 { pick + 1 } else { pick }))
    }
}

/// Static adjacency lists. A node picks a partner uniformly among its own links.
#[derive(Debug, Clone)]
pub struct Peers {
    links: Vec<Vec<NodeId>>,
}

impl Peers {
    pub fn from_links(links: Vec<Vec<NodeId>>) -> Result<Self> {
        let size = links.len();
        for (i, row) in links.iter().enumerate() {
            for peer in row {
                if peer.0 >= size {
                    return Err(PushSumError::UnknownNode { node: *peer, size });
                }
                if peer.0 == i {
                    return Err(PushSumError::SelfPartner { node: *peer });
                }
            }
        }
        Ok(Peers { links })
    }

    /// Undirected edges; duplicates are collapsed.
    pub fn from_edges(size: usize, edges: &[(usize, usize)]) -> Result<Self> {
        let mut links = vec![Vec::new(); size];
        for &(a, b) in edges {
            for node in [a, b] {
                if node >= size {
                    return Err(PushSumError::UnknownNode { node: NodeId(node), size });
                }
            }
            if a == b {
                return Err(PushSumError::SelfPartner { node: NodeId(a) });
            }
            if !links[a].contains(&NodeId(b)) {
                links[a].push(NodeId(b));
            }
            if !links[b].contains(&NodeId(a)) {
                links[b].push(NodeId(a));
            }
        }
        Ok(Peers { links })
    }

    /// No links at all: every node gossips only with itself.
    pub fn isolated(size: usize) -> Self {
        Peers { links: vec![Vec::new(); size] }
    }

    /// Bidirectional ring.
    pub fn ring(size: usize) -> Self {
        let mut links = vec![Vec::new(); size];
        if size > 1 {
            for (i, row) in links.iter_mut().enumerate() {
                let next = NodeId((i + 1) % size);
                let prev = NodeId((i + size - 1) % size);
                row.push(next);
                if prev != next {
                    row.push(prev);
                }
            }
        }
        Peers { links }
    }

    /// Each node gets `k` distinct random out-links (directed).
    pub fn k_out<R: Rng + ?Sized>(size: usize, k: usize, rng: &mut R) -> Result<Self> {
        if size > 0 && k >= size {
            return Err(PushSumError::Config(format!(
                "k-out degree {} needs more than {} nodes",
                k, size
            )));
        }
        let links = (0..size)
            .map(|i| {
                index::sample(rng, size - 1, k)
                    .into_iter()
                    .map(|pick| NodeId(if pick >= i { pick + 1 } else { pick }))
                    .collect()
            })
            .collect();
        Ok(Peers { links })
    }

    pub fn neighbors(&self, node: NodeId) -> &[NodeId] {
        self.links.get(node.0).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn degree(&self, node: NodeId) -> usize {
        self.neighbors(node).len()
    }

    pub fn is_linked(&self, from: NodeId, to: NodeId) -> bool {
        self.neighbors(from).contains(&to)
    }
}

impl Overlay for Peers {
    fn len(&self) -> usize {
        self.links.len()
    }

    fn neighbor_for(&self, node: NodeId, _round: u64, rng: &mut dyn RngCore) -> Option<NodeId> {
        self.neighbors(node).choose(rng).copied()
    }
}
