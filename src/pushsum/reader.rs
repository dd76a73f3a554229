use super::state::NodeState;
use crate::common::error::{PushSumError, Result};
use crate::network::NodeId;

/// Read-only view of committed node states between rounds.
#[derive(Clone, Copy)]
pub struct EstimateReader<'a> {
    states: &'a [NodeState],
}

impl<'a> EstimateReader<'a> {
    pub fn new(states: &'a [NodeState]) -> Self {
        EstimateReader { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&'a NodeState> {
        self.states.get(id.0).ok_or(PushSumError::UnknownNode {
            node: id,
            size: self.states.len(),
        })
    }

    pub fn estimate(&self, id: NodeId) -> Result<f64> {
        self.node(id)?.estimate()
    }

    pub fn true_value(&self, id: NodeId) -> Result<f64> {
        Ok(self.node(id)?.true_value())
    }

    pub fn estimates(&self) -> Result<Vec<f64>> {
        self.states.iter().map(NodeState::estimate).collect()
    }

    /// Mean of the original observations. With uniform initial weights this
    /// is what every estimate approaches.
    pub fn true_mean(&self) -> f64 {
        if self.states.is_empty() {
            return 0.0;
        }
        self.states.iter().map(NodeState::true_value).sum::<f64>() / self.states.len() as f64
    }

    /// Largest distance between any estimate and the true mean.
    pub fn max_error(&self) -> Result<f64> {
        let mean = self.true_mean();
        self.states.iter().try_fold(0.0_f64, |acc, state| -> Result<f64> {
            Ok(acc.max((state.estimate()? - mean).abs()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_queries() {
        let states: Vec<NodeState> = [2.0, 4.0]
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut state = NodeState::new(NodeId(i));
                state.initialize_value(*v).unwrap();
                state.initialize_weight(1.0).unwrap();
                state.commit().unwrap();
                state
            })
            .collect();

        let reader = EstimateReader::new(&states);
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.estimate(NodeId(1)).unwrap(), 4.0);
        assert_eq!(reader.true_value(NodeId(0)).unwrap(), 2.0);
        assert_eq!(reader.true_mean(), 3.0);
        assert_eq!(reader.max_error().unwrap(), 1.0);
        assert_eq!(reader.estimates().unwrap(), vec![2.0, 4.0]);
        assert_eq!(
            reader.estimate(NodeId(2)),
            Err(PushSumError::UnknownNode { node: NodeId(2), size: 2 })
        );
    }
}
