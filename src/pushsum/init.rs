use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::state::NodeState;
use crate::common::error::{PushSumError, Result};
use crate::network::NodeId;

/// How the initial observations are spread over the population.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueDistribution {
    /// One value per node, in node order.
    Explicit { values: Vec<f64> },
    /// Evenly spaced from `min` (node 0) to `max` (last node).
    Linear { min: f64, max: f64 },
    /// Independent draws from `[min, max]`.
    Uniform { min: f64, max: f64 },
    /// Node 0 holds `value`, everybody else 0.
    Peak { value: f64 },
}

impl Default for ValueDistribution {
    fn default() -> Self {
        ValueDistribution::Linear { min: 0.0, max: 100.0 }
    }
}

impl ValueDistribution {
    pub fn values(&self, n: usize, rng: &mut dyn RngCore) -> Result<Vec<f64>> {
        match self {
            ValueDistribution::Explicit { values } => {
                if values.len() != n {
                    return Err(PushSumError::Config(format!(
                        "{} explicit values for {} nodes",
                        values.len(),
                        n
                    )));
                }
                Ok(values.clone())
            }
            ValueDistribution::Linear { min, max } => {
                let step = if n > 1 { (max - min) / (n - 1) as f64 } else { 0.0 };
                Ok((0..n).map(|i| min + step * i as f64).collect())
            }
            ValueDistribution::Uniform { min, max } => {
                if !(min <= max) {
                    return Err(PushSumError::Config(format!("empty range [{}, {}]", min, max)));
                }
                Ok((0..n).map(|_| rng.gen_range(*min..=*max)).collect())
            }
            ValueDistribution::Peak { value } => {
                Ok((0..n).map(|i| if i == 0 { *value } else { 0.0 }).collect())
            }
        }
    }
}

/// Setup routine run once before round 1. Implementations call
/// `initialize_value` and `initialize_weight` exactly once per node.
pub trait Initializer {
    fn initialize(&self, states: &mut [NodeState], rng: &mut dyn RngCore) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum Weights {
    Uniform(f64),
    Explicit(Vec<f64>),
}

/// Values from a distribution, weights uniform or explicit.
#[derive(Clone, Debug)]
pub struct Population {
    pub values: ValueDistribution,
    pub weights: Weights,
}

impl Population {
    pub fn new(values: ValueDistribution, initial_weight: f64) -> Self {
        Population {
            values,
            weights: Weights::Uniform(initial_weight),
        }
    }

    pub fn explicit(values: Vec<f64>, weights: Vec<f64>) -> Self {
        Population {
            values: ValueDistribution::Explicit { values },
            weights: Weights::Explicit(weights),
        }
    }
}

impl Initializer for Population {
    fn initialize(&self, states: &mut [NodeState], rng: &mut dyn RngCore) -> Result<()> {
        let values = self.values.values(states.len(), rng)?;
        if let Weights::Explicit(weights) = &self.weights {
            if weights.len() != states.len() {
                return Err(PushSumError::Config(format!(
                    "{} explicit weights for {} nodes",
                    weights.len(),
                    states.len()
                )));
            }
        }

        for (i, (state, value)) in states.iter_mut().zip(values).enumerate() {
            let weight = match &self.weights {
                Weights::Uniform(w) => *w,
                Weights::Explicit(ws) => ws[i],
            };
            state.initialize_value(value)?;
            state.initialize_weight(weight)?;
        }
        Ok(())
    }
}

/// Creates `n` fresh nodes and runs `init` over them.
pub fn populate<I: Initializer + ?Sized>(n: usize, init: &I, rng: &mut dyn RngCore) -> Result<Vec<NodeState>> {
    let mut states: Vec<NodeState> = (0..n).map(|i| NodeState::new(NodeId(i))).collect();
    init.initialize(&mut states, rng)?;
    Ok(states)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::pushsum::Phase;

    #[test]
    fn test_linear_values() {
        let mut rng = StdRng::seed_from_u64(0);
        let dist = ValueDistribution::Linear { min: 0.0, max: 10.0 };
        assert_eq!(dist.values(3, &mut rng).unwrap(), vec![0.0, 5.0, 10.0]);
        assert_eq!(dist.values(1, &mut rng).unwrap(), vec![0.0]);
    }

    #[test]
    fn test_peak_values() {
        let mut rng = StdRng::seed_from_u64(0);
        let dist = ValueDistribution::Peak { value: 8.0 };
        assert_eq!(dist.values(4, &mut rng).unwrap(), vec![8.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_uniform_values_in_range() {
        let mut rng = StdRng::seed_from_u64(9);
        let dist = ValueDistribution::Uniform { min: -1.0, max: 1.0 };
        let values = dist.values(50, &mut rng).unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));

        let empty = ValueDistribution::Uniform { min: 1.0, max: 0.0 };
        assert!(empty.values(2, &mut rng).is_err());
    }

    #[test]
    fn test_populate_initializes_every_node() {
        let mut rng = StdRng::seed_from_u64(0);
        let population = Population::explicit(vec![1.0, 2.0], vec![1.0, 3.0]);
        let states = populate(2, &population, &mut rng).unwrap();

        assert!(states.iter().all(|s| s.phase() == Phase::Priming));
        assert_eq!(states[1].true_value(), 2.0);
        assert_eq!(states[1].weight(), 3.0);
    }

    #[test]
    fn test_populate_rejects_length_mismatch() {
        let mut rng = StdRng::seed_from_u64(0);
        let population = Population::explicit(vec![1.0, 2.0], vec![1.0]);
        assert!(matches!(populate(2, &population, &mut rng), Err(PushSumError::Config(_))));

        let population = Population::new(ValueDistribution::Explicit { values: vec![1.0] }, 1.0);
        assert!(populate(3, &population, &mut rng).is_err());
    }

    #[test]
    fn test_populate_rejects_zero_weight() {
        let mut rng = StdRng::seed_from_u64(0);
        let population = Population::new(ValueDistribution::Peak { value: 1.0 }, 0.0);
        assert!(matches!(
            populate(2, &population, &mut rng),
            Err(PushSumError::InvalidWeight { .. })
        ));
    }
}
