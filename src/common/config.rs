use std::{path::Path, time::Duration};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::error::{PushSumError, Result};
use crate::network::{FullMesh, Overlay, Peers};
use crate::pushsum::{NoPartnerPolicy, ValueDistribution};

/// When a run stops.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Exactly this many rounds.
    Rounds { rounds: u64 },
    /// Until the largest per-node change in estimate between two rounds is at
    /// most `tolerance`, giving up after `max_rounds`.
    Converged { tolerance: f64, max_rounds: u64 },
}

impl Termination {
    pub fn max_rounds(&self) -> u64 {
        match self {
            Termination::Rounds { rounds } => *rounds,
            Termination::Converged { max_rounds, .. } => *max_rounds,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayConfig {
    FullyConnected,
    Ring,
    Isolated,
    /// `k` random out-links per node.
    KOut { k: usize },
}

impl OverlayConfig {
    pub fn build(&self, nodes: usize, rng: &mut dyn RngCore) -> Result<Box<dyn Overlay>> {
        Ok(match self {
            OverlayConfig::FullyConnected => Box::new(FullMesh::new(nodes)),
            OverlayConfig::Ring => Box::new(Peers::ring(nodes)),
            OverlayConfig::Isolated => Box::new(Peers::isolated(nodes)),
            OverlayConfig::KOut { k } => Box::new(Peers::k_out(nodes, *k, rng)?),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single thread, rounds one after another.
    #[default]
    Sequential,
    /// One tokio task per node with a barrier between phases.
    Concurrent,
}

/// Knobs shared by both round coordinators.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoundOptions {
    /// Seed for partner selection.
    pub seed: u64,
    pub no_partner: NoPartnerPolicy,
    /// Relative tolerance of the conservation check.
    pub conservation_tolerance: f64,
}

impl Default for RoundOptions {
    fn default() -> Self {
        RoundOptions {
            seed: 0,
            no_partner: NoPartnerPolicy::Discard,
            conservation_tolerance: 1e-9,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub nodes: usize,
    pub seed: u64,
    pub overlay: OverlayConfig,
    pub values: ValueDistribution,
    pub initial_weight: f64,
    pub no_partner: NoPartnerPolicy,
    pub termination: Termination,
    pub conservation_tolerance: f64,
    pub mode: ExecutionMode,
    pub round_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            nodes: 100,
            seed: 0,
            overlay: OverlayConfig::FullyConnected,
            values: ValueDistribution::default(),
            initial_weight: 1.0,
            no_partner: NoPartnerPolicy::Discard,
            termination: Termination::Rounds { rounds: 50 },
            conservation_tolerance: 1e-9,
            mode: ExecutionMode::Sequential,
            round_timeout_ms: 5_000,
        }
    }
}

impl SimulationConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SimulationConfig =
            serde_json::from_str(text).map_err(|e| PushSumError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PushSumError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(PushSumError::Config("nodes must be at least 1".into()));
        }
        if !self.initial_weight.is_finite() || self.initial_weight <= 0.0 {
            return Err(PushSumError::Config(format!(
                "initial_weight must be positive, got {}",
                self.initial_weight
            )));
        }
        if let ValueDistribution::Explicit { values } = &self.values {
            if values.len() != self.nodes {
                return Err(PushSumError::Config(format!(
                    "{} explicit values for {} nodes",
                    values.len(),
                    self.nodes
                )));
            }
        }
        if let OverlayConfig::KOut { k } = self.overlay {
            if k >= self.nodes {
                return Err(PushSumError::Config(format!(
                    "k-out degree {} needs more than {} nodes",
                    k, self.nodes
                )));
            }
        }
        if let Termination::Converged { tolerance, .. } = self.termination {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(PushSumError::Config(format!("invalid convergence tolerance {}", tolerance)));
            }
        }
        if !(self.conservation_tolerance >= 0.0) {
            return Err(PushSumError::Config("conservation_tolerance must be non-negative".into()));
        }
        if self.round_timeout_ms == 0 {
            return Err(PushSumError::Config("round_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn round_options(&self) -> RoundOptions {
        RoundOptions {
            seed: self.seed,
            no_partner: self.no_partner,
            conservation_tolerance: self.conservation_tolerance,
        }
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}
