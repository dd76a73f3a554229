use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use push_sum::{
    common::{ExecutionMode, OverlayConfig},
    pushsum::{populate, Population},
    Cluster, Coordinator, EstimateReader, NoPartnerPolicy, SimulationConfig, Termination,
};
use rand::{rngs::StdRng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OverlayArg {
    Full,
    Ring,
    Isolated,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NoPartnerArg {
    Discard,
    Retain,
}

/// Push-Sum gossip averaging simulator
#[derive(Parser, Debug)]
#[command(name = "push-sum", version)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    nodes: Option<usize>,

    /// Run exactly this many rounds
    #[arg(short, long, conflicts_with = "tolerance")]
    rounds: Option<u64>,

    /// Run until no estimate moves more than this between rounds
    #[arg(short, long)]
    tolerance: Option<f64>,

    /// Round cap for --tolerance
    #[arg(long, default_value_t = 1_000)]
    max_rounds: u64,

    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    overlay: Option<OverlayArg>,

    /// Random out-links per node (k-out overlay)
    #[arg(long, conflicts_with = "overlay")]
    k_out: Option<usize>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long, value_enum)]
    no_partner: Option<NoPartnerArg>,
}

impl Args {
    fn into_config(self) -> Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_file(path)?,
            None => SimulationConfig::default(),
        };

        if let Some(nodes) = self.nodes {
            config.nodes = nodes;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(rounds) = self.rounds {
            config.termination = Termination::Rounds { rounds };
        }
        if let Some(tolerance) = self.tolerance {
            config.termination = Termination::Converged {
                tolerance,
                max_rounds: self.max_rounds,
            };
        }
        if let Some(overlay) = self.overlay {
            config.overlay = match overlay {
                OverlayArg::Full => OverlayConfig::FullyConnected,
                OverlayArg::Ring => OverlayConfig::Ring,
                OverlayArg::Isolated => OverlayConfig::Isolated,
            };
        }
        if let Some(k) = self.k_out {
            config.overlay = OverlayConfig::KOut { k };
        }
        if let Some(mode) = self.mode {
            config.mode = match mode {
                ModeArg::Sequential => ExecutionMode::Sequential,
                ModeArg::Concurrent => ExecutionMode::Concurrent,
            };
        }
        if let Some(policy) = self.no_partner {
            config.no_partner = match policy {
                NoPartnerArg::Discard => NoPartnerPolicy::Discard,
                NoPartnerArg::Retain => NoPartnerPolicy::Retain,
            };
        }

        config.validate()?;
        Ok(config)
    }
}

fn report(reader: EstimateReader<'_>) -> Result<()> {
    let estimates = reader.estimates()?;
    let (min, max) = estimates
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), e| (lo.min(*e), hi.max(*e)));
    tracing::info!(
        true_mean = reader.true_mean(),
        min_estimate = min,
        max_estimate = max,
        max_error = reader.max_error()?,
        "final estimates"
    );
    for (i, estimate) in estimates.iter().enumerate().take(10) {
        tracing::debug!(node = i, estimate, "estimate");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config().context("loading configuration")?;
    tracing::info!(?config, "configuration");

    // overlay wiring and value draws use their own stream; partner selection
    // is seeded inside the coordinators
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let overlay = config.overlay.build(config.nodes, &mut rng)?;
    let population = Population::new(config.values.clone(), config.initial_weight);
    let states = populate(config.nodes, &population, &mut rng)?;

    match config.mode {
        ExecutionMode::Sequential => {
            let mut coordinator = Coordinator::new(overlay, states, config.round_options())?;
            coordinator.run(config.termination)?;
            report(coordinator.reader())?;
        }
        ExecutionMode::Concurrent => {
            let mut cluster = Cluster::spawn(overlay, states, config.round_options(), config.round_timeout())?;
            let outcome = cluster.run(config.termination).await;
            if outcome.is_ok() {
                report(cluster.reader())?;
            }
            cluster.shutdown().await?;
            outcome?;
        }
    }

    Ok(())
}
