//! RJSwarm CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod run;

#[derive(Parser)]
#[command(name = "rjswarm")]
#[command(about = "RJSwarm - reversible-jump MCMC with swarm-coupled chains")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample a built-in model
    Run {
        /// Run config (JSON or YAML). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Built-in model: gaussian or bursts
        #[arg(long, default_value = "gaussian")]
        model: String,

        /// Centre of the gaussian model
        #[arg(long, default_value = "0.0")]
        center: f64,

        /// Number of true bursts in the synthetic spectrum
        #[arg(long, default_value = "2")]
        bursts: usize,

        /// Override the config seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the number of chains
        #[arg(long)]
        chains: Option<usize>,

        /// Write the full sampler result (traces included) instead of a summary.
        #[arg(long)]
        full: bool,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarize a full result written by `run --full`
    Summarize {
        /// Sampler result JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Run { config, model, center, bursts, seed, chains, full, output } => {
            cmd_run(config.as_ref(), &model, center, bursts, seed, chains, full, output.as_ref())
        }
        Commands::Summarize { input, output } => cmd_summarize(&input, output.as_ref()),
        Commands::Version => {
            println!("rjswarm {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config: Option<&PathBuf>,
    model: &str,
    center: f64,
    bursts: usize,
    seed: Option<u64>,
    chains: Option<usize>,
    full: bool,
    output: Option<&PathBuf>,
) -> Result<()> {
    let mut cfg = match config {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading run config");
            run::read_run_config(path)?
        }
        None => rjs_inference::RunConfig::default(),
    };
    if let Some(seed) = seed {
        cfg.seed = seed;
    }
    if let Some(n) = chains {
        cfg.n_chains = n;
    }
    cfg.validate()?;

    let demo = run::DemoModel::parse(model, center, bursts)?;
    tracing::info!(model = ?demo, chains = cfg.n_chains, topology = %cfg.topology, "sampling");
    let result = demo.sample(&cfg)?;
    tracing::info!(total_iterations = result.total_iterations, "sampling complete");

    if full {
        write_json(output, serde_json::to_value(&result)?)
    } else {
        write_json(output, run::summary_json(&result)?)
    }
}

fn cmd_summarize(input: &PathBuf, output: Option<&PathBuf>) -> Result<()> {
    tracing::info!(path = %input.display(), "loading sampler result");
    let bytes = std::fs::read(input)?;
    let result: rjs_inference::SamplerResult = serde_json::from_slice(&bytes)?;
    write_json(output, run::summary_json(&result)?)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
