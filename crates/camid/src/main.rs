mod config;
mod pipeline;
mod results;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::ModelType;
use pipeline::{EvaluateArgs, McStatsArgs, TrainArgs};

/// camid: camera-model identification with vanilla, ensemble and Bayesian CNNs.
#[derive(Parser)]
#[command(name = "camid", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model with early stopping and checkpoint rotation.
    Train {
        /// Path to the parameters TOML file.
        #[arg(long, default_value = "configs/params.toml")]
        config: PathBuf,
        /// Override `run.model_type`.
        #[arg(long, value_enum)]
        model_type: Option<ModelType>,
        /// Override `trainer.epochs`.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override `trainer.num_ensemble`.
        #[arg(long)]
        num_ensemble: Option<usize>,
    },
    /// Restore the latest checkpoint and report test-set accuracy.
    Evaluate {
        #[arg(long, default_value = "configs/params.toml")]
        config: PathBuf,
        #[arg(long, value_enum)]
        model_type: Option<ModelType>,
        #[arg(long)]
        num_ensemble: Option<usize>,
    },
    /// Monte-Carlo entropy and epistemic uncertainty on in- and
    /// out-of-distribution slices, with ROC/PR curves.
    McStats {
        #[arg(long, default_value = "configs/params.toml")]
        config: PathBuf,
        #[arg(long, value_enum)]
        model_type: Option<ModelType>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            model_type,
            epochs,
            num_ensemble,
        } => pipeline::run_train(TrainArgs {
            config,
            model_type,
            epochs,
            num_ensemble,
        }),
        Command::Evaluate {
            config,
            model_type,
            num_ensemble,
        } => pipeline::run_evaluate(EvaluateArgs {
            config,
            model_type,
            num_ensemble,
        }),
        Command::McStats { config, model_type } => {
            pipeline::run_mc_stats(McStatsArgs { config, model_type })
        }
    }
}
