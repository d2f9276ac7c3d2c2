mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::CliOverrides;
use pipeline::{InspectArgs, TrainArgs};

/// place-recognition: NetVLAD triplet training with data-parallel ranks.
#[derive(Parser)]
#[command(name = "place-recognition", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the embedding network, validating and checkpointing every epoch.
    ///
    /// Under a torchrun-style launcher (RANK, WORLD_SIZE, MASTER_ADDR,
    /// MASTER_PORT set) this process joins the job as one rank.
    Train {
        /// Path to experiment config TOML file.
        #[arg(long, default_value = "configs/tokyo.toml")]
        config: PathBuf,
        /// Run N ranks as threads of this process.
        #[arg(long)]
        spawn_workers: Option<usize>,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Print the merged configuration after CLI overrides and validation.
    InspectConfig {
        /// Path to experiment config TOML file.
        #[arg(long, default_value = "configs/tokyo.toml")]
        config: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
}

/// Flags that take priority over the TOML file.
#[derive(Args, Debug)]
struct OverrideArgs {
    /// Override the training dataset directory.
    #[arg(long)]
    train_data_path: Option<PathBuf>,
    /// Override the validation dataset directory.
    #[arg(long)]
    test_data_path: Option<PathBuf>,
    /// Override triplets per batch on each rank.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Override image decoding threads per rank.
    #[arg(long)]
    num_workers: Option<usize>,
    /// Override the Adam learning rate.
    #[arg(long)]
    learning_rate: Option<f64>,
    /// Override the number of epochs.
    #[arg(long)]
    total_epoch: Option<usize>,
    /// Override the sampler and augmentation seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Resume after this saved epoch.
    #[arg(long)]
    resume_epoch: Option<usize>,
    /// Override the checkpoint directory.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    /// Override the ROC plot directory.
    #[arg(long)]
    visualization_dir: Option<PathBuf>,
    /// Comma-separated device id per rank (e.g., "0,1").
    #[arg(long, value_delimiter = ',')]
    gpu_ids: Option<Vec<usize>>,
}

impl From<OverrideArgs> for CliOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            train_data_path: args.train_data_path,
            test_data_path: args.test_data_path,
            batch_size: args.batch_size,
            num_workers: args.num_workers,
            learning_rate: args.learning_rate,
            total_epoch: args.total_epoch,
            seed: args.seed,
            resume_epoch: args.resume_epoch,
            checkpoint_dir: args.checkpoint_dir,
            visualization_dir: args.visualization_dir,
            gpu_ids: args.gpu_ids,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            spawn_workers,
            overrides,
        } => {
            pipeline::run_train(TrainArgs {
                config,
                overrides: overrides.into(),
                spawn_workers,
            })?;
            Ok(())
        }
        Command::InspectConfig { config, overrides } => pipeline::run_inspect(InspectArgs {
            config,
            overrides: overrides.into(),
        }),
    }
}
