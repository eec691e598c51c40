#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use clap::Parser;
use gensod_burn::backend::{default_device, TrainingBackend};
use gensod_burn::config::{TrainingConfig, TrainingVariant};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Train a generative saliency model with Burn")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Overrides `variant` from the config (confidence, gan, plain).
    #[arg(long)]
    variant: Option<TrainingVariant>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    save_path: Option<String>,
    #[arg(long, default_value_t = false)]
    resume: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    gensod_burn::init_logging(args.verbose);

    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(variant) = args.variant {
        config.variant = variant;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(save_path) = args.save_path {
        config.save_path = save_path;
    }
    config.resume |= args.resume;

    let record = gensod_burn::training::train::<TrainingBackend>(config, default_device())
        .context("training failed")?;
    tracing::info!(loss = %record.summary(), "training finished");
    Ok(())
}
