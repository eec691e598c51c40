#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use clap::Parser;
use gensod_burn::backend::{default_device, TrainingBackend};
use gensod_burn::config::{EvalConfig, Task, UncertaintyMethod};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Predict saliency maps for test sets and report MAE")]
struct Args {
    #[arg(long, default_value = "eval.json")]
    config: PathBuf,
    /// Overrides `checkpoint`, e.g. `ckpt/50_generator.mpk`.
    #[arg(long)]
    checkpoint: Option<String>,
    /// Overrides `uncertainty_method` (basic, vae, abp, gan, ebm).
    #[arg(long)]
    uncertainty_method: Option<UncertaintyMethod>,
    /// Overrides `task` (SOD, RGBD-SOD, COD).
    #[arg(long)]
    task: Option<Task>,
    #[arg(long)]
    eval_save_path: Option<String>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    gensod_burn::init_logging(args.verbose);

    let mut config = EvalConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(checkpoint) = args.checkpoint {
        config.checkpoint = checkpoint;
    }
    if let Some(method) = args.uncertainty_method {
        config.uncertainty_method = method;
    }
    if let Some(task) = args.task {
        config.task = task;
    }
    if let Some(path) = args.eval_save_path {
        config.eval_save_path = path;
    }

    gensod_burn::evaluation::evaluate::<TrainingBackend>(config, default_device())
        .context("evaluation failed")?;
    Ok(())
}
