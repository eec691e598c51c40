#![recursion_limit = "256"]
//! Uncertainty-aware generative saliency training and evaluation.

pub mod backend;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod inference;
pub mod langevin;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod training;
pub mod utils;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a stderr `tracing` subscriber; `RUST_LOG` wins over `verbosity`.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
