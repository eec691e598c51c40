use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the training and evaluation pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown uncertainty method `{0}` (expected one of basic, vae, abp, gan, ebm)")]
    UnknownUncertaintyMethod(String),
    #[error("unknown task `{0}` (expected one of SOD, RGBD-SOD, COD)")]
    UnknownTask(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),
    #[error("checkpoint file name {} does not contain `generator`", .0.display())]
    CheckpointNaming(PathBuf),
    #[error("checkpoint i/o failed at {}: {msg}", .path.display())]
    Checkpoint { path: PathBuf, msg: String },
    #[error("no valid prediction/ground-truth pairs for dataset `{0}`")]
    NoValidSamples(String),
    #[error("model returned no predictions")]
    EmptyModelOutput,
    #[error("sample index {index} is out of range for {len} samples")]
    SampleOutOfRange { index: usize, len: usize },
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("no samples found under {}", .0.display())]
    EmptyDataset(PathBuf),
    #[error("image decode error at {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read tensor data: {0}")]
    TensorData(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }
}
