use crate::error::Error;
use crate::model::ModelConfig;
use burn::config::Config;
use burn::optim::AdamConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How a prediction is produced under model uncertainty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum UncertaintyMethod {
    Basic,
    Vae,
    Abp,
    Gan,
    Ebm,
}

impl UncertaintyMethod {
    /// Whether the generator expects a latent code at inference time.
    pub fn needs_latent(self) -> bool {
        matches!(self, Self::Gan | Self::Ebm)
    }

    /// Whether a Langevin energy prior is loaded next to the generator.
    pub fn needs_energy_model(self) -> bool {
        matches!(self, Self::Ebm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Vae => "vae",
            Self::Abp => "abp",
            Self::Gan => "gan",
            Self::Ebm => "ebm",
        }
    }
}

impl TryFrom<String> for UncertaintyMethod {
    type Error = Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl FromStr for UncertaintyMethod {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "vae" => Ok(Self::Vae),
            "abp" => Ok(Self::Abp),
            "gan" => Ok(Self::Gan),
            "ebm" => Ok(Self::Ebm),
            _ => Err(Error::UnknownUncertaintyMethod(value.to_string())),
        }
    }
}

impl fmt::Display for UncertaintyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Saliency task; decides the ground-truth directory layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Task {
    #[serde(rename = "SOD")]
    Sod,
    #[serde(rename = "RGBD-SOD")]
    RgbdSod,
    #[serde(rename = "COD")]
    Cod,
}

impl Task {
    /// Tasks whose test sets keep ground truth (and depth) inside the dataset folder.
    pub fn nested_layout(self) -> bool {
        matches!(self, Self::RgbdSod | Self::Cod)
    }

    pub fn uses_depth(self) -> bool {
        matches!(self, Self::RgbdSod)
    }
}

impl TryFrom<String> for Task {
    type Error = Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SOD" => Ok(Self::Sod),
            "RGBD-SOD" => Ok(Self::RgbdSod),
            "COD" => Ok(Self::Cod),
            _ => Err(Error::UnknownTask(value.to_string())),
        }
    }
}

/// Which adversarial objective the trainer optimizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum TrainingVariant {
    /// Discriminator predicts per-pixel confidence that re-weights the supervised loss.
    Confidence,
    /// Conditional GAN with a latent code fed to the generator.
    Gan,
    /// Generator only.
    Plain,
}

impl TrainingVariant {
    pub fn has_discriminator(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

impl TryFrom<String> for TrainingVariant {
    type Error = Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl FromStr for TrainingVariant {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "confidence" => Ok(Self::Confidence),
            "gan" => Ok(Self::Gan),
            "plain" => Ok(Self::Plain),
            _ => Err(Error::Configuration(format!(
                "unknown training variant `{value}` (expected one of confidence, gan, plain)"
            ))),
        }
    }
}

/// Short-run Langevin parameters for the energy-based prior.
#[derive(Config, Debug)]
pub struct LangevinConfig {
    #[config(default = 5)]
    pub steps: usize,
    #[config(default = 0.4)]
    pub step_size: f64,
    #[config(default = 1.0)]
    pub prior_sigma: f64,
    #[config(default = 1.0)]
    pub init_sigma: f64,
}

/// Evaluation run loaded from a JSON file.
#[derive(Config, Debug)]
pub struct EvalConfig {
    pub model: ModelConfig,
    pub checkpoint: String,
    pub datasets: Vec<String>,
    pub test_dataset_root: String,
    pub eval_save_path: String,
    #[config(default = "Task::Sod")]
    pub task: Task,
    #[config(default = "UncertaintyMethod::Basic")]
    pub uncertainty_method: UncertaintyMethod,
    #[config(default = 352)]
    pub test_size: usize,
    #[config(default = "LangevinConfig::new()")]
    pub langevin: LangevinConfig,
    #[config(default = 42)]
    pub seed: u64,
}

impl EvalConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.datasets.is_empty() {
            return Err(Error::Configuration("datasets must not be empty".into()));
        }
        if self.test_size == 0 || self.test_size % 8 != 0 {
            return Err(Error::Configuration(format!(
                "test_size must be a positive multiple of 8, got {}",
                self.test_size
            )));
        }
        if self.uncertainty_method.needs_latent() && self.model.latent_dim == 0 {
            return Err(Error::Configuration(format!(
                "uncertainty method `{}` needs model.latent_dim > 0",
                self.uncertainty_method
            )));
        }
        if self.task.uses_depth() != (self.model.input_channels == 4) {
            return Err(Error::Configuration(format!(
                "task {:?} does not match model.input_channels = {}",
                self.task, self.model.input_channels
            )));
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(&self.checkpoint)
    }

    /// Epoch tag taken from the checkpoint file name (`50_generator.mpk` -> `50`).
    pub fn epoch_tag(&self) -> String {
        epoch_tag(Path::new(&self.checkpoint))
    }

    /// Directory holding every prediction and the results table for this checkpoint.
    pub fn epoch_dir(&self) -> PathBuf {
        PathBuf::from(&self.eval_save_path).join(format!("{}_epoch", self.epoch_tag()))
    }
}

/// Training run loaded from a JSON file.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub train_image_root: String,
    pub train_gt_root: String,
    pub save_path: String,
    pub log_path: String,
    #[config(default = "None")]
    pub train_depth_root: Option<String>,
    #[config(default = "TrainingVariant::Confidence")]
    pub variant: TrainingVariant,
    #[config(default = 352)]
    pub train_size: usize,
    #[config(default = "vec![0.75, 1.0, 1.25]")]
    pub size_rates: Vec<f64>,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 50)]
    pub epochs: usize,
    #[config(default = 2.5e-5)]
    pub learning_rate: f64,
    #[config(default = 1e-5)]
    pub discriminator_learning_rate: f64,
    #[config(default = 0.9)]
    pub decay_rate: f64,
    #[config(default = 40)]
    pub decay_epoch: usize,
    #[config(default = 0.1)]
    pub adv_weight: f64,
    #[config(default = 10)]
    pub checkpoint_every: usize,
    #[config(default = 0)]
    pub visualize_every: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = false)]
    pub resume: bool,
    #[config(default = "AdamConfig::new()")]
    pub optimizer_generator: AdamConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer_discriminator: AdamConfig,
}

impl TrainingConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.train_size == 0 || self.train_size % 32 != 0 {
            return Err(Error::Configuration(format!(
                "train_size must be a positive multiple of 32, got {}",
                self.train_size
            )));
        }
        if self.size_rates.is_empty() || self.size_rates.iter().any(|rate| *rate <= 0.0) {
            return Err(Error::Configuration(
                "size_rates must be a non-empty list of positive factors".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be positive".into()));
        }
        if self.variant == TrainingVariant::Gan && self.model.latent_dim == 0 {
            return Err(Error::Configuration(
                "the gan variant needs model.latent_dim > 0".into(),
            ));
        }
        if self.train_depth_root.is_some() != (self.model.input_channels == 4) {
            return Err(Error::Configuration(format!(
                "train_depth_root must be set exactly when model.input_channels = 4 (got {})",
                self.model.input_channels
            )));
        }
        Ok(())
    }
}

/// Spatial size for a multi-scale rate, snapped to a multiple of 32.
pub fn scaled_size(base: usize, rate: f64) -> usize {
    let blocks = (base as f64 * rate / 32.0).round().max(1.0);
    blocks as usize * 32
}

/// Prefix of the file name before the first `_`.
pub fn epoch_tag(checkpoint: &Path) -> String {
    let file_name = checkpoint
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .split('_')
        .next()
        .unwrap_or_default()
        .to_string()
}
