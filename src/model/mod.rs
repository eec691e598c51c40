pub mod discriminator;
pub mod energy;
pub mod generator;
pub mod layers;

use crate::error::Error;
use burn::prelude::*;
use burn::record::{CompactRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use std::path::{Path, PathBuf};

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use energy::{EnergyPrior, EnergyPriorConfig};
pub use generator::{Generator, GeneratorConfig};

/// Hyperparameters shared by the generator, discriminator and energy prior.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 3 for RGB input, 4 when a depth channel is appended.
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 32)]
    pub generator_dim: usize,
    #[config(default = 32)]
    pub discriminator_dim: usize,
    /// Size of the latent code; 0 builds a generator without latent injection.
    #[config(default = 32)]
    pub latent_dim: usize,
    #[config(default = 100)]
    pub ebm_middle_dim: usize,
    #[config(default = 1)]
    pub ebm_out_dim: usize,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.input_channels, self.generator_dim, self.latent_dim)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.input_channels, self.discriminator_dim)
    }

    pub fn energy_config(&self) -> EnergyPriorConfig {
        EnergyPriorConfig::new(self.latent_dim, self.ebm_middle_dim, self.ebm_out_dim)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.discriminator_config().init(device)
    }

    pub fn init_energy<B: Backend>(&self, device: &B::Device) -> EnergyPrior<B> {
        self.energy_config().init(device)
    }
}

/// A saliency predictor: image (plus optional depth and latent) to a list of logit maps.
///
/// Every map in the list has shape `[batch, 1, height, width]` matching the input;
/// the last element is the refined prediction.
pub trait SaliencyModel<B: Backend> {
    fn predict(
        &self,
        image: Tensor<B, 4>,
        depth: Option<Tensor<B, 4>>,
        latent: Option<Tensor<B, 2>>,
    ) -> Vec<Tensor<B, 4>>;
}

/// Scores `cat(image, saliency)` with a per-pixel real/fake logit map at reduced resolution.
pub trait ConfidenceModel<B: Backend> {
    fn confidence_logits(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Energy over latent codes, `[batch, latent_dim] -> [batch, out_dim]`.
pub trait EnergyFunction<B: Backend> {
    fn energy(&self, latent: Tensor<B, 2>) -> Tensor<B, 2>;
}

type StateRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Record path as handed to the recorder (without the `.mpk` extension).
fn record_path(path: &Path) -> PathBuf {
    if path.extension().map(|ext| ext == "mpk").unwrap_or(false) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Load module weights from a `CompactRecorder` checkpoint.
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> crate::Result<M> {
    let record = record_path(path);
    if !record.with_extension("mpk").exists() {
        return Err(Error::MissingCheckpoint(record.with_extension("mpk")));
    }
    module
        .load_file(record.clone(), &CompactRecorder::new(), device)
        .map_err(|err| Error::Checkpoint {
            path: record,
            msg: err.to_string(),
        })
}

/// Save module weights next to `path` (the `.mpk` extension is added by the recorder).
pub fn save_checkpoint<B: Backend, M: Module<B>>(module: M, path: &Path) -> crate::Result<()> {
    let record = record_path(path);
    if let Some(parent) = record.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    module
        .save_file(record.clone(), &CompactRecorder::new())
        .map_err(|err| Error::Checkpoint {
            path: record,
            msg: err.to_string(),
        })
}

/// Save a non-module record (optimizer or scheduler state) at full precision.
///
/// Adam's second moments underflow in half precision.
pub fn save_record_file<B: Backend, R: Record<B>>(record: R, path: &Path) -> crate::Result<()> {
    let file = record_path(path);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    Recorder::<B>::record(&StateRecorder::new(), record, file.clone())
        .map(|_| ())
        .map_err(|err| Error::Checkpoint {
            path: file,
            msg: err.to_string(),
        })
}

/// Load a record written by [`save_record_file`].
pub fn load_record_file<B: Backend, R: Record<B>>(
    path: &Path,
    device: &B::Device,
) -> crate::Result<R> {
    let file = record_path(path);
    if !file.with_extension("mpk").exists() {
        return Err(Error::MissingCheckpoint(file.with_extension("mpk")));
    }
    Recorder::<B>::load(&StateRecorder::new(), file.clone(), device).map_err(|err| {
        Error::Checkpoint {
            path: file,
            msg: err.to_string(),
        }
    })
}

/// Energy prior checkpoint that pairs with a generator checkpoint.
///
/// `ckpt/50_generator.mpk` pairs with `ckpt/50_ebm_model.mpk`; only the file
/// name is rewritten.
pub fn energy_checkpoint_path(generator_path: &Path) -> crate::Result<PathBuf> {
    let file_name = generator_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !file_name.contains("generator") {
        return Err(Error::CheckpointNaming(generator_path.to_path_buf()));
    }
    Ok(generator_path.with_file_name(file_name.replace("generator", "ebm_model")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn energy_checkpoint_rewrites_file_name_only() {
        let path = energy_checkpoint_path(Path::new("generator_runs/50_generator.mpk")).unwrap();
        assert_eq!(path, PathBuf::from("generator_runs/50_ebm_model.mpk"));
    }

    #[test]
    fn energy_checkpoint_requires_generator_in_name() {
        let err = energy_checkpoint_path(Path::new("ckpt/50_model.mpk")).unwrap_err();
        assert!(matches!(err, Error::CheckpointNaming(_)));
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let device = Default::default();
        let generator = ModelConfig::new()
            .with_generator_dim(4)
            .init_generator::<TestBackend>(&device);
        let tmp = tempfile::tempdir().unwrap();
        let err = load_checkpoint(generator, &tmp.path().join("7_generator.mpk"), &device)
            .unwrap_err();
        assert!(matches!(err, Error::MissingCheckpoint(_)));
    }

    #[test]
    fn checkpoint_roundtrip_restores_weights() {
        let device = Default::default();
        let config = ModelConfig::new().with_latent_dim(4).with_ebm_middle_dim(8);
        let prior = config.init_energy::<TestBackend>(&device);
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("3_ebm_model.mpk");
        let latent = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        let expected = prior.energy(latent.clone()).into_data().to_vec::<f32>().unwrap();

        save_checkpoint(prior, &path).unwrap();
        let fresh = config.init_energy::<TestBackend>(&device);
        let restored = load_checkpoint(fresh, &path, &device).unwrap();
        let actual = restored.energy(latent).into_data().to_vec::<f32>().unwrap();
        assert_eq!(actual.len(), expected.len());
        // CompactRecorder stores half precision.
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-3, "{a} != {e}");
        }
    }
}
