use crate::config::{EvalConfig, Task};
use crate::data::{load_eval_pairs, TestLoader};
use crate::error::{Error, Result};
use crate::inference::{select_strategy, InferenceStrategy};
use crate::metrics::{eval_mae, ResultTable};
use crate::model::{energy_checkpoint_path, load_checkpoint, EnergyPrior, SaliencyModel};
use crate::utils::{save_map, tensor_to_maps};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

/// Where test images, ground truth and depth maps live for a task.
#[derive(Clone, Debug)]
pub struct DatasetLayout {
    root: PathBuf,
    task: Task,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>, task: Task) -> Self {
        Self {
            root: root.into(),
            task,
        }
    }

    pub fn image_dir(&self, dataset: &str) -> PathBuf {
        self.root.join("Imgs").join(dataset)
    }

    pub fn gt_dir(&self, dataset: &str) -> PathBuf {
        if self.task.nested_layout() {
            self.root.join(dataset).join("GT")
        } else {
            self.root.join("GT").join(dataset)
        }
    }

    pub fn depth_dir(&self, dataset: &str) -> Option<PathBuf> {
        self.task
            .uses_depth()
            .then(|| self.root.join(dataset).join("depth"))
    }
}

/// Timing summary of the prediction phase for one dataset.
#[derive(Clone, Debug)]
pub struct DatasetTiming {
    pub samples: usize,
    pub average_seconds: f64,
}

/// Runs a strategy over every configured test set, then scores the written maps.
pub struct Evaluator<B: Backend, M> {
    config: EvalConfig,
    model: M,
    strategy: Box<dyn InferenceStrategy<B>>,
    layout: DatasetLayout,
    device: B::Device,
}

impl<B: Backend, M: SaliencyModel<B>> Evaluator<B, M> {
    pub fn new(
        config: EvalConfig,
        model: M,
        strategy: Box<dyn InferenceStrategy<B>>,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let layout = DatasetLayout::new(&config.test_dataset_root, config.task);
        Ok(Self {
            config,
            model,
            strategy,
            layout,
            device,
        })
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Directory that holds predictions for `dataset` under this checkpoint's epoch.
    pub fn prediction_dir(&self, dataset: &str) -> PathBuf {
        self.config.epoch_dir().join(dataset)
    }

    /// Predict every test image of `dataset` and write one PNG per sample.
    pub fn predict_dataset(&self, dataset: &str) -> Result<DatasetTiming> {
        let save_path = self.prediction_dir(dataset);
        std::fs::create_dir_all(&save_path).map_err(|err| Error::io(&save_path, err))?;
        info!(dataset, save_path = %save_path.display(), "writing predictions");

        let loader = TestLoader::new(
            &self.layout.image_dir(dataset),
            self.layout.depth_dir(dataset),
            self.config.test_size,
        )?;
        let bar = ProgressBar::new(loader.len() as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(dataset.to_string());

        let mut elapsed = Vec::with_capacity(loader.len());
        for sample in loader.iter::<B>(&self.device) {
            let sample = sample?;
            synchronize::<B>(&self.device)?;
            let start = Instant::now();
            let prediction = self.strategy.forward(
                &self.model,
                sample.image,
                sample.depth,
                sample.height,
                sample.width,
            )?;
            synchronize::<B>(&self.device)?;
            elapsed.push(start.elapsed().as_secs_f64());

            for map in tensor_to_maps(prediction)? {
                save_map(&map, &save_path.join(&sample.name))?;
            }
            bar.inc(1);
        }
        bar.finish();

        let average_seconds = elapsed.iter().sum::<f64>() / elapsed.len().max(1) as f64;
        info!(dataset, "Avg. Time used in this sequence: {average_seconds:.4}s");
        Ok(DatasetTiming {
            samples: elapsed.len(),
            average_seconds,
        })
    }

    /// MAE of the persisted predictions of `dataset` against its ground truth.
    pub fn evaluate_dataset(&self, dataset: &str) -> Result<f64> {
        let pairs = load_eval_pairs(&self.prediction_dir(dataset), &self.layout.gt_dir(dataset))?;
        eval_mae(
            dataset,
            pairs
                .iter()
                .map(|pair| (pair.prediction.as_slice(), pair.ground_truth.as_slice())),
        )
    }

    /// Score every dataset and write `results.csv` into the epoch directory.
    pub fn evaluate_all(&self) -> Result<ResultTable> {
        info!("========== Begin to evaluate the saved masks ==========");
        let mut table = ResultTable::new();
        for dataset in &self.config.datasets {
            let mae = self.evaluate_dataset(dataset).inspect_err(|err| {
                error!(dataset = %dataset, %err, "evaluation failed");
            })?;
            table.insert(dataset.clone(), mae);
        }

        let results_path = self.config.epoch_dir().join("results.csv");
        table.write_csv(&results_path)?;
        info!(
            path = %results_path.display(),
            "results\n{}",
            table.to_display_string()
        );
        Ok(table)
    }

    /// Both phases: predict all datasets, then evaluate them.
    pub fn run(&self) -> Result<ResultTable> {
        info!(
            method = %self.strategy.method(),
            epoch = %self.config.epoch_tag(),
            "starting evaluation"
        );
        for dataset in &self.config.datasets {
            self.predict_dataset(dataset)?;
        }
        self.evaluate_all()
    }
}

/// Wait for queued device work so timings cover the whole forward pass.
fn synchronize<B: Backend>(device: &B::Device) -> Result<()> {
    B::sync(device).map_err(|err| Error::Device(format!("{err:?}")))
}

/// Load the checkpoint named by `config`, pick the strategy and run both phases.
///
/// The generator runs on the inner backend of `A`; only the energy prior used by
/// Langevin sampling needs gradients.
pub fn evaluate<A: AutodiffBackend>(
    config: EvalConfig,
    device: <A::InnerBackend as Backend>::Device,
) -> Result<ResultTable> {
    config.validate()?;
    <A::InnerBackend as Backend>::seed(&device, config.seed);

    let checkpoint = config.checkpoint_path();
    let generator = load_checkpoint(
        config.model.init_generator::<A::InnerBackend>(&device),
        &checkpoint,
        &device,
    )?;
    info!(checkpoint = %checkpoint.display(), "loaded generator");

    let energy = if config.uncertainty_method.needs_energy_model() {
        let path = energy_checkpoint_path(&checkpoint)?;
        let energy = load_checkpoint(config.model.init_energy::<A>(&device), &path, &device)?;
        info!(checkpoint = %path.display(), "loaded energy prior");
        Some(energy)
    } else {
        None
    };

    let strategy = select_strategy::<A, EnergyPrior<A>>(
        config.uncertainty_method,
        config.model.latent_dim,
        &config.langevin,
        energy,
    )?;
    Evaluator::new(config, generator, strategy, device)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn synchronize_returns_the_device_status() {
        let device = Default::default();
        assert!(synchronize::<NdArray<f32>>(&device).is_ok());
        let err = Error::Device("lost".into());
        assert_eq!(err.to_string(), "device error: lost");
    }
}
