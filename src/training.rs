use crate::config::{scaled_size, TrainingConfig, TrainingVariant};
use crate::data::{SaliencyBatcher, SaliencyDataset, TrainBatch, TrainItem};
use crate::error::{Error, Result};
use crate::loss::{
    adversarial_bce, average_over_outputs, bce, confidence_target, StructureLoss, SupervisedLoss,
};
use crate::metrics::LossRecord;
use crate::model::layers::{resize_bilinear, upsample_nearest};
use crate::model::{
    load_checkpoint, load_record_file, save_checkpoint, save_record_file, ConfidenceModel,
    Discriminator, Generator, SaliencyModel,
};
use crate::utils::{PngStripSink, VisualizationSink};
use burn::config::Config;
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{Adam, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Persisted training state for resume support.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub learning_rate: f64,
}

/// Losses and detached probabilities of one optimization step pair.
#[derive(Clone, Debug)]
pub struct StepOutput<B: Backend> {
    pub generator_loss: f64,
    pub discriminator_loss: f64,
    /// `sigmoid` of every generator output, detached.
    pub predictions: Vec<Tensor<B, 4>>,
    pub gts: Tensor<B, 4>,
}

/// Result of the generator half of a step.
#[derive(Clone, Debug)]
pub struct GeneratorStep<B: Backend> {
    pub loss: f64,
    /// `sigmoid` of every generator output, detached.
    pub predictions: Vec<Tensor<B, 4>>,
}

/// A training batch resized to one scale, plus the discriminator conditioning.
#[derive(Clone, Debug)]
pub struct ScaledBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub gts: Tensor<B, 4>,
    pub depth: Option<Tensor<B, 4>>,
    /// Image (and depth) channels the discriminator sees next to a saliency map.
    pub conditioning: Tensor<B, 4>,
}

impl<B: Backend> ScaledBatch<B> {
    /// Resize images, depth and ground truth to the scaled training size when `rate != 1`.
    pub fn new(batch: &TrainBatch<B>, train_size: usize, rate: f64) -> Self {
        let (images, gts, depth) = if is_canonical_rate(rate) {
            (batch.images.clone(), batch.gts.clone(), batch.depth.clone())
        } else {
            let size = scaled_size(train_size, rate);
            (
                resize_bilinear(batch.images.clone(), size, size),
                resize_bilinear(batch.gts.clone(), size, size),
                batch
                    .depth
                    .clone()
                    .map(|depth| resize_bilinear(depth, size, size)),
            )
        };
        let conditioning = match &depth {
            Some(depth) => Tensor::cat(vec![images.clone(), depth.clone()], 1),
            None => images.clone(),
        };
        Self {
            images,
            gts,
            depth,
            conditioning,
        }
    }

    fn dims(&self) -> [usize; 3] {
        let [batch_size, _, height, width] = self.images.dims();
        [batch_size, height, width]
    }
}

/// Step settings fixed for the whole run.
#[derive(Clone, Debug)]
pub struct TrainerSettings {
    pub variant: TrainingVariant,
    pub train_size: usize,
    pub latent_dim: usize,
    pub adv_weight: f64,
}

impl TrainerSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            variant: config.variant,
            train_size: config.train_size,
            latent_dim: config.model.latent_dim,
            adv_weight: config.adv_weight,
        }
    }
}

/// Multiplies the learning rate by `decay_rate` every `decay_epoch` epochs.
///
/// `step` is called once at the start of every 1-based epoch and returns the
/// rate for that epoch.
#[derive(Clone, Debug)]
pub struct StepDecayLrScheduler {
    lr: f64,
    decay_rate: f64,
    decay_epoch: usize,
    epoch: usize,
}

#[derive(Record, Clone)]
pub struct StepDecayLrRecord {
    lr: f64,
    epoch: usize,
}

impl StepDecayLrScheduler {
    pub fn new(lr: f64, decay_rate: f64, decay_epoch: usize) -> Self {
        Self {
            lr,
            decay_rate,
            decay_epoch,
            epoch: 0,
        }
    }

    /// Rate returned by the last `step`, or the initial rate before the first one.
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl LrScheduler for StepDecayLrScheduler {
    type Record<B: Backend> = StepDecayLrRecord;

    fn step(&mut self) -> f64 {
        self.epoch += 1;
        if self.decay_epoch > 0 && self.epoch > 1 && (self.epoch - 1) % self.decay_epoch == 0 {
            self.lr *= self.decay_rate;
        }
        self.lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        StepDecayLrRecord {
            lr: self.lr,
            epoch: self.epoch,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.lr = record.lr;
        self.epoch = record.epoch;
        self
    }
}

/// Generator, optional discriminator and their optimizers.
///
/// Every step consumes the trainer and hands it back with updated modules, so
/// parameters are only ever changed by an optimizer step.
pub struct AdversarialTrainer<B, G, D, OG, OD, L>
where
    B: AutodiffBackend,
{
    generator: G,
    discriminator: Option<D>,
    optim_generator: OG,
    optim_discriminator: Option<OD>,
    loss: L,
    settings: TrainerSettings,
    generator_lr: f64,
    discriminator_lr: f64,
    _backend: PhantomData<B>,
}

/// The trainer used by the `train` binary.
pub type SaliencyTrainer<B> = AdversarialTrainer<
    B,
    Generator<B>,
    Discriminator<B>,
    OptimizerAdaptor<Adam, Generator<B>, B>,
    OptimizerAdaptor<Adam, Discriminator<B>, B>,
    StructureLoss,
>;

impl<B, G, D, OG, OD, L> AdversarialTrainer<B, G, D, OG, OD, L>
where
    B: AutodiffBackend,
    G: AutodiffModule<B> + SaliencyModel<B>,
    D: AutodiffModule<B> + ConfidenceModel<B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
    L: SupervisedLoss<B>,
{
    pub fn new(
        generator: G,
        discriminator: Option<(D, OD)>,
        optim_generator: OG,
        loss: L,
        settings: TrainerSettings,
    ) -> Result<Self> {
        if settings.variant.has_discriminator() != discriminator.is_some() {
            return Err(Error::Configuration(format!(
                "training variant {:?} {} a discriminator",
                settings.variant,
                if settings.variant.has_discriminator() { "needs" } else { "does not use" }
            )));
        }
        if settings.variant == TrainingVariant::Gan && settings.latent_dim == 0 {
            return Err(Error::Configuration(
                "the gan variant needs a latent dimension".into(),
            ));
        }
        let (discriminator, optim_discriminator) = match discriminator {
            Some((module, optim)) => (Some(module), Some(optim)),
            None => (None, None),
        };
        Ok(Self {
            generator,
            discriminator,
            optim_generator,
            optim_discriminator,
            loss,
            settings,
            generator_lr: 0.0,
            discriminator_lr: 0.0,
            _backend: PhantomData,
        })
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn discriminator(&self) -> Option<&D> {
        self.discriminator.as_ref()
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn set_learning_rates(&mut self, generator: f64, discriminator: f64) {
        self.generator_lr = generator;
        self.discriminator_lr = discriminator;
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.generator_lr, self.discriminator_lr)
    }

    /// Write both optimizers' state next to the module checkpoints of `epoch`.
    pub fn save_optimizers(&self, save_path: &Path, epoch: usize) -> Result<()> {
        save_record_file::<B, _>(
            self.optim_generator.to_record(),
            &checkpoint_path(save_path, epoch, "generator_optim"),
        )?;
        if let Some(optim) = &self.optim_discriminator {
            save_record_file::<B, _>(
                optim.to_record(),
                &checkpoint_path(save_path, epoch, "discriminator_optim"),
            )?;
        }
        Ok(())
    }

    /// Restore the optimizer state written by [`Self::save_optimizers`].
    pub fn load_optimizers(
        mut self,
        save_path: &Path,
        epoch: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let record = load_record_file::<B, <OG as Optimizer<G, B>>::Record>(
            &checkpoint_path(save_path, epoch, "generator_optim"),
            device,
        )?;
        self.optim_generator = self.optim_generator.load_record(record);
        if let Some(optim) = self.optim_discriminator.take() {
            let record = load_record_file::<B, <OD as Optimizer<D, B>>::Record>(
                &checkpoint_path(save_path, epoch, "discriminator_optim"),
                device,
            )?;
            self.optim_discriminator = Some(optim.load_record(record));
        }
        Ok(self)
    }

    /// Generator update for one scaled batch. Only generator parameters move.
    pub fn generator_step(mut self, input: &ScaledBatch<B>) -> Result<(Self, GeneratorStep<B>)> {
        let [batch_size, height, width] = input.dims();
        let latent = (self.settings.variant == TrainingVariant::Gan).then(|| {
            Tensor::<B, 2>::random(
                [batch_size, self.settings.latent_dim],
                Distribution::Normal(0.0, 1.0),
                &input.images.device(),
            )
        });
        let outputs = self
            .generator
            .predict(input.images.clone(), input.depth.clone(), latent);
        if outputs.is_empty() {
            return Err(Error::EmptyModelOutput);
        }
        let predictions: Vec<Tensor<B, 4>> = outputs
            .iter()
            .map(|output| sigmoid(output.clone().detach()))
            .collect();
        let supervised = average_over_outputs(&self.loss, &outputs, &input.gts, None);

        let loss = match (self.settings.variant, &self.discriminator) {
            (TrainingVariant::Confidence, Some(disc)) => {
                let weights: Vec<Tensor<B, 4>> = predictions
                    .iter()
                    .map(|prob| {
                        confidence_map(disc, &input.conditioning, prob.clone(), height, width)
                            .detach()
                    })
                    .collect();
                let weighted =
                    average_over_outputs(&self.loss, &outputs, &input.gts, Some(&weights));
                supervised.add(weighted).div_scalar(2.0)
            }
            (TrainingVariant::Gan, Some(disc)) => {
                let prob = outputs
                    .last()
                    .map(|output| sigmoid(output.clone()))
                    .ok_or(Error::EmptyModelOutput)?;
                let fake = discriminate(disc, &input.conditioning, prob);
                let adversarial = adversarial_bce(fake, true);
                supervised.add(adversarial.mul_scalar(self.settings.adv_weight))
            }
            _ => supervised,
        };

        let value = scalar(&loss);
        let grads = GradientsParams::from_grads(loss.backward(), &self.generator);
        self.generator = self
            .optim_generator
            .step(self.generator_lr, self.generator, grads);

        Ok((
            self,
            GeneratorStep {
                loss: value,
                predictions,
            },
        ))
    }

    /// Discriminator update on detached predictions. Returns 0 without a discriminator.
    pub fn discriminator_step(
        mut self,
        input: &ScaledBatch<B>,
        predictions: &[Tensor<B, 4>],
    ) -> (Self, f64) {
        let [_, height, width] = input.dims();
        let value = match (self.discriminator.take(), self.optim_discriminator.as_mut()) {
            (Some(disc), Some(optim)) => {
                let loss = discriminator_loss(
                    self.settings.variant,
                    &disc,
                    &input.conditioning,
                    predictions,
                    &input.gts,
                    height,
                    width,
                );
                let value = scalar(&loss);
                let grads = GradientsParams::from_grads(loss.backward(), &disc);
                self.discriminator = Some(optim.step(self.discriminator_lr, disc, grads));
                value
            }
            (disc, _) => {
                self.discriminator = disc;
                0.0
            }
        };
        (self, value)
    }

    /// One generator step followed by one discriminator step at one resize rate.
    ///
    /// The loss record is only updated at the canonical rate of 1.
    pub fn step(
        self,
        batch: &TrainBatch<B>,
        rate: f64,
        record: &mut LossRecord,
    ) -> Result<(Self, StepOutput<B>)> {
        let input = ScaledBatch::new(batch, self.settings.train_size, rate);
        let (trainer, generator) = self.generator_step(&input)?;
        let (trainer, discriminator_loss) =
            trainer.discriminator_step(&input, &generator.predictions);

        if is_canonical_rate(rate) {
            let [batch_size, _, _] = input.dims();
            record.update(
                generator.loss + discriminator_loss,
                generator.loss,
                batch_size,
            );
        }

        Ok((
            trainer,
            StepOutput {
                generator_loss: generator.loss,
                discriminator_loss,
                predictions: generator.predictions,
                gts: input.gts.detach(),
            },
        ))
    }

    /// Run every batch at every resize rate, reporting rolling averages.
    pub fn train_one_epoch<I>(
        self,
        batches: I,
        progress: &EpochProgress<'_, B>,
    ) -> Result<(Self, LossRecord)>
    where
        I: IntoIterator<Item = TrainBatch<B>>,
    {
        info!(
            epoch = progress.epoch,
            "Learning Rate: {:.2e}",
            self.generator_lr
        );
        let bar = ProgressBar::new(progress.num_batches as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(format!("Epoch[{:03}/{:03}]", progress.epoch, progress.epochs));

        let mut record = LossRecord::default();
        let mut trainer = self;
        for (index, batch) in batches.into_iter().enumerate() {
            for &rate in progress.size_rates {
                let (next, output) = trainer.step(&batch, rate, &mut record)?;
                trainer = next;
                if let Some(sink) = &progress.visualization {
                    if sink.every > 0 && index % sink.every == 0 && is_canonical_rate(rate) {
                        let mut maps = output.predictions;
                        maps.push(output.gts);
                        let tag = format!("epoch_{:03}_batch_{index:05}", progress.epoch);
                        if let Err(err) = sink.sink.visualize(&tag, &maps) {
                            warn!(%err, "failed to write visualization");
                        }
                    }
                }
            }
            bar.set_message(format!("loss={}", record.summary()));
            bar.inc(1);
        }
        bar.finish();

        Ok((trainer, record))
    }
}

/// Where an epoch sits in the run and what it reports.
pub struct EpochProgress<'a, B: Backend> {
    pub epoch: usize,
    pub epochs: usize,
    pub num_batches: usize,
    pub size_rates: &'a [f64],
    pub visualization: Option<Visualization<'a, B>>,
}

/// A sink that receives predictions every `every` batches.
pub struct Visualization<'a, B: Backend> {
    pub sink: &'a dyn VisualizationSink<B>,
    pub every: usize,
}

fn is_canonical_rate(rate: f64) -> bool {
    (rate - 1.0).abs() < f64::EPSILON
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f64 {
    loss.clone().into_scalar().elem::<f64>()
}

/// Discriminator logits for `cat(conditioning, map)` at the discriminator's resolution.
fn discriminate<B: Backend, D: ConfidenceModel<B>>(
    discriminator: &D,
    conditioning: &Tensor<B, 4>,
    map: Tensor<B, 4>,
) -> Tensor<B, 4> {
    discriminator.confidence_logits(Tensor::cat(vec![conditioning.clone(), map], 1))
}

/// Discriminator output upsampled to `height x width` and squashed to `[0, 1]`.
fn confidence_map<B: Backend, D: ConfidenceModel<B>>(
    discriminator: &D,
    conditioning: &Tensor<B, 4>,
    map: Tensor<B, 4>,
    height: usize,
    width: usize,
) -> Tensor<B, 4> {
    let logits = discriminate(discriminator, conditioning, map);
    sigmoid(upsample_nearest(logits, height, width))
}

fn discriminator_loss<B: Backend, D: ConfidenceModel<B>>(
    variant: TrainingVariant,
    discriminator: &D,
    conditioning: &Tensor<B, 4>,
    probs: &[Tensor<B, 4>],
    gts: &Tensor<B, 4>,
    height: usize,
    width: usize,
) -> Tensor<B, 1> {
    let loss = match (variant, probs.last()) {
        (TrainingVariant::Gan, Some(fake_prob)) => {
            let fake = discriminate(discriminator, conditioning, fake_prob.clone());
            let real = discriminate(discriminator, conditioning, gts.clone());
            Some(
                adversarial_bce(fake, false)
                    .add(adversarial_bce(real, true))
                    .mul_scalar(0.5),
            )
        }
        _ => probs
            .iter()
            .map(|prob| {
                let confidence =
                    confidence_map(discriminator, conditioning, prob.clone(), height, width);
                bce(confidence, confidence_target(gts.clone(), prob.clone()))
            })
            .reduce(|acc, loss| acc.add(loss))
            .map(|total| total.div_scalar(probs.len() as f64)),
    };
    loss.unwrap_or_else(|| Tensor::zeros([1], &gts.device()))
}

fn checkpoint_path(save_path: &Path, epoch: usize, name: &str) -> PathBuf {
    save_path.join(format!("{epoch}_{name}.mpk"))
}

fn read_training_state(path: &Path) -> Result<TrainingState> {
    let contents = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
    serde_json::from_str(&contents).map_err(|err| Error::Configuration(format!(
        "invalid training state {}: {err}",
        path.display()
    )))
}

fn write_training_state(path: &Path, state: &TrainingState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|err| Error::Configuration(format!("failed to serialize training state: {err}")))?;
    std::fs::write(path, json).map_err(|err| Error::io(path, err))
}

/// Train the generator (and discriminator) for `config.epochs` epochs.
///
/// Checkpoints land in `save_path` as `<epoch>_generator.mpk` and
/// `<epoch>_discriminator.mpk`, together with `config.json` and `state.json`.
pub fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> Result<LossRecord> {
    config.validate()?;
    let save_path = PathBuf::from(&config.save_path);
    let log_path = PathBuf::from(&config.log_path);
    std::fs::create_dir_all(&save_path).map_err(|err| Error::io(&save_path, err))?;
    std::fs::create_dir_all(&log_path).map_err(|err| Error::io(&log_path, err))?;
    let config_path = save_path.join("config.json");
    config
        .save(&config_path)
        .map_err(|err| Error::io(&config_path, err))?;

    let state_path = save_path.join("state.json");
    let mut state = TrainingState {
        epoch: 0,
        learning_rate: config.learning_rate,
    };
    if config.resume && state_path.exists() {
        state = read_training_state(&state_path)?;
        info!(
            epoch = state.epoch,
            learning_rate = state.learning_rate,
            "resuming training"
        );
    }

    B::seed(&device, config.seed);

    let dataset = SaliencyDataset::load(
        Path::new(&config.train_image_root),
        Path::new(&config.train_gt_root),
        config.train_depth_root.as_deref().map(Path::new),
        config.train_size,
    )?;
    let num_batches = dataset.len().div_ceil(config.batch_size);
    info!(samples = dataset.len(), batches = num_batches, "loaded training set");
    let loader = DataLoaderBuilder::<B, TrainItem, TrainBatch<B>>::new(SaliencyBatcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(dataset);

    let mut generator = config.model.init_generator::<B>(&device);
    let mut discriminator = config
        .variant
        .has_discriminator()
        .then(|| config.model.init_discriminator::<B>(&device));
    if state.epoch > 0 {
        generator = load_checkpoint(
            generator,
            &checkpoint_path(&save_path, state.epoch, "generator"),
            &device,
        )?;
        discriminator = match discriminator {
            Some(disc) => Some(load_checkpoint(
                disc,
                &checkpoint_path(&save_path, state.epoch, "discriminator"),
                &device,
            )?),
            None => None,
        };
    }

    let discriminator = discriminator.map(|disc| {
        (
            disc,
            config
                .optimizer_discriminator
                .init::<B, Discriminator<B>>(),
        )
    });
    let mut trainer: SaliencyTrainer<B> = AdversarialTrainer::new(
        generator,
        discriminator,
        config.optimizer_generator.init::<B, Generator<B>>(),
        StructureLoss::default(),
        TrainerSettings::from_config(&config),
    )?;
    let mut generator_schedule =
        StepDecayLrScheduler::new(config.learning_rate, config.decay_rate, config.decay_epoch);
    let mut discriminator_schedule = StepDecayLrScheduler::new(
        config.discriminator_learning_rate,
        config.decay_rate,
        config.decay_epoch,
    );
    if state.epoch > 0 {
        trainer = trainer.load_optimizers(&save_path, state.epoch, &device)?;
        generator_schedule = load_scheduler::<B>(
            generator_schedule,
            &checkpoint_path(&save_path, state.epoch, "generator_lr"),
            &device,
        )?;
        discriminator_schedule = load_scheduler::<B>(
            discriminator_schedule,
            &checkpoint_path(&save_path, state.epoch, "discriminator_lr"),
            &device,
        )?;
        if (generator_schedule.learning_rate() - state.learning_rate).abs() > 1e-12 {
            warn!(
                scheduler = generator_schedule.learning_rate(),
                state = state.learning_rate,
                "learning rate in state.json disagrees with the scheduler record"
            );
        }
    }

    let sink = PngStripSink::new(&log_path);
    let mut record = LossRecord::default();
    for epoch in (state.epoch + 1)..=config.epochs {
        let generator_lr = generator_schedule.step();
        let discriminator_lr = discriminator_schedule.step();
        trainer.set_learning_rates(generator_lr, discriminator_lr);

        let progress = EpochProgress {
            epoch,
            epochs: config.epochs,
            num_batches,
            size_rates: &config.size_rates,
            visualization: (config.visualize_every > 0).then(|| Visualization {
                sink: &sink as &dyn VisualizationSink<B>,
                every: config.visualize_every,
            }),
        };
        let (next, epoch_record) = trainer.train_one_epoch(loader.iter(), &progress)?;
        trainer = next;
        record = epoch_record;
        info!(epoch, loss = %record.summary(), "finished epoch");

        let due = config.checkpoint_every > 0 && epoch % config.checkpoint_every == 0;
        if due || epoch == config.epochs {
            let generator_path = checkpoint_path(&save_path, epoch, "generator");
            save_checkpoint(trainer.generator().clone(), &generator_path)?;
            if let Some(disc) = trainer.discriminator() {
                save_checkpoint(
                    disc.clone(),
                    &checkpoint_path(&save_path, epoch, "discriminator"),
                )?;
            }
            trainer.save_optimizers(&save_path, epoch)?;
            save_record_file::<B, _>(
                generator_schedule.to_record::<B>(),
                &checkpoint_path(&save_path, epoch, "generator_lr"),
            )?;
            save_record_file::<B, _>(
                discriminator_schedule.to_record::<B>(),
                &checkpoint_path(&save_path, epoch, "discriminator_lr"),
            )?;
            write_training_state(
                &state_path,
                &TrainingState {
                    epoch,
                    learning_rate: generator_lr,
                },
            )?;
            info!(path = %generator_path.display(), "saved checkpoint");
        }
    }

    Ok(record)
}

fn load_scheduler<B: Backend>(
    scheduler: StepDecayLrScheduler,
    path: &Path,
    device: &B::Device,
) -> Result<StepDecayLrScheduler> {
    let record = load_record_file::<B, StepDecayLrRecord>(path, device)?;
    Ok(scheduler.load_record::<B>(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::{AdamConfig, SgdConfig};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn trainer(variant: TrainingVariant, train_size: usize) -> SaliencyTrainer<TestBackend> {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_generator_dim(4)
            .with_discriminator_dim(4)
            .with_latent_dim(4);
        let discriminator = variant.has_discriminator().then(|| {
            (
                model.init_discriminator::<TestBackend>(&device),
                AdamConfig::new().init::<TestBackend, Discriminator<TestBackend>>(),
            )
        });
        let mut trainer = AdversarialTrainer::new(
            model.init_generator::<TestBackend>(&device),
            discriminator,
            AdamConfig::new().init::<TestBackend, Generator<TestBackend>>(),
            StructureLoss::new(3),
            TrainerSettings {
                variant,
                train_size,
                latent_dim: 4,
                adv_weight: 0.1,
            },
        )
        .unwrap();
        trainer.set_learning_rates(1e-3, 1e-3);
        trainer
    }

    fn batch(size: usize) -> TrainBatch<TestBackend> {
        let device = Default::default();
        TrainBatch {
            images: Tensor::<TestBackend, 4>::random(
                [2, 3, size, size],
                Distribution::Default,
                &device,
            ),
            gts: Tensor::<TestBackend, 4>::random([2, 1, size, size], Distribution::Default, &device)
                .greater_elem(0.5)
                .float(),
            depth: None,
        }
    }

    #[test]
    fn canonical_rate_updates_each_meter_once() {
        for variant in [TrainingVariant::Confidence, TrainingVariant::Gan, TrainingVariant::Plain] {
            let mut record = LossRecord::default();
            let (_, output) = trainer(variant, 32)
                .step(&batch(32), 1.0, &mut record)
                .unwrap();
            assert_eq!(record.total.updates(), 1);
            assert_eq!(record.supervised.updates(), 1);
            assert_eq!(record.discriminator.updates(), 1);
            assert!(output.generator_loss.is_finite());
            let expected = output.discriminator_loss;
            assert!((record.discriminator.average() - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn other_rates_leave_the_record_untouched() {
        let mut record = LossRecord::default();
        let (_, output) = trainer(TrainingVariant::Confidence, 64)
            .step(&batch(64), 0.5, &mut record)
            .unwrap();
        assert_eq!(record.total.updates(), 0);
        assert_eq!(record.supervised.updates(), 0);
        assert_eq!(record.discriminator.updates(), 0);
        assert_eq!(output.predictions[0].dims(), [2, 1, 32, 32]);
    }

    #[test]
    fn plain_variant_has_no_discriminator_loss() {
        let mut record = LossRecord::default();
        let (trainer, output) = trainer(TrainingVariant::Plain, 32)
            .step(&batch(32), 1.0, &mut record)
            .unwrap();
        assert!(trainer.discriminator().is_none());
        assert_eq!(output.discriminator_loss, 0.0);
        assert_eq!(record.discriminator.average(), 0.0);
    }

    #[test]
    fn variant_and_discriminator_must_agree() {
        let device = Default::default();
        let model = ModelConfig::new().with_generator_dim(4);
        let result: Result<SaliencyTrainer<TestBackend>> = AdversarialTrainer::new(
            model.init_generator::<TestBackend>(&device),
            None,
            AdamConfig::new().init::<TestBackend, Generator<TestBackend>>(),
            StructureLoss::new(3),
            TrainerSettings {
                variant: TrainingVariant::Confidence,
                train_size: 32,
                latent_dim: 4,
                adv_weight: 0.1,
            },
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn step_updates_generator_weights() {
        let device = Default::default();
        let trainer = trainer(TrainingVariant::Gan, 32);
        let fixed_image = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let before = trainer.generator().forward(fixed_image.clone(), None, None)[1]
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let mut record = LossRecord::default();
        let (trainer, _) = trainer.step(&batch(32), 1.0, &mut record).unwrap();
        let after = trainer.generator().forward(fixed_image, None, None)[1]
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(before.iter().zip(&after).any(|(a, b)| (a - b).abs() > 0.0));
    }

    #[test]
    fn epoch_runs_every_rate_and_reports_canonical_losses() {
        let progress = EpochProgress::<TestBackend> {
            epoch: 1,
            epochs: 1,
            num_batches: 2,
            size_rates: &[0.5, 1.0],
            visualization: None,
        };
        let (_, record) = trainer(TrainingVariant::Confidence, 64)
            .train_one_epoch(vec![batch(64), batch(64)], &progress)
            .unwrap();
        assert_eq!(record.total.updates(), 2);
        assert!(record.summary().split('|').count() == 3);
    }

    #[test]
    fn training_state_roundtrips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let state = TrainingState {
            epoch: 10,
            learning_rate: 2.25e-5,
        };
        write_training_state(&path, &state).unwrap();
        assert_eq!(read_training_state(&path).unwrap(), state);
    }

    fn ramp(channels: usize, size: usize) -> Tensor<TestBackend, 4> {
        let n = channels * size * size;
        Tensor::<TestBackend, 1, Int>::arange(0..n as i64, &Default::default())
            .float()
            .div_scalar(n as f64)
            .reshape([1, channels, size, size])
    }

    fn generator_signature<G: SaliencyModel<TestBackend>>(generator: &G) -> Vec<f32> {
        generator.predict(ramp(3, 32), None, None)[1]
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    fn discriminator_signature<D: ConfidenceModel<TestBackend>>(discriminator: &D) -> Vec<f32> {
        discriminator
            .confidence_logits(ramp(4, 32))
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn generator_step_leaves_the_discriminator_untouched() {
        for variant in [TrainingVariant::Confidence, TrainingVariant::Gan] {
            let trainer = trainer(variant, 32);
            let disc_before = discriminator_signature(trainer.discriminator().unwrap());
            let gen_before = generator_signature(trainer.generator());

            let input = ScaledBatch::new(&batch(32), 32, 1.0);
            let (trainer, _) = trainer.generator_step(&input).unwrap();

            assert_eq!(discriminator_signature(trainer.discriminator().unwrap()), disc_before);
            assert_ne!(generator_signature(trainer.generator()), gen_before);
        }
    }

    #[test]
    fn discriminator_step_leaves_the_generator_untouched() {
        for variant in [TrainingVariant::Confidence, TrainingVariant::Gan] {
            let trainer = trainer(variant, 32);
            let input = ScaledBatch::new(&batch(32), 32, 1.0);
            let (trainer, generated) = trainer.generator_step(&input).unwrap();
            let gen_before = generator_signature(trainer.generator());
            let disc_before = discriminator_signature(trainer.discriminator().unwrap());

            let (trainer, loss) = trainer.discriminator_step(&input, &generated.predictions);

            assert!(loss.is_finite() && loss > 0.0);
            assert_eq!(generator_signature(trainer.generator()), gen_before);
            assert_ne!(discriminator_signature(trainer.discriminator().unwrap()), disc_before);
        }
    }

    #[test]
    fn gan_adversarial_term_reaches_the_generator_only() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_generator_dim(4)
            .with_discriminator_dim(4)
            .with_latent_dim(4);
        let generator = model.init_generator::<TestBackend>(&device);
        let discriminator = model.init_discriminator::<TestBackend>(&device);
        let input = ScaledBatch::new(&batch(32), 32, 1.0);

        let run = |adv_weight: f64| {
            let mut trainer = AdversarialTrainer::new(
                generator.clone(),
                Some((
                    discriminator.clone(),
                    SgdConfig::new().init::<TestBackend, Discriminator<TestBackend>>(),
                )),
                SgdConfig::new().init::<TestBackend, Generator<TestBackend>>(),
                StructureLoss::new(3),
                TrainerSettings {
                    variant: TrainingVariant::Gan,
                    train_size: 32,
                    latent_dim: 4,
                    adv_weight,
                },
            )
            .unwrap();
            trainer.set_learning_rates(0.1, 0.1);
            TestBackend::seed(&device, 7);
            let (trainer, _) = trainer.generator_step(&input).unwrap();
            (
                generator_signature(trainer.generator()),
                discriminator_signature(trainer.discriminator().unwrap()),
            )
        };

        let (supervised_only, disc_a) = run(0.0);
        let (with_adversarial, disc_b) = run(1.0);
        assert_ne!(supervised_only, with_adversarial);
        assert_eq!(disc_a, discriminator_signature(&discriminator));
        assert_eq!(disc_b, disc_a);
    }

    #[test]
    fn step_decay_scheduler_halves_every_two_epochs() {
        let mut scheduler = StepDecayLrScheduler::new(1.0, 0.5, 2);
        let rates: Vec<f64> = (0..5).map(|_| scheduler.step()).collect();
        assert_eq!(rates, vec![1.0, 1.0, 0.5, 0.5, 0.25]);
        assert_eq!(scheduler.epoch(), 5);
    }

    #[test]
    fn scheduler_resumes_from_its_record() {
        let device = Default::default();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("3_generator_lr.mpk");
        let mut scheduler = StepDecayLrScheduler::new(2.5e-5, 0.9, 2);
        for _ in 0..3 {
            scheduler.step();
        }
        save_record_file::<TestBackend, _>(scheduler.to_record::<TestBackend>(), &path).unwrap();

        let mut resumed = load_scheduler::<TestBackend>(
            StepDecayLrScheduler::new(2.5e-5, 0.9, 2),
            &path,
            &device,
        )
        .unwrap();
        assert_eq!(resumed.epoch(), 3);
        assert_eq!(resumed.step(), scheduler.step());
    }

    #[test]
    fn optimizer_state_survives_a_checkpoint() {
        let device = Default::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut record = LossRecord::default();
        let (stepped, _) = trainer(TrainingVariant::Confidence, 32)
            .step(&batch(32), 1.0, &mut record)
            .unwrap();
        stepped.save_optimizers(tmp.path(), 1).unwrap();
        assert!(tmp.path().join("1_generator_optim.mpk").exists());
        assert!(tmp.path().join("1_discriminator_optim.mpk").exists());

        // A fresh trainer with the same weights continues exactly like the saved one.
        let fresh = AdversarialTrainer::new(
            stepped.generator().clone(),
            stepped.discriminator().cloned().map(|disc| {
                (
                    disc,
                    AdamConfig::new().init::<TestBackend, Discriminator<TestBackend>>(),
                )
            }),
            AdamConfig::new().init::<TestBackend, Generator<TestBackend>>(),
            StructureLoss::new(3),
            stepped.settings().clone(),
        )
        .unwrap();
        let mut fresh = fresh.load_optimizers(tmp.path(), 1, &device).unwrap();
        fresh.set_learning_rates(1e-3, 1e-3);

        let input = ScaledBatch::new(&batch(32), 32, 1.0);
        let (continued, _) = stepped.generator_step(&input).unwrap();
        let (restored, _) = fresh.generator_step(&input).unwrap();
        let a = generator_signature(continued.generator());
        let b = generator_signature(restored.generator());
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-5));

        let missing = trainer(TrainingVariant::Plain, 32).load_optimizers(tmp.path(), 2, &device);
        assert!(matches!(missing, Err(Error::MissingCheckpoint(_))));
    }
}
