//! MAE aggregation, the per-dataset results table and running loss meters.

use crate::error::{Error, Result};
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::MetricName;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Mean absolute error between two maps of equal length.
pub fn mean_absolute_error(pred: &[f32], gt: &[f32]) -> f64 {
    if pred.is_empty() || pred.len() != gt.len() {
        return f64::NAN;
    }
    let total: f64 = pred
        .iter()
        .zip(gt)
        .map(|(p, g)| (f64::from(*p) - f64::from(*g)).abs())
        .sum();
    total / pred.len() as f64
}

/// Averages per-sample MAE values, excluding NaN results.
#[derive(Clone, Debug, Default)]
pub struct MaeAccumulator {
    sum: f64,
    valid: usize,
    excluded: usize,
}

impl MaeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample's MAE. NaN is counted as excluded, not as zero.
    pub fn push(&mut self, mae: f64) {
        if mae.is_nan() {
            self.excluded += 1;
        } else {
            self.sum += mae;
            self.valid += 1;
        }
    }

    pub fn push_pair(&mut self, pred: &[f32], gt: &[f32]) {
        self.push(mean_absolute_error(pred, gt));
    }

    pub fn valid(&self) -> usize {
        self.valid
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// Mean over valid samples; errors when none were seen.
    pub fn finish(&self, dataset: &str) -> Result<f64> {
        if self.excluded > 0 {
            debug!(dataset, excluded = self.excluded, "excluded NaN samples from MAE");
        }
        if self.valid == 0 {
            return Err(Error::NoValidSamples(dataset.to_string()));
        }
        Ok(self.sum / self.valid as f64)
    }
}

/// MAE of a sequence of (prediction, ground truth) maps.
pub fn eval_mae<'a, I>(dataset: &str, pairs: I) -> Result<f64>
where
    I: IntoIterator<Item = (&'a [f32], &'a [f32])>,
{
    let mut acc = MaeAccumulator::new();
    for (pred, gt) in pairs {
        acc.push_pair(pred, gt);
    }
    acc.finish(dataset)
}

/// Dataset name to MAE, kept in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultTable {
    entries: Vec<(String, f64)>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset: impl Into<String>, mae: f64) {
        let dataset = dataset.into();
        match self.entries.iter_mut().find(|(name, _)| *name == dataset) {
            Some(entry) => entry.1 = mae,
            None => self.entries.push((dataset, mae)),
        }
    }

    pub fn get(&self, dataset: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == dataset)
            .map(|(_, mae)| *mae)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Values rendered with four decimals.
    pub fn formatted_values(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(_, mae)| format!("{mae:.4}"))
            .collect()
    }

    /// Write a header row of dataset names and one row of values.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.columns())?;
        writer.write_record(self.formatted_values())?;
        writer.flush().map_err(|err| Error::io(path, err))?;
        Ok(())
    }

    /// Aligned two-line rendering for logs.
    pub fn to_display_string(&self) -> String {
        let values = self.formatted_values();
        let widths: Vec<usize> = self
            .columns()
            .zip(&values)
            .map(|(name, value)| name.len().max(value.len()))
            .collect();
        let header = self
            .columns()
            .zip(&widths)
            .map(|(name, &width)| format!("{name:>width$}"))
            .collect::<Vec<_>>()
            .join(" ");
        let row = values
            .iter()
            .zip(&widths)
            .map(|(value, &width)| format!("{value:>width$}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{header}\n{row}")
    }
}

/// Running mean weighted by batch size, backed by burn's numeric metric state.
#[derive(Clone)]
pub struct AverageMeter {
    name: MetricName,
    state: NumericMetricState,
    updates: usize,
}

impl AverageMeter {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::new(name.to_string()),
            state: NumericMetricState::default(),
            updates: 0,
        }
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.state
            .update(value, n, FormatOptions::new(self.name.clone()).precision(3));
        self.updates += 1;
    }

    pub fn average(&self) -> f64 {
        if self.updates == 0 {
            return 0.0;
        }
        self.state.running_value().current()
    }

    /// Number of `update` calls since the last reset.
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.updates = 0;
    }
}

/// The three loss statistics shown while training.
#[derive(Clone)]
pub struct LossRecord {
    pub total: AverageMeter,
    pub supervised: AverageMeter,
    pub discriminator: AverageMeter,
}

impl Default for LossRecord {
    fn default() -> Self {
        Self {
            total: AverageMeter::new("loss"),
            supervised: AverageMeter::new("sal_loss"),
            discriminator: AverageMeter::new("dis_loss"),
        }
    }
}

impl LossRecord {
    pub fn update(&mut self, total: f64, supervised: f64, batch_size: usize) {
        self.total.update(total, batch_size);
        self.supervised.update(supervised, batch_size);
        self.discriminator.update(total - supervised, batch_size);
    }

    pub fn reset(&mut self) {
        self.total.reset();
        self.supervised.reset();
        self.discriminator.reset();
    }

    /// `total|supervised|discriminator` with three decimals.
    pub fn summary(&self) -> String {
        format!(
            "{:.3}|{:.3}|{:.3}",
            self.total.average(),
            self.supervised.average(),
            self.discriminator.average()
        )
    }
}
