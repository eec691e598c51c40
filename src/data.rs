use crate::error::{Error, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-channel ImageNet statistics used to normalize RGB input.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "JPG"];

/// One test image ready for inference.
#[derive(Clone, Debug)]
pub struct Sample<B: Backend> {
    /// `[1, 3, size, size]`, ImageNet-normalized.
    pub image: Tensor<B, 4>,
    /// `[1, 1, size, size]` in `[0, 1]` for RGB-D test sets.
    pub depth: Option<Tensor<B, 4>>,
    /// Original resolution the prediction is resized back to.
    pub height: usize,
    pub width: usize,
    /// Output file name, always with a `.png` extension.
    pub name: String,
}

/// Image files of one test dataset, loaded lazily and in sorted order.
#[derive(Clone, Debug)]
pub struct TestLoader {
    images: Vec<PathBuf>,
    depth_dir: Option<PathBuf>,
    size: u32,
}

impl TestLoader {
    pub fn new(image_dir: &Path, depth_dir: Option<PathBuf>, size: usize) -> Result<Self> {
        let images = list_images(image_dir)?;
        if images.is_empty() {
            return Err(Error::EmptyDataset(image_dir.to_path_buf()));
        }
        Ok(Self {
            images,
            depth_dir,
            size: size as u32,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn load<B: Backend>(&self, index: usize, device: &B::Device) -> Result<Sample<B>> {
        let path = self.images.get(index).ok_or(Error::SampleOutOfRange {
            index,
            len: self.images.len(),
        })?;
        let rgb = load_rgb(path)?;
        let (width, height) = rgb.dimensions();
        let resized = resize_rgb(&rgb, self.size, self.size);
        let size = self.size as usize;
        let image = Tensor::<B, 4>::from_data(
            TensorData::new(rgb_to_normalized_chw(&resized), [1, 3, size, size]),
            device,
        );

        let depth = match &self.depth_dir {
            Some(dir) => {
                let depth_path = find_by_stem(dir, path)
                    .ok_or_else(|| Error::io(dir.join(file_stem(path)), missing_file()))?;
                let depth = resize_gray(&load_gray(&depth_path)?, self.size, self.size);
                Some(Tensor::<B, 4>::from_data(
                    TensorData::new(gray_to_unit(&depth), [1, 1, size, size]),
                    device,
                ))
            }
            None => None,
        };

        Ok(Sample {
            image,
            depth,
            height: height as usize,
            width: width as usize,
            name: format!("{}.png", file_stem(path)),
        })
    }

    pub fn iter<'a, B: Backend>(
        &'a self,
        device: &'a B::Device,
    ) -> impl Iterator<Item = Result<Sample<B>>> + 'a {
        (0..self.len()).map(move |index| self.load(index, device))
    }
}

/// A persisted prediction and its ground truth, both in `[0, 1]` at GT resolution.
#[derive(Clone, Debug)]
pub struct MapPair {
    pub name: String,
    pub prediction: Vec<f32>,
    pub ground_truth: Vec<f32>,
}

/// Pair every prediction in `pred_dir` with the ground truth of the same stem.
///
/// Predictions without ground truth are skipped; a prediction whose size differs
/// from its ground truth is resized to match.
pub fn load_eval_pairs(pred_dir: &Path, gt_dir: &Path) -> Result<Vec<MapPair>> {
    let mut pairs = Vec::new();
    for pred_path in list_images(pred_dir)? {
        let Some(gt_path) = find_by_stem(gt_dir, &pred_path) else {
            warn!(
                prediction = %pred_path.display(),
                gt_dir = %gt_dir.display(),
                "no ground truth for prediction, skipping"
            );
            continue;
        };
        let gt = load_gray(&gt_path)?;
        let mut pred = load_gray(&pred_path)?;
        if pred.dimensions() != gt.dimensions() {
            debug!(
                name = %pred_path.display(),
                from = ?pred.dimensions(),
                to = ?gt.dimensions(),
                "resizing prediction to ground truth"
            );
            pred = resize_gray(&pred, gt.width(), gt.height());
        }
        pairs.push(MapPair {
            name: file_stem(&pred_path),
            prediction: gray_to_unit(&pred),
            ground_truth: gray_to_unit(&gt),
        });
    }
    Ok(pairs)
}

/// A training example, already resized to the base training size.
#[derive(Clone, Debug)]
pub struct TrainItem {
    pub image: RgbImage,
    pub gt: GrayImage,
    pub depth: Option<GrayImage>,
}

/// Image/ground-truth(/depth) triples matched by file stem.
#[derive(Clone, Debug)]
pub struct SaliencyDataset {
    items: Vec<TrainItem>,
}

impl SaliencyDataset {
    pub fn load(
        image_root: &Path,
        gt_root: &Path,
        depth_root: Option<&Path>,
        size: usize,
    ) -> Result<Self> {
        let size = size as u32;
        let mut items = Vec::new();
        for image_path in list_images(image_root)? {
            let Some(gt_path) = find_by_stem(gt_root, &image_path) else {
                warn!(image = %image_path.display(), "no ground truth for training image, skipping");
                continue;
            };
            let depth = match depth_root {
                Some(root) => match find_by_stem(root, &image_path) {
                    Some(path) => Some(resize_gray(&load_gray(&path)?, size, size)),
                    None => {
                        warn!(image = %image_path.display(), "no depth for training image, skipping");
                        continue;
                    }
                },
                None => None,
            };
            items.push(TrainItem {
                image: resize_rgb(&load_rgb(&image_path)?, size, size),
                gt: resize_gray(&load_gray(&gt_path)?, size, size),
                depth,
            });
        }
        if items.is_empty() {
            return Err(Error::EmptyDataset(image_root.to_path_buf()));
        }
        Ok(Self { items })
    }
}

impl Dataset<TrainItem> for SaliencyDataset {
    fn get(&self, index: usize) -> Option<TrainItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A training batch at the base training size.
#[derive(Clone, Debug)]
pub struct TrainBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub gts: Tensor<B, 4>,
    pub depth: Option<Tensor<B, 4>>,
}

impl<B: Backend> TrainBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

#[derive(Clone, Debug, Default)]
pub struct SaliencyBatcher;

impl<B: Backend> Batcher<B, TrainItem, TrainBatch<B>> for SaliencyBatcher {
    fn batch(&self, items: Vec<TrainItem>, device: &B::Device) -> TrainBatch<B> {
        let batch_size = items.len();
        let (width, height) = items
            .first()
            .map(|item| item.image.dimensions())
            .unwrap_or((0, 0));
        let (height, width) = (height as usize, width as usize);
        let with_depth = items.iter().all(|item| item.depth.is_some()) && batch_size > 0;

        let mut images = Vec::with_capacity(batch_size * 3 * height * width);
        let mut gts = Vec::with_capacity(batch_size * height * width);
        let mut depth = Vec::new();
        for item in &items {
            images.extend(rgb_to_normalized_chw(&item.image));
            gts.extend(gray_to_unit(&item.gt));
            if let (true, Some(map)) = (with_depth, &item.depth) {
                depth.extend(gray_to_unit(map));
            }
        }

        TrainBatch {
            images: Tensor::from_data(
                TensorData::new(images, [batch_size, 3, height, width]),
                device,
            ),
            gts: Tensor::from_data(TensorData::new(gts, [batch_size, 1, height, width]), device),
            depth: with_depth.then(|| {
                Tensor::from_data(TensorData::new(depth, [batch_size, 1, height, width]), device)
            }),
        }
    }
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::io(dir, missing_dir()));
    }
    let root = glob::Pattern::escape(&dir.to_string_lossy());
    let mut files = Vec::new();
    for ext in IMAGE_EXTENSIONS {
        for entry in glob::glob(&format!("{root}/*.{ext}"))? {
            let path = entry.map_err(|err| Error::io(err.path().to_path_buf(), err.into_error()))?;
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// File in `dir` sharing the stem of `reference`, trying each known extension.
fn find_by_stem(dir: &Path, reference: &Path) -> Option<PathBuf> {
    let stem = file_stem(reference);
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn missing_dir() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist")
}

fn missing_file() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "no file with a matching name")
}

pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .map_err(|err| Error::image(path, err))?
        .to_rgb8())
}

pub fn load_gray(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)
        .map_err(|err| Error::image(path, err))?
        .to_luma8())
}

fn resize_rgb(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    image::imageops::resize(img, width, height, FilterType::Triangle)
}

fn resize_gray(img: &GrayImage, width: u32, height: u32) -> GrayImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    image::imageops::resize(img, width, height, FilterType::Triangle)
}

/// Convert RGB image data to CHW floats with ImageNet normalization.
pub fn rgb_to_normalized_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for (idx, pixel) in img.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel.0[channel] as f32 / 255.0;
            out[channel * hw + idx] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    out
}

/// Grayscale pixels scaled to `[0, 1]`, row-major.
pub fn gray_to_unit(img: &GrayImage) -> Vec<f32> {
    img.pixels().map(|pixel| pixel.0[0] as f32 / 255.0).collect()
}
