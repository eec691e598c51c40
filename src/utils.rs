use crate::error::{Error, Result};
use burn::prelude::*;
use image::{GenericImage, GrayImage, Luma};
use std::path::{Path, PathBuf};

/// Convert a `[batch, height, width]` tensor in `[0, 255]` to grayscale images.
pub fn tensor_to_maps<B: Backend>(tensor: Tensor<B, 3>) -> Result<Vec<GrayImage>> {
    let [batch, height, width] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{err:?}")))?;
    let hw = height * width;

    (0..batch)
        .map(|b| map_to_luma(&values[b * hw..(b + 1) * hw], height, width))
        .collect()
}

/// Convert a `[batch, 1, height, width]` probability tensor to grayscale images.
pub fn probabilities_to_maps<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<GrayImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 1 {
        return Err(Error::TensorData(format!(
            "expected a single-channel map, got {channels} channels"
        )));
    }
    tensor_to_maps(
        tensor
            .clamp(0.0, 1.0)
            .mul_scalar(255.0)
            .reshape([batch, height, width]),
    )
}

/// Row-major values in `[0, 255]` to an 8-bit image, rounding and clamping.
pub fn map_to_luma(values: &[f32], height: usize, width: usize) -> Result<GrayImage> {
    if values.len() != height * width {
        return Err(Error::TensorData(format!(
            "{} values do not fill a {height}x{width} map",
            values.len()
        )));
    }
    let pixels = values
        .iter()
        .map(|value| value.round().clamp(0.0, 255.0) as u8)
        .collect();
    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::TensorData(format!("invalid map size {height}x{width}")))
}

/// Write a single 8-bit grayscale PNG, creating parent directories.
pub fn save_map(map: &GrayImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    map.save(path).map_err(|err| Error::image(path, err))
}

/// Concatenate images horizontally.
pub fn concat_images_horiz(images: &[GrayImage]) -> Result<GrayImage> {
    if images.is_empty() {
        return Err(Error::TensorData("no images to concatenate".into()));
    }
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0);
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = GrayImage::from_pixel(total_width, height, Luma([0]));

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)
            .map_err(|err| Error::TensorData(format!("failed to concatenate image: {err}")))?;
        offset_x += img.width();
    }

    Ok(out)
}

/// Receives intermediate maps during training.
pub trait VisualizationSink<B: Backend> {
    /// `maps` are `[batch, 1, height, width]` tensors in `[0, 1]`.
    fn visualize(&self, tag: &str, maps: &[Tensor<B, 4>]) -> Result<()>;
}

/// Writes the first sample of each map side by side into `<dir>/<tag>.png`.
#[derive(Clone, Debug)]
pub struct PngStripSink {
    dir: PathBuf,
}

impl PngStripSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.png"))
    }
}

impl<B: Backend> VisualizationSink<B> for PngStripSink {
    fn visualize(&self, tag: &str, maps: &[Tensor<B, 4>]) -> Result<()> {
        let mut strip = Vec::with_capacity(maps.len());
        for map in maps {
            let [_, channels, height, width] = map.dims();
            let first = map.clone().slice([0..1, 0..channels, 0..height, 0..width]);
            strip.extend(probabilities_to_maps(first)?.into_iter().take(1));
        }
        save_map(&concat_images_horiz(&strip)?, &self.path_for(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn luma_rounds_and_clamps() {
        let map = map_to_luma(&[-3.0, 0.4, 127.6, 300.0], 2, 2).unwrap();
        assert_eq!(map.as_raw(), &vec![0, 0, 128, 255]);
    }

    #[test]
    fn luma_rejects_wrong_length() {
        assert!(map_to_luma(&[0.0; 3], 2, 2).is_err());
    }

    #[test]
    fn batch_tensor_splits_into_maps() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 3>::full([2, 3, 5], 255.0, &device);
        let maps = tensor_to_maps(tensor).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1].dimensions(), (5, 3));
        assert!(maps[1].pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn strip_sink_writes_side_by_side_png() {
        let device = Default::default();
        let tmp = tempfile::tempdir().unwrap();
        let sink = PngStripSink::new(tmp.path().join("vis"));
        let pred = Tensor::<TestBackend, 4>::ones([2, 1, 4, 6], &device);
        let gt = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 6], &device);
        VisualizationSink::<TestBackend>::visualize(&sink, "epoch_1_step_10", &[pred, gt])
            .unwrap();

        let written = image::open(sink.path_for("epoch_1_step_10")).unwrap().to_luma8();
        assert_eq!(written.dimensions(), (12, 4));
        assert_eq!(written.get_pixel(0, 0).0[0], 255);
        assert_eq!(written.get_pixel(11, 3).0[0], 0);
    }
}
