//! Side-by-side training snapshots: reconstructed input with the predicted
//! and ground-truth lanes highlighted, the instance embedding, and the
//! instance label, stacked vertically per sample.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use burn::prelude::*;
use image::{imageops, Rgb, RgbImage};

const EMBEDDING_EPSILON: f32 = 1e-5;

/// Host copy of the tensors needed to draw a batch.
#[derive(Clone, Debug)]
pub struct BatchSnapshot {
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub embedding_dim: usize,
    /// `[N, 3, H, W]`, BGR, mean subtracted.
    pub images: Vec<f32>,
    /// `[N, H, W]`
    pub prediction: Vec<i64>,
    /// `[N, H, W]`
    pub binary_labels: Vec<i64>,
    /// `[N, E, H, W]`
    pub embedding: Vec<f32>,
    /// `[N, H, W]`
    pub instance_labels: Vec<f32>,
}

impl BatchSnapshot {
    pub fn capture<B: Backend>(
        images: Tensor<B, 4>,
        prediction: Tensor<B, 3, Int>,
        binary_labels: Tensor<B, 3, Int>,
        embedding: Tensor<B, 4>,
        instance_labels: Tensor<B, 3>,
    ) -> Result<Self> {
        let [batch_size, _, height, width] = images.dims();
        let embedding_dim = embedding.dims()[1];

        Ok(Self {
            batch_size,
            height,
            width,
            embedding_dim,
            images: floats(images)?,
            prediction: ints(prediction)?,
            binary_labels: ints(binary_labels)?,
            embedding: floats(embedding)?,
            instance_labels: floats(instance_labels)?,
        })
    }

    /// Draws sample `index` as a `W x 3H` frame; `index` must be below
    /// `batch_size`.
    fn compose(&self, index: usize, mean: [f32; 3]) -> RgbImage {
        let (h, w) = (self.height, self.width);
        let plane = h * w;
        let e = self.embedding_dim;

        let image = &self.images[index * 3 * plane..(index + 1) * 3 * plane];
        let prediction = &self.prediction[index * plane..(index + 1) * plane];
        let label = &self.binary_labels[index * plane..(index + 1) * plane];
        let embedding = &self.embedding[index * e * plane..(index + 1) * e * plane];
        let instance = &self.instance_labels[index * plane..(index + 1) * plane];

        let mut frame = RgbImage::new(w as u32, 3 * h as u32);
        for y in 0..h {
            for x in 0..w {
                let p = y * w + x;

                let mut bgr = [0u8; 3];
                for (c, value) in bgr.iter_mut().enumerate() {
                    *value = (image[c * plane + p] + mean[c]) as u8;
                }
                if prediction[p] == 1 {
                    bgr[0] = 255;
                }
                if label[p] == 1 {
                    bgr[1] = 255;
                }

                let sum = (0..e).map(|c| embedding[c * plane + p]).sum::<f32>() + EMBEDDING_EPSILON;
                let mut emb = [0u8; 3];
                for (c, value) in emb.iter_mut().enumerate().take(e) {
                    *value = (embedding[c * plane + p] / sum * 255.0).round() as u8;
                }

                let id = instance[p] as u8;

                let (x, y) = (x as u32, y as u32);
                frame.put_pixel(x, y, to_rgb(bgr));
                frame.put_pixel(x, y + h as u32, to_rgb(emb));
                frame.put_pixel(x, y + 2 * h as u32, Rgb([id, id, id]));
            }
        }

        frame
    }

    /// Draws the first `count` samples (at most the batch size) side by side.
    pub fn compose_strip(&self, count: usize, mean: [f32; 3]) -> RgbImage {
        let frames = (0..count.min(self.batch_size))
            .map(|i| self.compose(i, mean))
            .collect::<Vec<_>>();
        concat_horizontal(&frames)
    }
}

fn to_rgb(bgr: [u8; 3]) -> Rgb<u8> {
    Rgb([bgr[2], bgr[1], bgr[0]])
}

pub fn concat_horizontal(frames: &[RgbImage]) -> RgbImage {
    let width = frames.iter().map(|f| f.width()).sum();
    let height = frames.iter().map(|f| f.height()).max().unwrap_or(0);

    let mut canvas = RgbImage::new(width, height);
    let mut x = 0i64;
    for frame in frames {
        imageops::replace(&mut canvas, frame, x, 0);
        x += i64::from(frame.width());
    }
    canvas
}

/// `train_<epoch>_step_<step>.png`, with a 1-based epoch.
pub fn snapshot_file_name(epoch: usize, step: usize) -> String {
    format!("train_{epoch}_step_{step}.png")
}

pub fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn floats<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow!("failed to read tensor: {err:?}"))
}

fn ints<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to read tensor: {err:?}"))
}
