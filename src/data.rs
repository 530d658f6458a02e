use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::dataset::LaneItem;

/// Per-channel mean of the ImageNet VGG weights, in BGR order and 0-255 scale.
pub const VGG_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

/// Subtracts a fixed per-channel mean from BGR images.
#[derive(Clone)]
pub struct Normalizer<B: Backend> {
    pub mean: Tensor<B, 4>,
}

impl<B: Backend> Normalizer<B> {
    /// Creates a normalizer using [`VGG_MEAN`].
    pub fn new(device: &Device<B>) -> Self {
        Self::with_mean(VGG_MEAN, device)
    }

    pub fn with_mean(mean: [f32; 3], device: &Device<B>) -> Self {
        let mean = Tensor::<B, 1>::from_floats(mean, device).reshape([1, 3, 1, 1]);
        Self { mean }
    }

    /// Input is in the 0-255 range; the output is centred on the channel mean.
    pub fn normalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        input - self.mean.clone()
    }
}

#[derive(Clone)]
pub struct LaneBatcher<B: Backend> {
    normalizer: Normalizer<B>,
    device: B::Device,
}

#[derive(Clone, Debug)]
pub struct LaneBatch<B: Backend> {
    /// `[N, 3, H, W]`, BGR, mean subtracted.
    pub images: Tensor<B, 4>,
    /// `[N, H, W]`, 1 for lane pixels.
    pub binary_labels: Tensor<B, 3, Int>,
    /// `[N, H, W]`, instance id per pixel, 0 for background.
    pub instance_labels: Tensor<B, 3>,
}

impl<B: Backend> LaneBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

impl<B: Backend> LaneBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            normalizer: Normalizer::<B>::new(&device),
            device,
        }
    }

    pub fn with_normalizer(normalizer: Normalizer<B>, device: B::Device) -> Self {
        Self { normalizer, device }
    }
}

impl<B: Backend> Batcher<LaneItem, LaneBatch<B>> for LaneBatcher<B> {
    fn batch(&self, items: Vec<LaneItem>) -> LaneBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut binary_labels = Vec::with_capacity(items.len());
        let mut instance_labels = Vec::with_capacity(items.len());

        for item in items {
            let (h, w) = (item.height, item.width);

            let image = TensorData::new(item.image, Shape::new([h, w, 3]));
            images.push(
                Tensor::<B, 3>::from_data(image.convert::<B::FloatElem>(), &self.device)
                    .permute([2, 0, 1]), // [C, H, W]
            );

            let binary = item.binary.into_iter().map(i64::from).collect::<Vec<_>>();
            binary_labels.push(Tensor::<B, 2, Int>::from_data(
                TensorData::new(binary, Shape::new([h, w])).convert::<B::IntElem>(),
                &self.device,
            ));

            let instance = TensorData::new(item.instance, Shape::new([h, w]));
            instance_labels.push(Tensor::<B, 2>::from_data(
                instance.convert::<B::FloatElem>(),
                &self.device,
            ));
        }

        let images = self.normalizer.normalize(Tensor::stack(images, 0));

        LaneBatch {
            images,
            binary_labels: Tensor::stack(binary_labels, 0),
            instance_labels: Tensor::stack(instance_labels, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn item(width: usize, height: usize, fill: u8) -> LaneItem {
        let pixels = width * height;
        let mut binary = vec![0; pixels];
        binary[0] = 1;
        let mut instance = vec![0; pixels];
        instance[0] = 20;
        LaneItem::new(width, height, vec![fill; pixels * 3], binary, instance)
    }

    #[test]
    fn batch_stacks_items_in_chw_layout() {
        let device = Default::default();
        let batcher = LaneBatcher::<TestBackend>::new(device);

        let batch = batcher.batch(vec![item(4, 2, 200), item(4, 2, 100)]);

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.images.dims(), [2, 3, 2, 4]);
        assert_eq!(batch.binary_labels.dims(), [2, 2, 4]);
        assert_eq!(batch.instance_labels.dims(), [2, 2, 4]);
    }

    #[test]
    fn batch_subtracts_channel_mean() {
        let device = Default::default();
        let batcher = LaneBatcher::<TestBackend>::new(device);

        let mut sample = item(2, 1, 0);
        // pixel 0 = (b, g, r) = (110, 120, 130)
        sample.image[0..3].copy_from_slice(&[110, 120, 130]);
        let batch = batcher.batch(vec![sample]);

        let values = batch
            .images
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        // layout [1, 3, 1, 2]: channel c, pixel 0 is at c * 2.
        assert!((values[0] - (110.0 - VGG_MEAN[0])).abs() < 1e-3);
        assert!((values[2] - (120.0 - VGG_MEAN[1])).abs() < 1e-3);
        assert!((values[4] - (130.0 - VGG_MEAN[2])).abs() < 1e-3);
        assert!((values[1] + VGG_MEAN[0]).abs() < 1e-3);
    }

    #[test]
    fn labels_keep_their_values() {
        let device = Default::default();
        let batcher = LaneBatcher::<TestBackend>::new(device);

        let batch = batcher.batch(vec![item(3, 1, 0)]);
        let binary = batch
            .binary_labels
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap();
        let instance = batch
            .instance_labels
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(binary, vec![1, 0, 0]);
        assert_eq!(instance, vec![20.0, 0.0, 0.0]);
    }
}
