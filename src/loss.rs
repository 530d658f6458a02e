use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use burn::{nn::loss::CrossEntropyLossConfig, prelude::*};

use crate::model::LaneNetOutput;

const NORM_EPSILON: f64 = 1e-8;

/// Weights and margins of the composite LaneNet loss.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 10.0)]
    pub binary_weight: f64,
    #[config(default = 0.3)]
    pub variance_weight: f64,
    #[config(default = 1.0)]
    pub distance_weight: f64,
    /// Pixels closer than this to their instance mean are not pulled further.
    #[config(default = 0.5)]
    pub delta_var: f64,
    /// Instance means further apart than twice this are not pushed further.
    #[config(default = 1.5)]
    pub delta_dist: f64,
}

/// Output of [`LossConfig::compute`].
#[derive(Clone, Debug)]
pub struct LaneLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub binary: Tensor<B, 1>,
    pub instance: Tensor<B, 1>,
    /// `[N, H, W]` argmax of the binary logits.
    pub prediction: Tensor<B, 3, Int>,
    /// Mean per-sample IoU of `prediction` against the binary label.
    pub iou: f64,
}

/// Unweighted terms of the discriminative loss, averaged over the batch.
#[derive(Clone, Debug)]
pub struct DiscriminativeTerms<B: Backend> {
    pub variance: Tensor<B, 1>,
    pub distance: Tensor<B, 1>,
}

impl LossConfig {
    pub fn compute<B: Backend>(
        &self,
        output: &LaneNetOutput<B>,
        binary_labels: Tensor<B, 3, Int>,
        instance_labels: Tensor<B, 3>,
    ) -> Result<LaneLoss<B>> {
        let [n, classes, h, w] = output.binary_logits.dims();
        let device = output.binary_logits.device();

        let logits = output
            .binary_logits
            .clone()
            .permute([0, 2, 3, 1])
            .reshape([n * h * w, classes]);
        let targets = binary_labels.clone().reshape([n * h * w]);
        let binary = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, targets)
            .mul_scalar(self.binary_weight);

        let terms = self.discriminative(output.instance_embedding.clone(), instance_labels)?;
        let instance = terms.variance.mul_scalar(self.variance_weight);
        let distance = terms.distance.mul_scalar(self.distance_weight);
        let total = binary.clone() + instance.clone() + distance;

        let prediction = output.binary_logits.clone().argmax(1).squeeze::<3>(1);
        let iou = batch_iou(
            &int_values(prediction.clone())?,
            &int_values(binary_labels)?,
            n,
        );

        Ok(LaneLoss {
            total,
            binary,
            instance,
            prediction,
            iou,
        })
    }

    /// Discriminative loss of De Brabandere et al. over `[N, E, H, W]`
    /// embeddings, with instance id 0 treated as background.
    pub fn discriminative<B: Backend>(
        &self,
        embedding: Tensor<B, 4>,
        instance_labels: Tensor<B, 3>,
    ) -> Result<DiscriminativeTerms<B>> {
        let [n, e, h, w] = embedding.dims();
        let device = embedding.device();
        let labels = instance_labels
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("failed to read instance labels: {err:?}"))?;

        let mut variance = Tensor::<B, 1>::zeros([1], &device);
        let mut distance = Tensor::<B, 1>::zeros([1], &device);

        for i in 0..n {
            let instances = instance_pixel_counts(&labels[i * h * w..(i + 1) * h * w]);
            if instances.is_empty() {
                continue;
            }

            let emb = embedding.clone().slice([i..i + 1]).reshape([e, h, w]);
            let label = instance_labels.clone().slice([i..i + 1]); // [1, H, W]

            let mut means = Vec::with_capacity(instances.len());
            let mut pulls = Vec::with_capacity(instances.len());
            for (&id, &count) in &instances {
                let mask = label.clone().equal_elem(id as f32).float();
                let count = count as f64;

                let mean = (emb.clone() * mask.clone())
                    .sum_dim(2)
                    .sum_dim(1)
                    .div_scalar(count); // [E, 1, 1]
                let dist = (emb.clone() - mean.clone())
                    .powf_scalar(2.0)
                    .sum_dim(0)
                    .add_scalar(NORM_EPSILON)
                    .sqrt(); // [1, H, W]
                let pull = (dist.sub_scalar(self.delta_var).clamp_min(0.0).powf_scalar(2.0)
                    * mask)
                    .sum()
                    .div_scalar(count);

                means.push(mean.reshape([1, e]));
                pulls.push(pull);
            }

            let k = means.len();
            variance = variance + Tensor::cat(pulls, 0).mean();

            if k > 1 {
                let means = Tensor::cat(means, 0); // [K, E]
                let diff = means.clone().unsqueeze_dim::<3>(1) - means.unsqueeze_dim::<3>(0);
                let pair_dist = diff
                    .powf_scalar(2.0)
                    .sum_dim(2)
                    .add_scalar(NORM_EPSILON)
                    .sqrt()
                    .reshape([k, k]);
                let push = pair_dist
                    .neg()
                    .add_scalar(2.0 * self.delta_dist)
                    .clamp_min(0.0)
                    .powf_scalar(2.0);
                let off_diagonal = off_diagonal_mask::<B>(k, &device);
                distance = distance
                    + (push * off_diagonal)
                        .sum()
                        .div_scalar((k * (k - 1)) as f64);
            }
        }

        Ok(DiscriminativeTerms {
            variance: variance.div_scalar(n as f64),
            distance: distance.div_scalar(n as f64),
        })
    }
}

/// Pixel count per non-zero instance id, ordered by id.
fn instance_pixel_counts(labels: &[f32]) -> BTreeMap<u32, usize> {
    let mut counts = BTreeMap::new();
    for &label in labels {
        let id = label.round() as u32;
        if id != 0 {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts
}

fn off_diagonal_mask<B: Backend>(k: usize, device: &Device<B>) -> Tensor<B, 2> {
    let values = (0..k * k)
        .map(|idx| if idx / k == idx % k { 0.0f32 } else { 1.0 })
        .collect::<Vec<_>>();
    Tensor::from_data(
        TensorData::new(values, [k, k]).convert::<B::FloatElem>(),
        device,
    )
}

fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to read mask: {err:?}"))
}

/// Mean over `batch_size` samples of `TP / (PR + GT - TP)`, where `PR` and
/// `GT` count the non-zero pixels of each mask. A sample whose masks are both
/// empty scores 1.
pub fn batch_iou(prediction: &[i64], label: &[i64], batch_size: usize) -> f64 {
    if batch_size == 0 {
        return 0.0;
    }
    let pixels = prediction.len() / batch_size;

    let total: f64 = prediction
        .chunks(pixels.max(1))
        .zip(label.chunks(pixels.max(1)))
        .map(|(pred, gt)| {
            let mut pr = 0usize;
            let mut tp = 0usize;
            let mut gt_count = 0usize;
            for (&p, &g) in pred.iter().zip(gt) {
                pr += usize::from(p != 0);
                gt_count += usize::from(g != 0);
                tp += usize::from(p != 0 && g != 0);
            }
            let union = pr + gt_count - tp;
            if union == 0 {
                1.0
            } else {
                tp as f64 / union as f64
            }
        })
        .sum();

    total / batch_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    fn tensor4(values: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn tensor3(values: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn iou_counts_overlap_per_sample() {
        // sample 0: pred {0,1}, gt {1,2} -> 1/3; sample 1: identical -> 1
        let pred = [1, 1, 0, 0, 1, 0];
        let gt = [0, 1, 1, 0, 1, 0];
        let iou = batch_iou(&pred, &gt, 2);
        assert!((iou - (1.0 / 3.0 + 1.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn iou_of_empty_masks_is_perfect() {
        assert_eq!(batch_iou(&[0, 0, 0, 0], &[0, 0, 0, 0], 2), 1.0);
        assert_eq!(batch_iou(&[1, 0], &[0, 0], 1), 0.0);
    }

    #[test]
    fn variance_term_penalizes_spread_beyond_margin() {
        // E = 1, one instance with embeddings 0 and 2: mean 1, distance 1 each.
        let embedding = tensor4(vec![0.0, 2.0, 5.0], [1, 1, 1, 3]);
        let labels = tensor3(vec![1.0, 1.0, 0.0], [1, 1, 3]);

        let terms = LossConfig::new()
            .discriminative(embedding, labels)
            .unwrap();

        assert!((scalar(terms.variance) - 0.25).abs() < 1e-4);
        assert!(scalar(terms.distance).abs() < 1e-6);
    }

    #[test]
    fn distance_term_pushes_close_instances_apart() {
        // Two instances whose means coincide: hinge is (2 * 1.5)^2 = 9.
        let embedding = tensor4(vec![1.0, 1.0], [1, 1, 1, 2]);
        let labels = tensor3(vec![1.0, 2.0], [1, 1, 2]);

        let terms = LossConfig::new()
            .discriminative(embedding, labels)
            .unwrap();

        assert!(scalar(terms.variance).abs() < 1e-6);
        assert!((scalar(terms.distance) - 9.0).abs() < 1e-3);
    }

    #[test]
    fn separated_instances_cost_nothing() {
        let embedding = tensor4(vec![0.0, 10.0], [1, 1, 1, 2]);
        let labels = tensor3(vec![3.0, 7.0], [1, 1, 2]);

        let terms = LossConfig::new()
            .discriminative(embedding, labels)
            .unwrap();

        assert!(scalar(terms.variance).abs() < 1e-6);
        assert!(scalar(terms.distance).abs() < 1e-6);
    }

    #[test]
    fn samples_without_instances_dilute_the_batch_mean() {
        let embedding = tensor4(vec![0.0, 2.0, 0.0, 0.0], [2, 1, 1, 2]);
        let labels = tensor3(vec![1.0, 1.0, 0.0, 0.0], [2, 1, 2]);

        let terms = LossConfig::new()
            .discriminative(embedding, labels)
            .unwrap();

        assert!((scalar(terms.variance) - 0.125).abs() < 1e-4);
    }

    #[test]
    fn compute_combines_weighted_terms() {
        let device = Default::default();
        // Logits favour class 1 on pixel 0 and class 0 on pixel 1.
        let binary_logits = tensor4(vec![0.0, 4.0, 4.0, 0.0], [1, 2, 1, 2]);
        let instance_embedding = tensor4(vec![1.0, 1.0], [1, 1, 1, 2]);
        let output = LaneNetOutput {
            binary_logits,
            instance_embedding,
        };
        let binary_labels = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![1i64, 1], [1, 1, 2]).convert::<i64>(),
            &device,
        );
        let instance_labels = tensor3(vec![1.0, 2.0], [1, 1, 2]);

        let config = LossConfig::new();
        let loss = config
            .compute(&output, binary_labels, instance_labels)
            .unwrap();

        let binary = scalar(loss.binary.clone());
        let instance = scalar(loss.instance.clone());
        let total = scalar(loss.total.clone());
        assert!(binary > 0.0);
        assert!(instance.abs() < 1e-6);
        assert!((total - (binary + instance + 9.0)).abs() < 1e-3);
        assert!((loss.iou - 0.5).abs() < 1e-12);

        let prediction = int_values(loss.prediction).unwrap();
        assert_eq!(prediction, vec![1, 0]);
    }
}
