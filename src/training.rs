use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};

use crate::{
    average::AverageMeter,
    data::{LaneBatch, LaneBatcher, Normalizer, VGG_MEAN},
    dataset::{LaneDataset, LaneItem},
    loss::LossConfig,
    model::{LaneNet, LaneNetConfig},
    visualize::{save_png, snapshot_file_name, BatchSnapshot},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: LaneNetConfig,
    pub loss: LossConfig,
    pub optimizer: AdamConfig,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 0.0005)]
    pub learning_rate: f64,
    #[config(default = 512)]
    pub image_width: u32,
    #[config(default = 256)]
    pub image_height: u32,
    /// BGR mean subtracted from inputs and added back in snapshots.
    #[config(default = "VGG_MEAN")]
    pub channel_mean: [f32; 3],
    /// Steps between progress lines and snapshot images.
    #[config(default = 500)]
    pub log_interval: usize,
    /// Samples drawn side by side in each snapshot.
    #[config(default = 3)]
    pub visualize_samples: usize,
    #[config(default = 5)]
    pub checkpoint_interval: usize,
}

impl TrainingConfig {
    /// Rejects settings the model or the loader cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.image_width == 0
            || self.image_height == 0
            || self.image_width % 4 != 0
            || self.image_height % 4 != 0
        {
            bail!(
                "image size {}x{} is not a positive multiple of 4",
                self.image_width,
                self.image_height
            );
        }
        Ok(())
    }

    /// Batcher subtracting [`TrainingConfig::channel_mean`].
    pub fn batcher<B: Backend>(&self, device: B::Device) -> LaneBatcher<B> {
        let normalizer = Normalizer::with_mean(self.channel_mean, &device);
        LaneBatcher::with_normalizer(normalizer, device)
    }
}

/// Running averages at the end of an epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: usize,
    /// Progress lines printed (and snapshots written) during the epoch.
    pub reports: usize,
    pub total_loss: f64,
    pub binary_loss: f64,
    pub instance_loss: f64,
    pub mean_iou: f64,
}

/// Number of steps of an epoch; the trailing partial batch is kept.
pub fn steps_per_epoch(num_items: usize, batch_size: usize) -> usize {
    num_items.div_ceil(batch_size.max(1))
}

/// Whether the 1-based `step` prints progress and writes a snapshot.
pub fn is_report_step(step: usize, interval: usize) -> bool {
    interval > 0 && step % interval == 0
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Runs one pass over `loader`, updating `model` after every batch.
///
/// `epoch` is 0-based; it is reported 1-based in progress lines and
/// snapshot names.
pub fn train_epoch<B, O>(
    mut model: LaneNet<B>,
    optimizer: &mut O,
    loader: &dyn DataLoader<LaneBatch<B>>,
    config: &TrainingConfig,
    epoch: usize,
    output_dir: &Path,
) -> Result<(LaneNet<B>, EpochSummary)>
where
    B: AutodiffBackend,
    O: Optimizer<LaneNet<B>, B>,
{
    let mut batch_time = AverageMeter::new();
    let mut mean_iou = AverageMeter::new();
    let mut total_losses = AverageMeter::new();
    let mut binary_losses = AverageMeter::new();
    let mut instance_losses = AverageMeter::new();

    let num_batches = steps_per_epoch(loader.num_items(), config.batch_size);
    let mut step = 0;
    let mut samples = 0;
    let mut reports = 0;
    let mut end = Instant::now();

    for (batch_idx, batch) in loader.iter().enumerate() {
        step += 1;
        let batch_size = batch.batch_size();
        samples += batch_size;

        let output = model.forward(batch.images.clone());
        let loss = config.loss.compute(
            &output,
            batch.binary_labels.clone(),
            batch.instance_labels.clone(),
        )?;

        total_losses.update_weighted(scalar(loss.total.clone()), batch_size);
        binary_losses.update_weighted(scalar(loss.binary.clone()), batch_size);
        instance_losses.update_weighted(scalar(loss.instance.clone()), batch_size);
        mean_iou.update_weighted(loss.iou, batch_size);

        let grads = loss.total.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(config.learning_rate, model, grads);

        batch_time.update(end.elapsed().as_secs_f64());
        end = Instant::now();

        if is_report_step(step, config.log_interval) {
            println!(
                "Epoch {} Step {} |({}/{})| ETA: {:.2}|Total:{:.5}|Binary:{:.5}|Instance:{:.5}|IoU:{:.5}",
                epoch + 1,
                step,
                batch_idx + 1,
                num_batches,
                batch_time.val,
                total_losses.avg,
                binary_losses.avg,
                instance_losses.avg,
                loss.iou,
            );
            std::io::stdout().flush()?;

            let snapshot = BatchSnapshot::capture(
                batch.images,
                loss.prediction,
                batch.binary_labels,
                output.instance_embedding,
                batch.instance_labels,
            )?;
            let path = output_dir.join(snapshot_file_name(epoch + 1, step));
            save_png(
                &snapshot.compose_strip(config.visualize_samples, config.channel_mean),
                &path,
            )?;
            log::debug!("wrote snapshot {}", path.display());
            reports += 1;
        }
    }

    // The loader stops at the first sample that fails to load.
    if samples < loader.num_items() {
        bail!(
            "epoch {} ended after {} of {} samples; a sample failed to load",
            epoch + 1,
            samples,
            loader.num_items()
        );
    }

    Ok((
        model,
        EpochSummary {
            epoch,
            steps: step,
            reports,
            total_loss: total_losses.avg,
            binary_loss: binary_losses.avg,
            instance_loss: instance_losses.avg,
            mean_iou: mean_iou.avg,
        },
    ))
}

/// Trains on `dataset` for `config.num_epochs` epochs, writing snapshots to
/// `output_dir`.
pub fn fit<B, D>(
    dataset: D,
    output_dir: &Path,
    config: &TrainingConfig,
    device: B::Device,
) -> Result<(LaneNet<B>, Vec<EpochSummary>)>
where
    B: AutodiffBackend,
    D: Dataset<LaneItem> + 'static,
{
    config.validate()?;
    B::seed(config.seed);

    let num_samples = dataset.len();
    // Single-threaded: worker partitions would each flush a partial batch.
    let dataloader_train = DataLoaderBuilder::new(config.batcher::<B>(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .build(dataset);

    let mut model = config.model.init::<B>(&device);
    let mut optimizer = config.optimizer.init::<B, LaneNet<B>>();

    println!("{} epochs {} training samples\n", config.num_epochs, num_samples);

    let mut summaries = Vec::with_capacity(config.num_epochs);
    for epoch in 0..config.num_epochs {
        println!("Epoch {epoch}");
        let (trained, summary) = train_epoch(
            model,
            &mut optimizer,
            dataloader_train.as_ref(),
            config,
            epoch,
            output_dir,
        )?;
        model = trained;

        if config.checkpoint_interval > 0 && (epoch + 1) % config.checkpoint_interval == 0 {
            log::info!(
                "epoch {} reached the checkpoint interval; checkpoints are not saved",
                epoch + 1
            );
        }
        println!("Best IoU : {}", summary.mean_iou);
        summaries.push(summary);
    }

    Ok((model, summaries))
}

/// Entry point used by the binary: reads `<dataset_dir>/train.txt` and trains.
pub fn train<B: AutodiffBackend>(
    dataset_dir: &Path,
    output_dir: &Path,
    config: &TrainingConfig,
    device: B::Device,
) -> Result<Vec<EpochSummary>> {
    config.validate()?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

    let config_path = output_dir.join("config.json");
    config
        .save(&config_path)
        .with_context(|| format!("failed to save {}", config_path.display()))?;
    log::info!("saved training config to {}", config_path.display());

    let dataset = LaneDataset::train(dataset_dir, config.image_width, config.image_height)?;
    dataset.validate()?;

    let now = Instant::now();
    let (_, summaries) = fit::<B, _>(dataset, output_dir, config, device)?;
    let elapsed = now.elapsed().as_secs();
    log::info!("training completed in {}m{}s", elapsed / 60, elapsed % 60);

    Ok(summaries)
}
