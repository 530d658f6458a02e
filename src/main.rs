use std::path::PathBuf;

use anyhow::Result;
use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};
use burn::optim::AdamConfig;
use clap::{Parser, ValueEnum};
use lanenet_train::loss::LossConfig;
use lanenet_train::model::LaneNetConfig;
use lanenet_train::training::{train, TrainingConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    /// GPU through wgpu
    Wgpu,
    /// CPU through ndarray
    Ndarray,
}

#[derive(Debug, Parser)]
#[command(version, about = "Train LaneNet on a lane-detection dataset")]
struct Args {
    /// dataset directory containing train.txt
    #[arg(long)]
    dataset: PathBuf,
    /// directory for snapshots and config.json
    #[arg(long, default_value = "./output")]
    save: PathBuf,
    /// # of epochs
    #[arg(long, default_value_t = 100)]
    epochs: usize,
    /// mini batch size
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// learning rate for Adam
    #[arg(long, default_value_t = 0.0005)]
    lr: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// input width after rescaling
    #[arg(long, default_value_t = 512)]
    width: u32,
    /// input height after rescaling
    #[arg(long, default_value_t = 256)]
    height: u32,
    /// steps between progress lines and snapshots
    #[arg(long, default_value_t = 500)]
    log_interval: usize,
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        TrainingConfig::new(LaneNetConfig::new(), LossConfig::new(), AdamConfig::new())
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.lr)
            .with_seed(self.seed)
            .with_image_width(self.width)
            .with_image_height(self.height)
            .with_log_interval(self.log_interval)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.training_config();
    log::info!("training on {:?} backend", args.backend);

    match args.backend {
        BackendKind::Wgpu => {
            train::<Autodiff<Wgpu>>(&args.dataset, &args.save, &config, WgpuDevice::default())?;
        }
        BackendKind::Ndarray => {
            train::<Autodiff<NdArray>>(
                &args.dataset,
                &args.save,
                &config,
                NdArrayDevice::default(),
            )?;
        }
    }

    Ok(())
}
