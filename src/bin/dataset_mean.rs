use anyhow::{bail, Context, Result};
use clap::Parser;
use lanenet_train::data::VGG_MEAN;
use lanenet_train::dataset::read_manifest;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-channel statistics in BGR order on the 0-255 scale.
#[derive(Serialize, Deserialize)]
struct NormalizationStats {
    samples: usize,
    mean: Vec<f64>,
    std: Vec<f64>,
}

#[derive(Debug, Parser)]
#[command(about = "Compute BGR channel statistics of the images in a manifest")]
struct Args {
    /// manifest listing `image binary_label instance_label` per line
    #[arg(long)]
    manifest: PathBuf,
}

/// Per-image channel sums, sums of squares and pixel count.
fn channel_sums(path: &Path) -> Result<([f64; 3], [f64; 3], u64)> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();

    let mut sums = [0.0; 3];
    let mut squares = [0.0; 3];
    for pixel in img.pixels() {
        // BGR order
        for (c, &value) in [pixel[2], pixel[1], pixel[0]].iter().enumerate() {
            let value = f64::from(value);
            sums[c] += value;
            squares[c] += value * value;
        }
    }
    Ok((sums, squares, u64::from(img.width()) * u64::from(img.height())))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let entries = read_manifest(&args.manifest)?;
    if entries.is_empty() {
        bail!("manifest {} lists no samples", args.manifest.display());
    }
    log::info!("loading {} images from {:?}...", entries.len(), args.manifest);

    let per_image = entries
        .par_iter()
        .map(|entry| channel_sums(&entry.image))
        .collect::<Result<Vec<_>>>()?;

    let mut sums = [0.0; 3];
    let mut squares = [0.0; 3];
    let mut pixels = 0u64;
    for (s, sq, n) in &per_image {
        for c in 0..3 {
            sums[c] += s[c];
            squares[c] += sq[c];
        }
        pixels += n;
    }

    let n = pixels as f64;
    let mean = sums.iter().map(|s| s / n).collect::<Vec<_>>();
    let std = squares
        .iter()
        .zip(&mean)
        .map(|(sq, m)| (sq / n - m * m).max(0.0).sqrt())
        .collect::<Vec<_>>();

    let stats = NormalizationStats {
        samples: entries.len(),
        mean,
        std,
    };

    let out_path = args
        .manifest
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("normalization_stats.json");
    let json = serde_json::to_string_pretty(&stats)?;
    fs::write(&out_path, json).with_context(|| format!("failed to write {}", out_path.display()))?;

    println!("Statistics saved to {}", out_path.display());
    println!("Mean (BGR): {:?}", stats.mean);
    println!("Std (BGR): {:?}", stats.std);
    println!("VGG mean (BGR): {:?}", VGG_MEAN);

    Ok(())
}
