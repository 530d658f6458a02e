use anyhow::{bail, Context, Result};
use burn::data::dataset::Dataset;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Name of the training manifest inside a dataset directory.
pub const TRAIN_MANIFEST: &str = "train.txt";

/// Paths of one labeled sample as listed in the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub image: PathBuf,
    pub binary_label: PathBuf,
    pub instance_label: PathBuf,
}

/// A decoded, rescaled sample. Pixel buffers are row-major; `image` is HWC in
/// BGR order.
#[derive(Clone, Debug)]
pub struct LaneItem {
    pub width: usize,
    pub height: usize,
    pub image: Vec<u8>,
    pub binary: Vec<u8>,
    pub instance: Vec<u8>,
}

impl LaneItem {
    pub fn new(
        width: usize,
        height: usize,
        image: Vec<u8>,
        binary: Vec<u8>,
        instance: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(image.len(), width * height * 3);
        debug_assert_eq!(binary.len(), width * height);
        debug_assert_eq!(instance.len(), width * height);
        Self {
            width,
            height,
            image,
            binary,
            instance,
        }
    }
}

/// Reads `image binary_label instance_label` triples, one per line.
///
/// Relative paths are resolved against the manifest's directory.
pub fn read_manifest(manifest: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(manifest)
        .with_context(|| format!("failed to open manifest {}", manifest.display()))?;
    let base_dir = manifest.parent().unwrap_or_else(|| Path::new("."));

    let mut entries = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line =
            line.with_context(|| format!("failed to read line {} of {}", i + 1, manifest.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            bail!(
                "invalid manifest entry at {}:{}: expected 3 paths, found {}",
                manifest.display(),
                i + 1,
                parts.len()
            );
        }

        entries.push(ManifestEntry {
            image: base_dir.join(parts[0]),
            binary_label: base_dir.join(parts[1]),
            instance_label: base_dir.join(parts[2]),
        });
    }

    Ok(entries)
}

fn rescale<P>(
    img: ImageBuffer<P, Vec<u8>>,
    width: u32,
    height: u32,
    filter: FilterType,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    if img.dimensions() == (width, height) {
        img
    } else {
        imageops::resize(&img, width, height, filter)
    }
}

/// Decodes one manifest entry and rescales it to `width x height`.
///
/// The image uses a triangle filter; labels use nearest-neighbour so ids are
/// preserved. A binary-label pixel is lane when any of its channels is set.
pub fn load_item(entry: &ManifestEntry, width: u32, height: u32) -> Result<LaneItem> {
    let image = image::open(&entry.image)
        .with_context(|| format!("failed to decode image {}", entry.image.display()))?
        .to_rgb8();
    let image = rescale(image, width, height, FilterType::Triangle);
    let image = image
        .pixels()
        .flat_map(|p| [p[2], p[1], p[0]])
        .collect::<Vec<u8>>();

    let binary = image::open(&entry.binary_label)
        .with_context(|| format!("failed to decode binary label {}", entry.binary_label.display()))?
        .to_rgb8();
    let binary = rescale(binary, width, height, FilterType::Nearest);
    let binary = binary
        .pixels()
        .map(|p| u8::from(p.0.iter().any(|&c| c != 0)))
        .collect::<Vec<u8>>();

    let instance = image::open(&entry.instance_label)
        .with_context(|| {
            format!(
                "failed to decode instance label {}",
                entry.instance_label.display()
            )
        })?
        .to_luma8();
    let instance = rescale(instance, width, height, FilterType::Nearest).into_raw();

    Ok(LaneItem::new(
        width as usize,
        height as usize,
        image,
        binary,
        instance,
    ))
}

/// Lane dataset backed by a manifest file. Samples are decoded lazily.
pub struct LaneDataset {
    entries: Vec<ManifestEntry>,
    width: u32,
    height: u32,
}

impl LaneDataset {
    pub fn new(entries: Vec<ManifestEntry>, width: u32, height: u32) -> Self {
        Self {
            entries,
            width,
            height,
        }
    }

    pub fn from_manifest(manifest: &Path, width: u32, height: u32) -> Result<Self> {
        Ok(Self::new(read_manifest(manifest)?, width, height))
    }

    /// Opens `<dataset_dir>/train.txt`.
    pub fn train(dataset_dir: &Path, width: u32, height: u32) -> Result<Self> {
        Self::from_manifest(&dataset_dir.join(TRAIN_MANIFEST), width, height)
    }

    /// Checks that every referenced file exists.
    ///
    /// The loader stops an epoch at the first item it cannot produce, which
    /// aborts training; a missing file is reported here before the first step.
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            for path in [&entry.image, &entry.binary_label, &entry.instance_label] {
                if !path.is_file() {
                    bail!("manifest entry {} references missing file {}", i + 1, path.display());
                }
            }
        }
        Ok(())
    }
}

impl Dataset<LaneItem> for LaneDataset {
    fn get(&self, index: usize) -> Option<LaneItem> {
        let entry = self.entries.get(index)?;
        match load_item(entry, self.width, self.height) {
            Ok(item) => Some(item),
            Err(err) => {
                log::error!("failed to load sample {index}: {err:#}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use std::fs;

    fn write_sample(dir: &Path, name: &str) {
        let mut img = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.save(dir.join(format!("{name}.png"))).unwrap();

        let mut binary = RgbImage::new(8, 4);
        binary.put_pixel(1, 0, Rgb([0, 0, 255]));
        binary.put_pixel(2, 3, Rgb([255, 255, 255]));
        binary.save(dir.join(format!("{name}_binary.png"))).unwrap();

        let mut instance = GrayImage::new(8, 4);
        instance.put_pixel(1, 0, Luma([20]));
        instance.put_pixel(2, 3, Luma([70]));
        instance.save(dir.join(format!("{name}_instance.png"))).unwrap();
    }

    #[test]
    fn manifest_resolves_relative_paths_and_skips_blank_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = tmp.path().join(TRAIN_MANIFEST);
        fs::write(
            &manifest,
            "a.png a_binary.png a_instance.png\n\n  /abs/b.png b_bin.png b_ins.png  \n",
        )
        .unwrap();

        let entries = read_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image, tmp.path().join("a.png"));
        assert_eq!(entries[0].instance_label, tmp.path().join("a_instance.png"));
        assert_eq!(entries[1].image, PathBuf::from("/abs/b.png"));
        assert_eq!(entries[1].binary_label, tmp.path().join("b_bin.png"));
    }

    #[test]
    fn manifest_rejects_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = tmp.path().join(TRAIN_MANIFEST);
        fs::write(&manifest, "a.png a_binary.png a_instance.png\nb.png b_binary.png\n").unwrap();

        let err = read_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains(":2"), "{err}");
    }

    #[test]
    fn load_item_converts_to_bgr_and_binarizes_labels() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "s");
        fs::write(
            tmp.path().join(TRAIN_MANIFEST),
            "s.png s_binary.png s_instance.png\n",
        )
        .unwrap();

        let dataset = LaneDataset::train(tmp.path(), 8, 4).unwrap();
        dataset.validate().unwrap();
        assert_eq!(dataset.len(), 1);

        let item = dataset.get(0).unwrap();
        assert_eq!((item.width, item.height), (8, 4));
        assert_eq!(&item.image[0..3], &[0, 0, 255]);
        assert_eq!(&item.image[3..6], &[30, 20, 10]);
        assert_eq!(item.binary[1], 1);
        assert_eq!(item.binary[2 + 3 * 8], 1);
        assert_eq!(item.binary.iter().map(|&b| b as usize).sum::<usize>(), 2);
        assert_eq!(item.instance[1], 20);
        assert_eq!(item.instance[2 + 3 * 8], 70);
        assert!(dataset.get(1).is_none());
    }

    #[test]
    fn validate_reports_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(TRAIN_MANIFEST),
            "missing.png missing_binary.png missing_instance.png\n",
        )
        .unwrap();

        let dataset = LaneDataset::train(tmp.path(), 8, 4).unwrap();
        let err = dataset.validate().unwrap_err();
        assert!(err.to_string().contains("missing.png"), "{err}");
        assert!(dataset.get(0).is_none());
    }
}
