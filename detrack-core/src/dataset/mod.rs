//! dataset — train/valid split of a YOLO-format image + label directory pair

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info, warn};

use crate::error::Error;

pub const DEFAULT_VAL_SPLIT: f64 = 0.2;
pub const DEFAULT_SEED: u64 = 42;

/// Recognised image extensions, in copy preference order.
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq)]
pub struct SplitOptions {
    pub images_dir: PathBuf,
    pub labels_dir: PathBuf,
    pub output_dir: PathBuf,
    pub val_split: f64,
    pub seed: u64,
}

impl SplitOptions {
    pub fn new(
        images_dir: impl Into<PathBuf>,
        labels_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            images_dir: images_dir.into(),
            labels_dir: labels_dir.into(),
            output_dir: output_dir.into(),
            val_split: DEFAULT_VAL_SPLIT,
            seed: DEFAULT_SEED,
        }
    }
}

/// Outcome of a split. `train` and `valid` hold base names in copy order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitReport {
    pub found_images: usize,
    pub train: Vec<String>,
    pub valid: Vec<String>,
    /// Images without a label file.
    pub skipped: Vec<String>,
    pub copy_errors: usize,
}

/// Split `images_dir`/`labels_dir` into `output_dir/{train,valid}/{images,labels}`.
///
/// Only images with a matching `<base>.txt` label take part. The same seed
/// over the same inputs always gives the same partition.
pub fn split_dataset(opts: &SplitOptions) -> Result<SplitReport> {
    if !(0.0..=1.0).contains(&opts.val_split) {
        return Err(Error::InvalidConfig(format!(
            "val_split must be within [0, 1], got {}",
            opts.val_split
        ))
        .into());
    }
    for dir in [&opts.images_dir, &opts.labels_dir] {
        if !dir.is_dir() {
            return Err(Error::FileNotFound(dir.clone()).into());
        }
    }

    let train_dirs = SplitDirs::create(&opts.output_dir.join("train"))?;
    let valid_dirs = SplitDirs::create(&opts.output_dir.join("valid"))?;

    let images = collect_images(&opts.images_dir)?;
    info!(count = images.len(), dir = %opts.images_dir.display(), "found images");

    let mut report = SplitReport {
        found_images: images.len(),
        ..Default::default()
    };

    let mut labelled = Vec::with_capacity(images.len());
    for base in images.keys() {
        if label_path(&opts.labels_dir, base).is_file() {
            labelled.push(base.clone());
        } else {
            warn!(base = %base, "no label {base}.txt, skipping");
            report.skipped.push(base.clone());
        }
    }
    info!(pairs = labelled.len(), "image/label pairs");

    let mut rng = StdRng::seed_from_u64(opts.seed);
    labelled.shuffle(&mut rng);

    let split_idx = ((labelled.len() as f64) * (1.0 - opts.val_split)).floor() as usize;
    let valid = labelled.split_off(split_idx.min(labelled.len()));
    let train = labelled;
    info!(train = train.len(), valid = valid.len(), "split computed");

    report.copy_errors += copy_pairs(&train, &images, &opts.labels_dir, &train_dirs);
    report.copy_errors += copy_pairs(&valid, &images, &opts.labels_dir, &valid_dirs);
    report.train = train;
    report.valid = valid;

    if report.copy_errors > 0 {
        warn!(errors = report.copy_errors, "split finished with copy errors");
    } else {
        info!(output = %opts.output_dir.display(), "split finished");
    }
    Ok(report)
}

struct SplitDirs {
    images: PathBuf,
    labels: PathBuf,
}

impl SplitDirs {
    fn create(root: &Path) -> Result<Self> {
        let dirs = Self {
            images: root.join("images"),
            labels: root.join("labels"),
        };
        for dir in [&dirs.images, &dirs.labels] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

fn label_path(labels_dir: &Path, base: &str) -> PathBuf {
    labels_dir.join(format!("{base}.txt"))
}

/// Base name → image file. When a base exists under several extensions the
/// earliest one in `IMAGE_EXTENSIONS` wins.
fn collect_images(images_dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let entries = fs::read_dir(images_dir)
        .with_context(|| format!("failed to list {}", images_dir.display()))?;

    let mut images: BTreeMap<String, (usize, PathBuf)> = BTreeMap::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(rank) = extension_rank(&path) else {
            continue;
        };
        let Some(base) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match images.get(base) {
            Some((existing, _)) if *existing <= rank => {}
            _ => {
                images.insert(base.to_owned(), (rank, path));
            }
        }
    }
    Ok(images.into_iter().map(|(base, (_, path))| (base, path)).collect())
}

fn extension_rank(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().position(|e| *e == ext)
}

/// Copy every base's image and label. Returns the number of failures.
fn copy_pairs(
    bases: &[String],
    images: &BTreeMap<String, PathBuf>,
    labels_dir: &Path,
    dst: &SplitDirs,
) -> usize {
    let mut errors = 0;
    for base in bases {
        if let Some(src) = images.get(base) {
            if let Err(e) = copy_into(src, &dst.images) {
                error!(base = %base, "failed to copy image: {e:#}");
                errors += 1;
            }
        }

        let label = label_path(labels_dir, base);
        if !label.is_file() {
            error!(base = %base, "label {base}.txt disappeared before copy");
            errors += 1;
            continue;
        }
        if let Err(e) = copy_into(&label, &dst.labels) {
            error!(base = %base, "failed to copy label: {e:#}");
            errors += 1;
        }
    }
    errors
}

fn copy_into(src: &Path, dst_dir: &Path) -> Result<()> {
    let name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    fs::copy(src, dst_dir.join(name))
        .with_context(|| format!("copy {} -> {}", src.display(), dst_dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn fixture(labelled: usize, unlabelled: usize) -> (TempDir, SplitOptions) {
        let root = tempfile::tempdir().unwrap();
        let images = root.path().join("images");
        let labels = root.path().join("labels");
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();

        for i in 0..labelled {
            fs::write(images.join(format!("img{i:03}.jpg")), b"jpg").unwrap();
            fs::write(labels.join(format!("img{i:03}.txt")), b"0 0.5 0.5 0.1 0.1\n").unwrap();
        }
        for i in 0..unlabelled {
            fs::write(images.join(format!("orphan{i}.png")), b"png").unwrap();
        }
        fs::write(images.join("notes.md"), b"ignored").unwrap();

        let out = root.path().join("out");
        let opts = SplitOptions::new(images, labels, out);
        (root, opts)
    }

    fn listed(dir: &Path) -> HashSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn split_sizes_and_partition() {
        let (_root, opts) = fixture(10, 2);
        let report = split_dataset(&opts).unwrap();

        assert_eq!(report.found_images, 12);
        assert_eq!(report.train.len(), 8);
        assert_eq!(report.valid.len(), 2);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.copy_errors, 0);

        let train: HashSet<_> = report.train.iter().cloned().collect();
        let valid: HashSet<_> = report.valid.iter().cloned().collect();
        assert!(train.is_disjoint(&valid));
        assert_eq!(train.len() + valid.len(), 10);
        assert!(train.iter().chain(&valid).all(|b| b.starts_with("img")));

        let train_images = listed(&opts.output_dir.join("train/images"));
        let valid_labels = listed(&opts.output_dir.join("valid/labels"));
        assert_eq!(train_images.len(), 8);
        assert!(report.valid.iter().all(|b| valid_labels.contains(&format!("{b}.txt"))));
    }

    #[test]
    fn same_seed_same_partition() {
        let (_a, opts_a) = fixture(17, 0);
        let (_b, opts_b) = fixture(17, 0);
        let a = split_dataset(&opts_a).unwrap();
        let b = split_dataset(&opts_b).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.valid, b.valid);
    }

    #[test]
    fn split_index_floors() {
        let (_root, mut opts) = fixture(7, 0);
        opts.val_split = 0.3;
        let report = split_dataset(&opts).unwrap();
        // 7 * 0.7 = 4.9
        assert_eq!(report.train.len(), 4);
        assert_eq!(report.valid.len(), 3);
    }

    #[test]
    fn empty_images_dir_yields_empty_split() {
        let (_root, opts) = fixture(0, 0);
        let report = split_dataset(&opts).unwrap();
        assert!(report.train.is_empty());
        assert!(report.valid.is_empty());
        assert!(opts.output_dir.join("valid/labels").is_dir());
    }

    #[test]
    fn duplicate_bases_prefer_jpg() {
        let (_root, opts) = fixture(1, 0);
        fs::write(opts.images_dir.join("img000.PNG"), b"png").unwrap();
        let report = split_dataset(&opts).unwrap();
        assert_eq!(report.found_images, 1);

        let copied: HashSet<String> = listed(&opts.output_dir.join("train/images"))
            .union(&listed(&opts.output_dir.join("valid/images")))
            .cloned()
            .collect();
        assert_eq!(copied, HashSet::from(["img000.jpg".to_owned()]));
    }

    #[test]
    fn missing_dirs_fail_fast() {
        let root = tempfile::tempdir().unwrap();
        let opts = SplitOptions::new(
            root.path().join("nope"),
            root.path(),
            root.path().join("out"),
        );
        let err = split_dataset(&opts).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::FileNotFound(_))));
        assert!(!root.path().join("out").exists());
    }

    #[test]
    fn bad_ratio_is_rejected() {
        let (_root, mut opts) = fixture(2, 0);
        opts.val_split = 1.5;
        let err = split_dataset(&opts).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidConfig(_))));
    }
}
