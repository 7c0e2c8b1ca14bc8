//! training — dataset descriptor, training/eval settings, augmentations and
//! the trainer seam.
//!
//! Training itself happens in an external framework. This module describes
//! the job (what data, which hyper-parameters, which photometric/spatial
//! augmentations) and hands it to a [`Trainer`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Error;

/// Env var through which the driver finds the job manifest.
pub const MANIFEST_ENV: &str = "DETRACK_JOB_MANIFEST";
const MANIFEST_FILE: &str = "job.yaml";
const DRIVER_FILE: &str = "train_driver.py";
/// Ultralytics entry script: installs the manifest's augmentations, then
/// trains or validates.
const DRIVER_SOURCE: &str = include_str!("../../assets/train_driver.py");

// ── data.yaml ─────────────────────────────────────────────────────────────────

/// Class names as written in `data.yaml`: either a list or an id → name map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassNames {
    List(Vec<String>),
    Map(BTreeMap<u32, String>),
}

impl ClassNames {
    pub fn len(&self) -> usize {
        match self {
            Self::List(v) => v.len(),
            Self::Map(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, class_id: u32) -> Option<&str> {
        match self {
            Self::List(v) => v.get(class_id as usize).map(String::as_str),
            Self::Map(m) => m.get(&class_id).map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub train: PathBuf,
    pub val: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nc: Option<usize>,
    pub names: ClassNames,
}

impl DatasetDescriptor {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let descriptor: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse dataset descriptor {}", path.display()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.names.is_empty() {
            return Err(Error::InvalidConfig("dataset declares no class names".into()));
        }
        if let Some(nc) = self.nc {
            if nc != self.names.len() {
                return Err(Error::InvalidConfig(format!(
                    "nc is {nc} but {} class names are listed",
                    self.names.len()
                )));
            }
        }
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.names.len()
    }
}

// ── Hyper-parameters ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Starting weights.
    pub model: String,
    pub epochs: u32,
    pub batch: u32,
    pub imgsz: u32,
    /// Epochs without improvement before early stop.
    pub patience: u32,
    pub plots: bool,
    /// Mixed precision.
    pub amp: bool,
    pub device: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: "yolov8n.pt".into(),
            epochs: 100,
            batch: 8,
            imgsz: 640,
            patience: 10,
            plots: true,
            amp: false,
            device: "0".into(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.epochs == 0 || self.batch == 0 || self.imgsz == 0 {
            return Err(Error::InvalidConfig(
                "epochs, batch and imgsz must be positive".into(),
            ));
        }
        if self.imgsz % 32 != 0 {
            return Err(Error::InvalidConfig(format!(
                "imgsz must be a multiple of 32, got {}",
                self.imgsz
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub conf: f32,
    pub iou: f32,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self { conf: 0.5, iou: 0.5 }
    }
}

// ── Augmentations ─────────────────────────────────────────────────────────────

/// One augmentation applied with probability `p`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AugmentationStep {
    Blur { p: f32 },
    MedianBlur { p: f32 },
    Clahe { p: f32 },
    RandomBrightnessContrast {
        brightness: (f32, f32),
        contrast: (f32, f32),
        p: f32,
    },
    HorizontalFlip { p: f32 },
    VerticalFlip { p: f32 },
    Rotate { limit: f32, p: f32 },
    RandomCrop { width: u32, height: u32, p: f32 },
    Affine { scale: (f32, f32), translate: f32, p: f32 },
}

impl AugmentationStep {
    pub fn probability(&self) -> f32 {
        match *self {
            Self::Blur { p }
            | Self::MedianBlur { p }
            | Self::Clahe { p }
            | Self::RandomBrightnessContrast { p, .. }
            | Self::HorizontalFlip { p }
            | Self::VerticalFlip { p }
            | Self::Rotate { p, .. }
            | Self::RandomCrop { p, .. }
            | Self::Affine { p, .. } => p,
        }
    }

    /// Whether the step moves pixels, so boxes have to move with them.
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            Self::HorizontalFlip { .. }
                | Self::VerticalFlip { .. }
                | Self::Rotate { .. }
                | Self::RandomCrop { .. }
                | Self::Affine { .. }
        )
    }
}

impl fmt::Display for AugmentationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blur { p } => write!(f, "Blur(p={p})"),
            Self::MedianBlur { p } => write!(f, "MedianBlur(p={p})"),
            Self::Clahe { p } => write!(f, "CLAHE(p={p})"),
            Self::RandomBrightnessContrast {
                brightness,
                contrast,
                p,
            } => write!(
                f,
                "RandomBrightnessContrast(brightness=({}, {}), contrast=({}, {}), p={p})",
                brightness.0, brightness.1, contrast.0, contrast.1
            ),
            Self::HorizontalFlip { p } => write!(f, "HorizontalFlip(p={p})"),
            Self::VerticalFlip { p } => write!(f, "VerticalFlip(p={p})"),
            Self::Rotate { limit, p } => write!(f, "Rotate(limit={limit}, p={p})"),
            Self::RandomCrop { width, height, p } => {
                write!(f, "RandomCrop(width={width}, height={height}, p={p})")
            }
            Self::Affine {
                scale,
                translate,
                p,
            } => write!(
                f,
                "Affine(scale=({}, {}), translate={translate}, p={p})",
                scale.0, scale.1
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationPipeline {
    pub steps: Vec<AugmentationStep>,
}

impl Default for AugmentationPipeline {
    fn default() -> Self {
        Self {
            steps: vec![
                AugmentationStep::Blur { p: 0.2 },
                AugmentationStep::MedianBlur { p: 0.2 },
                AugmentationStep::Clahe { p: 0.2 },
                AugmentationStep::RandomBrightnessContrast {
                    brightness: (-0.2, 0.2),
                    contrast: (-0.3, 0.3),
                    p: 0.4,
                },
            ],
        }
    }
}

impl AugmentationPipeline {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let pipeline: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse augmentations {}", path.display()))?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for step in &self.steps {
            let p = step.probability();
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!(
                    "{step}: probability must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Spatial pipelines need YOLO-format box parameters so labels follow the
    /// pixels.
    pub fn contains_spatial(&self) -> bool {
        self.steps.iter().any(AugmentationStep::is_spatial)
    }

    /// One-line description of the active steps (those with `p > 0`).
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .filter(|s| s.probability() > 0.0)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ── Trainer seam ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    /// Path to `data.yaml`.
    pub data: PathBuf,
    pub dataset: DatasetDescriptor,
    pub config: TrainConfig,
    pub augmentations: AugmentationPipeline,
    /// Where the job manifest and run outputs go.
    pub run_dir: PathBuf,
}

impl TrainingJob {
    pub fn new<P: AsRef<Path>>(
        data: P,
        config: TrainConfig,
        augmentations: AugmentationPipeline,
        run_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let data = data.as_ref().to_path_buf();
        let dataset = DatasetDescriptor::load(&data)?;
        config.validate()?;
        augmentations.validate()?;
        Ok(Self {
            data,
            dataset,
            config,
            augmentations,
            run_dir: run_dir.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub weights: PathBuf,
    pub run_dir: PathBuf,
}

pub trait Trainer {
    fn train(&mut self, job: &TrainingJob) -> Result<TrainedModel>;
    fn evaluate(&mut self, model: &TrainedModel, eval: &EvalConfig) -> Result<()>;
}

/// Runs jobs through the bundled Ultralytics driver script with an external
/// Python interpreter.
///
/// `train` writes `job.yaml` and `train_driver.py` into the run directory and
/// runs `<python> train_driver.py train` with [`MANIFEST_ENV`] pointing at the
/// manifest; the driver reads the hyper-parameters and the augmentation steps
/// from there.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    python: PathBuf,
    manifest: Option<PathBuf>,
}

impl Default for CommandTrainer {
    fn default() -> Self {
        Self::new("python3")
    }
}

impl CommandTrainer {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            manifest: None,
        }
    }

    fn write_manifest(job: &TrainingJob) -> Result<PathBuf> {
        fs::create_dir_all(&job.run_dir)
            .with_context(|| format!("failed to create run dir {}", job.run_dir.display()))?;
        let manifest = job.run_dir.join(MANIFEST_FILE);
        let yaml = serde_yaml::to_string(job).context("failed to serialise job manifest")?;
        fs::write(&manifest, yaml)
            .with_context(|| format!("failed to write {}", manifest.display()))?;
        Ok(manifest)
    }

    fn write_driver(run_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;
        let driver = run_dir.join(DRIVER_FILE);
        fs::write(&driver, DRIVER_SOURCE)
            .with_context(|| format!("failed to write {}", driver.display()))?;
        Ok(driver)
    }

    fn run(&self, args: Vec<String>) -> Result<()> {
        let mut cmd = Command::new(&self.python);
        cmd.args(&args);
        if let Some(manifest) = &self.manifest {
            cmd.env(MANIFEST_ENV, manifest);
        }
        debug!(python = %self.python.display(), ?args, "spawning trainer");

        let status = cmd
            .status()
            .map_err(|e| Error::Training(format!("failed to start {}: {e}", self.python.display())))?;
        if !status.success() {
            return Err(Error::Training(format!(
                "{} exited with {status}",
                self.python.display()
            ))
            .into());
        }
        Ok(())
    }
}

fn train_args(driver: &Path) -> Vec<String> {
    vec![driver.display().to_string(), "train".into()]
}

fn eval_args(driver: &Path, model: &TrainedModel, eval: &EvalConfig) -> Vec<String> {
    vec![
        driver.display().to_string(),
        "val".into(),
        "--weights".into(),
        model.weights.display().to_string(),
        "--conf".into(),
        eval.conf.to_string(),
        "--iou".into(),
        eval.iou.to_string(),
    ]
}

impl Trainer for CommandTrainer {
    fn train(&mut self, job: &TrainingJob) -> Result<TrainedModel> {
        let manifest = Self::write_manifest(job)?;
        let driver = Self::write_driver(&job.run_dir)?;
        self.manifest = Some(manifest.clone());

        info!(
            data = %job.data.display(),
            classes = job.dataset.num_classes(),
            model = %job.config.model,
            epochs = job.config.epochs,
            manifest = %manifest.display(),
            "starting training"
        );
        let summary = job.augmentations.summary();
        if !summary.is_empty() {
            info!(
                spatial = job.augmentations.contains_spatial(),
                "augmentations: {summary}"
            );
        }

        self.run(train_args(&driver))?;

        let weights = job.run_dir.join("weights").join("best.pt");
        info!(weights = %weights.display(), "training finished");
        Ok(TrainedModel {
            weights,
            run_dir: job.run_dir.clone(),
        })
    }

    fn evaluate(&mut self, model: &TrainedModel, eval: &EvalConfig) -> Result<()> {
        let driver = Self::write_driver(&model.run_dir)?;
        info!(weights = %model.weights.display(), conf = eval.conf, iou = eval.iou, "evaluating");
        self.run(eval_args(&driver, model, eval))
    }
}
