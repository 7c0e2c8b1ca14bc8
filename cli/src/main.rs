use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use detrack_core::{
    config::{Pairing, PipelineConfig},
    dataset::{split_dataset, SplitOptions, DEFAULT_SEED, DEFAULT_VAL_SPLIT},
    detection::YoloDetector,
    pipeline::track_video,
    runtime::configure_ort_dylib,
    tracking::SortTracker,
    training::{AugmentationPipeline, CommandTrainer, EvalConfig, TrainConfig, Trainer, TrainingJob},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "detrack",
    version,
    about = "Detect, track and annotate objects in video; prepare and train detectors",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and track objects, burn boxes and ids into a new video.
    Track(TrackArgs),

    /// Split an image/label directory pair into train and valid sets.
    Split {
        #[arg(long, default_value = "data/images")]
        images: PathBuf,

        #[arg(long, default_value = "data/labels")]
        labels: PathBuf,

        /// Root for train/ and valid/
        #[arg(long, default_value = "data")]
        output: PathBuf,

        /// Fraction of pairs that go to valid/
        #[arg(long, default_value_t = DEFAULT_VAL_SPLIT)]
        val_split: f64,

        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,
    },

    /// Train a detector with the external framework, then validate it.
    Train(TrainArgs),
}

#[derive(clap::Args)]
struct TrackArgs {
    /// Input video path
    #[arg(short, long)]
    input: PathBuf,

    /// Output video path
    #[arg(short, long, default_value = "output.mp4")]
    output: PathBuf,

    /// YOLOv8 ONNX model path
    #[arg(long, default_value = "best.onnx")]
    model: PathBuf,

    /// YAML pipeline config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    confidence_threshold: Option<f32>,

    #[arg(long)]
    iou_threshold: Option<f32>,

    #[arg(long)]
    tracker_max_age: Option<u32>,

    #[arg(long)]
    tracker_min_hits: Option<u32>,

    #[arg(long)]
    tracker_iou_threshold: Option<f32>,

    /// Font for label text
    #[arg(long)]
    font: Option<PathBuf>,

    /// explicit | positional
    #[arg(long)]
    pairing: Option<Pairing>,
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Dataset descriptor
    #[arg(long, default_value = "data.yaml")]
    data: PathBuf,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    epochs: Option<u32>,

    #[arg(long)]
    batch: Option<u32>,

    #[arg(long)]
    imgsz: Option<u32>,

    #[arg(long)]
    patience: Option<u32>,

    #[arg(long)]
    device: Option<String>,

    /// YAML augmentation pipeline (defaults to blur/median/CLAHE/brightness)
    #[arg(long)]
    augmentations: Option<PathBuf>,

    /// Run directory for the manifest and outputs
    #[arg(long, default_value = "runs/detect/train")]
    run_dir: PathBuf,

    /// Python interpreter with `ultralytics` installed
    #[arg(long, default_value = "python3")]
    python: PathBuf,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Track(args) => cmd_track(args),
        Commands::Split {
            images,
            labels,
            output,
            val_split,
            seed,
        } => cmd_split(images, labels, output, val_split, seed),
        Commands::Train(args) => cmd_train(args),
    }
}

// ── track ─────────────────────────────────────────────────────────────────────

fn pipeline_config(args: &TrackArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(v) = args.confidence_threshold {
        config.confidence_threshold = v;
    }
    if let Some(v) = args.iou_threshold {
        config.iou_threshold = v;
    }
    if let Some(v) = args.tracker_max_age {
        config.tracker_max_age = v;
    }
    if let Some(v) = args.tracker_min_hits {
        config.tracker_min_hits = v;
    }
    if let Some(v) = args.tracker_iou_threshold {
        config.tracker_iou_threshold = v;
    }
    if let Some(font) = &args.font {
        config.font_path = Some(font.clone());
    }
    if let Some(pairing) = args.pairing {
        config.pairing = pairing;
    }

    config.validate()?;
    Ok(config)
}

fn cmd_track(args: TrackArgs) -> Result<()> {
    let config = pipeline_config(&args)?;
    info!("track");
    info!("  input  : {}", args.input.display());
    info!("  output : {}", args.output.display());
    info!("  model  : {}", args.model.display());

    configure_ort_dylib();
    let detector = YoloDetector::load(&args.model)
        .with_context(|| format!("failed to load model: {}", args.model.display()))?;
    let tracker = SortTracker::new(
        config.tracker_max_age,
        config.tracker_min_hits,
        config.tracker_iou_threshold,
    );

    let pb = spinner("Tracking…")?;
    let bar = bar_style()?;
    let pb2 = pb.clone();
    let summary = track_video(
        &args.input,
        &args.output,
        detector,
        tracker,
        config,
        move |current, total| {
            if total > 0 && pb2.length() != Some(total) {
                pb2.set_length(total);
                pb2.set_style(bar.clone());
            }
            pb2.set_position(current);
        },
    )
    .context("tracking failed")?;

    pb.finish_with_message("Done.");
    info!(
        frames = summary.frames_written,
        detections = summary.detections,
        tracks = summary.max_track_id.unwrap_or(0),
        "saved {}",
        args.output.display()
    );
    Ok(())
}

// ── split ─────────────────────────────────────────────────────────────────────

fn cmd_split(
    images: PathBuf,
    labels: PathBuf,
    output: PathBuf,
    val_split: f64,
    seed: u64,
) -> Result<()> {
    let opts = SplitOptions {
        images_dir: images,
        labels_dir: labels,
        output_dir: output,
        val_split,
        seed,
    };
    let report = split_dataset(&opts).context("dataset split failed")?;

    info!(
        found = report.found_images,
        train = report.train.len(),
        valid = report.valid.len(),
        skipped = report.skipped.len(),
        copy_errors = report.copy_errors,
        "split written to {}",
        opts.output_dir.display()
    );
    Ok(())
}

// ── train ─────────────────────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut config = TrainConfig::default();
    if let Some(v) = args.model {
        config.model = v;
    }
    if let Some(v) = args.epochs {
        config.epochs = v;
    }
    if let Some(v) = args.batch {
        config.batch = v;
    }
    if let Some(v) = args.imgsz {
        config.imgsz = v;
    }
    if let Some(v) = args.patience {
        config.patience = v;
    }
    if let Some(v) = args.device {
        config.device = v;
    }

    let augmentations = match &args.augmentations {
        Some(path) => AugmentationPipeline::load(path)?,
        None => AugmentationPipeline::default(),
    };

    let job = TrainingJob::new(&args.data, config, augmentations, args.run_dir)?;
    let mut trainer = CommandTrainer::new(args.python);

    let model = trainer.train(&job).context("training failed")?;
    trainer
        .evaluate(&model, &EvalConfig::default())
        .context("validation failed")?;

    info!("best weights: {}", model.weights.display());
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} {pos} frames [{elapsed_precise}]")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(
        "{msg} [{bar:40.cyan/blue}] {pos}/{len} frames ({eta})",
    )?
    .progress_chars("=> "))
}
