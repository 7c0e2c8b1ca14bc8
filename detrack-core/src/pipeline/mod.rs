//! pipeline — detect → track → annotate → write, one frame at a time

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::detection::{Detection, Detector};
use crate::rendering::{FrameAnnotator, Label};
use crate::tracking::{Observation, TrackRecord, Tracker};
use crate::video::{FrameSink, FrameSource, RgbFrame, VideoReader, VideoWriter};

/// Log per-stage timings every this many frames.
const PROFILE_EVERY: u64 = 300;

/// What happened to one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    /// Detections in tracker input order (ascending confidence).
    pub detections: Vec<Detection>,
    pub tracks: Vec<TrackRecord>,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    pub frames_written: u64,
    pub detections: u64,
    pub max_track_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Done,
}

/// Detect → track → annotate, one frame at a time.
///
/// The detector and tracker are owned by the pipeline; the tracker's state
/// is only ever touched from `process_frame`, in frame order.
pub struct VideoPipeline<D, T> {
    detector: D,
    tracker: T,
    annotator: FrameAnnotator,
    config: PipelineConfig,
    prof_frames: u64,
    prof_detect: Duration,
    prof_track: Duration,
    prof_annotate: Duration,
}

impl<D: Detector, T: Tracker> VideoPipeline<D, T> {
    pub fn new(detector: D, tracker: T, annotator: FrameAnnotator, config: PipelineConfig) -> Self {
        Self {
            detector,
            tracker,
            annotator,
            config,
            prof_frames: 0,
            prof_detect: Duration::ZERO,
            prof_track: Duration::ZERO,
            prof_annotate: Duration::ZERO,
        }
    }

    pub fn into_parts(self) -> (D, T) {
        (self.detector, self.tracker)
    }

    /// Run one frame through the detector, tracker and annotator. The frame
    /// is annotated in place.
    pub fn process_frame(&mut self, frame: &mut RgbFrame) -> Result<FrameReport> {
        let detect_start = Instant::now();
        let mut detections = self
            .detector
            .detect(
                frame,
                self.config.confidence_threshold,
                self.config.iou_threshold,
            )
            .with_context(|| format!("detection failed at pts {}", frame.pts))?;
        // Tracker input order: ascending confidence, ties keep detector order.
        detections.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));
        self.prof_detect += detect_start.elapsed();

        let track_start = Instant::now();
        let observations: Vec<Observation> = detections.iter().map(Observation::from).collect();
        let tracks = self
            .tracker
            .update(&observations)
            .with_context(|| format!("tracker update failed at pts {}", frame.pts))?;
        self.prof_track += track_start.elapsed();

        let annotate_start = Instant::now();
        let labels = self.annotator.annotate(frame, &detections, &tracks)?;
        self.prof_annotate += annotate_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % PROFILE_EVERY == 0 {
            self.log_timings();
        }

        Ok(FrameReport {
            detections,
            tracks,
            labels,
        })
    }

    /// Pull every frame from `source`, process it and push it to `sink`.
    ///
    /// Stops at end of stream or on the first read failure. The sink is
    /// finished on every exit path, including processing errors.
    pub fn run<S, K, F>(&mut self, source: &mut S, sink: &mut K, progress: F) -> Result<RunSummary>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
        F: FnMut(u64, u64),
    {
        let result = self.run_frames(source, sink, progress);
        let finished = sink.finish().context("failed to finalise output");
        let summary = result?;
        finished?;

        info!(
            frames_read = summary.frames_read,
            frames_written = summary.frames_written,
            detections = summary.detections,
            max_track_id = ?summary.max_track_id,
            "video processing complete"
        );
        Ok(summary)
    }

    fn run_frames<S, K, F>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        mut progress: F,
    ) -> Result<RunSummary>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
        F: FnMut(u64, u64),
    {
        let total = source.info().total_frames;
        let mut summary = RunSummary::default();
        let mut state = State::Reading;

        while state == State::Reading {
            state = match source.read_frame() {
                Ok(Some(mut frame)) => {
                    summary.frames_read += 1;
                    let report = self.process_frame(&mut frame)?;
                    summary.detections += report.detections.len() as u64;
                    if let Some(id) = report.tracks.iter().map(|t| t.track_id).max() {
                        summary.max_track_id = Some(summary.max_track_id.map_or(id, |m| m.max(id)));
                    }

                    sink.write_frame(&frame)
                        .with_context(|| format!("failed to write frame {}", frame.pts))?;
                    summary.frames_written += 1;
                    progress(summary.frames_written, total);
                    State::Reading
                }
                Ok(None) => State::Done,
                Err(e) => {
                    warn!(frames_read = summary.frames_read, "stopping on read failure: {e:#}");
                    State::Done
                }
            };
        }

        if self.prof_frames % PROFILE_EVERY != 0 {
            self.log_timings();
        }
        Ok(summary)
    }

    fn log_timings(&self) {
        if self.prof_frames == 0 {
            return;
        }
        let per_frame = |d: Duration| {
            format!(
                "{:.2}",
                d.as_secs_f64() * 1000.0 / self.prof_frames as f64
            )
        };
        info!(
            frames = self.prof_frames,
            detect_ms_per_frame = per_frame(self.prof_detect),
            track_ms_per_frame = per_frame(self.prof_track),
            annotate_ms_per_frame = per_frame(self.prof_annotate),
            "pipeline timings"
        );
    }
}

/// Process `input_path` into `output_path` with the given detector and
/// tracker. The output keeps the input's resolution and frame rate.
///
/// Fails before touching the output if the input cannot be opened.
pub fn track_video<P, Q, D, T, F>(
    input_path: P,
    output_path: Q,
    detector: D,
    tracker: T,
    config: PipelineConfig,
    progress: F,
) -> Result<RunSummary>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    D: Detector,
    T: Tracker,
    F: FnMut(u64, u64),
{
    config.validate()?;

    let annotator = FrameAnnotator::from_font_path(config.font_path.as_deref(), config.pairing)?;

    let mut reader = VideoReader::open(&input_path)?;
    let mut writer = VideoWriter::create(&output_path, reader.info())?;
    let mut pipeline = VideoPipeline::new(detector, tracker, annotator, config);
    pipeline.run(&mut reader, &mut writer, progress)
}
