//! End-to-end: scripted detector → SORT → annotator over in-memory frames.

use detrack_core::config::{Pairing, PipelineConfig};
use detrack_core::detection::{Detection, Detector};
use detrack_core::pipeline::VideoPipeline;
use detrack_core::rendering::FrameAnnotator;
use detrack_core::tracking::SortTracker;
use detrack_core::video::{FrameSource, FrameRate, RgbFrame, VecSink, VecSource};
use detrack_core::Result;
use nearly_eq::assert_nearly_eq;

const BLUE: [u8; 3] = [0, 0, 255];
const GREEN: [u8; 3] = [0, 255, 0];

/// Returns the same detections for every frame.
struct Fixed(Vec<Detection>);

impl Detector for Fixed {
    fn detect(&mut self, _frame: &RgbFrame, conf: f32, _iou: f32) -> Result<Vec<Detection>> {
        Ok(self.0.iter().copied().filter(|d| d.confidence >= conf).collect())
    }
}

fn blank_frames(n: usize, width: u32, height: u32) -> Vec<RgbFrame> {
    (0..n).map(|i| RgbFrame::new(width, height, i as i64)).collect()
}

fn pipeline(detections: Vec<Detection>) -> VideoPipeline<Fixed, SortTracker> {
    let config = PipelineConfig::default();
    VideoPipeline::new(
        Fixed(detections),
        SortTracker::new(
            config.tracker_max_age,
            config.tracker_min_hits,
            config.tracker_iou_threshold,
        ),
        FrameAnnotator::new(config.pairing).unwrap(),
        config,
    )
}

#[test]
fn static_box_keeps_its_id() {
    let mut pipeline = pipeline(vec![Detection::new(10.0, 10.0, 50.0, 50.0, 0.9, 1)]);

    let mut ids = Vec::new();
    for mut frame in blank_frames(3, 96, 72) {
        let report = pipeline.process_frame(&mut frame).unwrap();

        assert_eq!(report.labels.len(), 1);
        let label = &report.labels[0];
        assert_nearly_eq!(label.confidence, 0.9, 0.01);
        assert_eq!(label.class_id, 1);
        assert_eq!(label.color, BLUE);
        ids.push(label.track_id);

        for (x, y) in [(10, 10), (50, 10), (10, 50), (50, 50)] {
            assert_eq!(frame.pixel(x, y), Some(BLUE), "corner ({x}, {y})");
        }
        assert_eq!(frame.pixel(30, 30), Some([0, 0, 0]));
    }

    assert!(ids[1].is_some());
    assert_eq!(ids[1], ids[2]);
}

#[test]
fn output_matches_input_geometry_and_length() {
    let mut source = VecSource::new(FrameRate::new(30000, 1001), blank_frames(5, 80, 60));
    let info = *source.info();
    let mut sink = VecSink::default();

    let mut pipeline = pipeline(vec![
        Detection::new(5.0, 5.0, 25.0, 25.0, 0.95, 0),
        Detection::new(40.0, 20.0, 70.0, 55.0, 0.8, 1),
        // below the default confidence cutoff
        Detection::new(0.0, 40.0, 10.0, 59.0, 0.3, 0),
    ]);
    let summary = pipeline.run(&mut source, &mut sink, |_, _| {}).unwrap();

    assert_eq!(summary.frames_read, 5);
    assert_eq!(summary.frames_written, 5);
    assert_eq!(summary.detections, 10);
    assert_eq!(summary.max_track_id, Some(2));
    assert!(sink.finished);
    assert_eq!(sink.frames.len(), 5);
    assert_eq!(info.frame_rate, FrameRate::new(30000, 1001));
    for frame in &sink.frames {
        assert_eq!((frame.width, frame.height), (info.width, info.height));
        assert_eq!(frame.pixel(5, 5), Some(GREEN));
        assert_eq!(frame.pixel(40, 20), Some(BLUE));
        assert_eq!(frame.pixel(0, 40), Some([0, 0, 0]));
    }
}

#[test]
fn positional_pairing_matches_sort_output_order() {
    let detections = vec![
        Detection::new(5.0, 5.0, 25.0, 25.0, 0.95, 0),
        Detection::new(40.0, 20.0, 70.0, 55.0, 0.8, 1),
    ];
    let mut explicit = pipeline(detections.clone());
    let config = PipelineConfig {
        pairing: Pairing::Positional,
        ..PipelineConfig::default()
    };
    let mut positional = VideoPipeline::new(
        Fixed(detections),
        SortTracker::new(5, 2, 0.1),
        FrameAnnotator::new(Pairing::Positional).unwrap(),
        config,
    );

    // While every detection spawns or continues exactly one track, both
    // strategies agree.
    for mut frame in blank_frames(3, 80, 60) {
        let mut copy = frame.clone();
        let a = explicit.process_frame(&mut frame).unwrap();
        let b = positional.process_frame(&mut copy).unwrap();
        let ids_a: Vec<_> = a.labels.iter().map(|l| l.track_id).collect();
        let ids_b: Vec<_> = b.labels.iter().map(|l| l.track_id).collect();
        assert_eq!(ids_a, ids_b);
    }
}
