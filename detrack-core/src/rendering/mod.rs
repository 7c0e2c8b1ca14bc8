//! rendering — burn detections and track ids into a frame
//!
//! Every detection gets a 2-px rectangle in its class colour and a label
//! `conf: 0.90, class: 1, id: 3` just above the box. All coordinates are
//! clamped to the frame, so boxes hanging off the edge are drawn cut off
//! rather than rejected.

use std::collections::HashMap;
use std::path::Path;

use ab_glyph::{FontArc, FontVec};
use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::config::Pairing;
use crate::detection::Detection;
use crate::error::Error;
use crate::tracking::TrackRecord;
use crate::video::RgbFrame;

/// Rectangle stroke width in pixels.
const BOX_THICKNESS: i32 = 2;
/// Gap between the label baseline and the top edge of the box.
const LABEL_OFFSET: i32 = 10;
/// Label glyph height in pixels.
const LABEL_SCALE: f32 = 16.0;

/// Default label face (DejaVu Sans Mono, see `assets/font/LICENSE`).
const BUNDLED_FONT: &[u8] = include_bytes!("../../assets/font/DejaVuSansMono.ttf");

/// Colour for a class id: class 1 is blue, everything else green.
pub fn class_color(class_id: u32) -> [u8; 3] {
    if class_id == 1 {
        [0, 0, 255]
    } else {
        [0, 255, 0]
    }
}

/// A label drawn for one detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    /// Top-left corner of the text, in frame pixels.
    pub x: i32,
    pub y: i32,
    pub color: [u8; 3],
    pub confidence: f32,
    pub class_id: u32,
    pub track_id: Option<u64>,
}

pub fn label_text(confidence: f32, class_id: u32, track_id: Option<u64>) -> String {
    match track_id {
        Some(id) => format!("conf: {confidence:.2}, class: {class_id}, id: {id}"),
        None => format!("conf: {confidence:.2}, class: {class_id}, id: -"),
    }
}

/// Find the track id for each detection.
///
/// `detections` must be in the order they were handed to the tracker.
pub fn pair_tracks(
    detections: &[Detection],
    tracks: &[TrackRecord],
    pairing: Pairing,
) -> Vec<Option<u64>> {
    match pairing {
        Pairing::Explicit => {
            let by_index: HashMap<usize, u64> = tracks
                .iter()
                .filter_map(|t| t.detection_index.map(|i| (i, t.track_id)))
                .collect();
            (0..detections.len())
                .map(|i| by_index.get(&i).copied())
                .collect()
        }
        Pairing::Positional => {
            let reversed: Vec<u64> = tracks.iter().rev().map(|t| t.track_id).collect();
            (0..detections.len())
                .map(|i| reversed.get(i).copied())
                .collect()
        }
    }
}

/// Draws boxes and labels onto frames.
pub struct FrameAnnotator {
    font: FontArc,
    pairing: Pairing,
}

impl FrameAnnotator {
    /// Annotator using the bundled label font.
    pub fn new(pairing: Pairing) -> Result<Self> {
        let font =
            FontArc::try_from_slice(BUNDLED_FONT).context("bundled label font is unreadable")?;
        Ok(Self { font, pairing })
    }

    pub fn with_font<P: AsRef<Path>>(font_path: P, pairing: Pairing) -> Result<Self> {
        let path = font_path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| anyhow::anyhow!("invalid font {}: {e}", path.display()))?;
        debug!(path = %path.display(), "label font loaded");
        Ok(Self {
            font: FontArc::new(font),
            pairing,
        })
    }

    /// Custom font when one is given and loads, the bundled one otherwise.
    pub fn from_font_path(font_path: Option<&Path>, pairing: Pairing) -> Result<Self> {
        match font_path {
            Some(path) => match Self::with_font(path, pairing) {
                Ok(annotator) => Ok(annotator),
                Err(e) => {
                    warn!("label font unavailable, using the bundled one: {e:#}");
                    Self::new(pairing)
                }
            },
            None => Self::new(pairing),
        }
    }

    /// Draw every detection with its paired track id onto `frame` in place
    /// and return the labels, one per detection, in detection order.
    pub fn annotate(
        &self,
        frame: &mut RgbFrame,
        detections: &[Detection],
        tracks: &[TrackRecord],
    ) -> Result<Vec<Label>> {
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.data.len() != expected {
            return Err(anyhow::anyhow!(
                "frame buffer is {} bytes, expected {expected} for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            ));
        }
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }

        let track_ids = pair_tracks(detections, tracks, self.pairing);

        // Borrow the buffer for drawing and hand it back afterwards.
        let mut img: RgbImage =
            ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
                .context("frame buffer does not match its dimensions")?;

        let mut labels = Vec::with_capacity(detections.len());
        let mut boxes = Vec::with_capacity(detections.len());
        for (det, track_id) in detections.iter().zip(track_ids) {
            let color = class_color(det.class_id);
            let b = det.bbox;
            let (x1, y1) = clamp_point(b.x1, b.y1, frame.width, frame.height);
            let (x2, y2) = clamp_point(b.x2, b.y2, frame.width, frame.height);
            boxes.push(((x1, y1), (x2, y2), Rgb(color)));

            let text = label_text(det.confidence, det.class_id, track_id);
            let (lx, ly) = self.place_label(&text, x1, y1, frame.width);
            draw_text_mut(&mut img, Rgb(color), lx, ly, LABEL_SCALE, &self.font, &text);

            labels.push(Label {
                text,
                x: lx,
                y: ly,
                color,
                confidence: det.confidence,
                class_id: det.class_id,
                track_id,
            });
        }

        // Boxes go on top so a clamped label never eats into a stroke.
        for (top_left, bottom_right, color) in boxes {
            draw_box(&mut img, top_left, bottom_right, color);
        }

        frame.data = img.into_raw();
        Ok(labels)
    }

    /// Top-left corner for a label whose baseline sits `LABEL_OFFSET` px
    /// above the box, kept inside the frame.
    fn place_label(&self, text: &str, x1: i32, y1: i32, frame_width: u32) -> (i32, i32) {
        let (w, h) = text_size(LABEL_SCALE, &self.font, text);
        let max_x = (frame_width as i32 - w as i32).max(0);
        let x = x1.clamp(0, max_x);
        let y = (y1 - LABEL_OFFSET - h as i32).max(0);
        (x, y)
    }
}

fn clamp_point(x: f32, y: f32, width: u32, height: u32) -> (i32, i32) {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    let x = if x.is_finite() { x.clamp(0.0, max_x) } else { 0.0 };
    let y = if y.is_finite() { y.clamp(0.0, max_y) } else { 0.0 };
    (x as i32, y as i32)
}

/// Hollow rectangle with corners `(x1, y1)` and `(x2, y2)` inclusive, stroked
/// inwards `BOX_THICKNESS` px.
fn draw_box(img: &mut RgbImage, (x1, y1): (i32, i32), (x2, y2): (i32, i32), color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let (ax, ay) = (x1 + inset, y1 + inset);
        let (bx, by) = (x2 - inset, y2 - inset);
        if bx < ax || by < ay {
            break;
        }
        let rect = Rect::at(ax, ay).of_size((bx - ax + 1) as u32, (by - ay + 1) as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    const BLUE: [u8; 3] = [0, 0, 255];
    const GREEN: [u8; 3] = [0, 255, 0];

    fn track(id: u64, idx: Option<usize>) -> TrackRecord {
        TrackRecord {
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            track_id: id,
            detection_index: idx,
        }
    }

    #[test]
    fn class_one_is_blue_others_green() {
        assert_eq!(class_color(1), BLUE);
        assert_eq!(class_color(0), GREEN);
        assert_eq!(class_color(7), GREEN);
    }

    #[test]
    fn label_format() {
        assert_eq!(label_text(0.904, 1, Some(3)), "conf: 0.90, class: 1, id: 3");
        assert_eq!(label_text(0.5, 0, None), "conf: 0.50, class: 0, id: -");
    }

    #[test]
    fn explicit_pairing_uses_detection_index() {
        let dets = vec![
            Detection::new(0.0, 0.0, 5.0, 5.0, 0.3, 0),
            Detection::new(10.0, 0.0, 15.0, 5.0, 0.8, 0),
            Detection::new(20.0, 0.0, 25.0, 5.0, 0.9, 0),
        ];
        let tracks = vec![track(7, Some(2)), track(4, Some(0))];
        assert_eq!(
            pair_tracks(&dets, &tracks, Pairing::Explicit),
            vec![Some(4), None, Some(7)]
        );
    }

    #[test]
    fn positional_pairing_reverses_tracks() {
        let dets = vec![
            Detection::new(0.0, 0.0, 5.0, 5.0, 0.3, 0),
            Detection::new(10.0, 0.0, 15.0, 5.0, 0.8, 0),
            Detection::new(20.0, 0.0, 25.0, 5.0, 0.9, 0),
        ];
        let tracks = vec![track(3, None), track(2, None), track(1, None)];
        assert_eq!(
            pair_tracks(&dets, &tracks, Pairing::Positional),
            vec![Some(1), Some(2), Some(3)]
        );
        // fewer tracks than detections: trailing detections go unpaired
        assert_eq!(
            pair_tracks(&dets, &tracks[..1], Pairing::Positional),
            vec![Some(3), None, None]
        );
    }

    #[test]
    fn one_label_per_detection_with_paired_values() {
        let annotator = FrameAnnotator::new(Pairing::Explicit).unwrap();
        let mut frame = RgbFrame::new(120, 80, 0);
        let dets = vec![
            Detection::new(10.0, 20.0, 30.0, 40.0, 0.71, 0),
            Detection::new(50.0, 20.0, 90.0, 60.0, 0.93, 1),
        ];
        let tracks = vec![track(2, Some(1)), track(1, Some(0))];
        let labels = annotator.annotate(&mut frame, &dets, &tracks).unwrap();

        assert_eq!(labels.len(), 2);
        assert!((labels[0].confidence - 0.71).abs() <= 0.01);
        assert_eq!(labels[0].class_id, 0);
        assert_eq!(labels[0].track_id, Some(1));
        assert_eq!(labels[0].text, "conf: 0.71, class: 0, id: 1");
        assert_eq!(labels[1].track_id, Some(2));
        assert_eq!(labels[1].color, BLUE);
    }

    #[test]
    fn box_is_drawn_at_its_corners() {
        let annotator = FrameAnnotator::new(Pairing::Explicit).unwrap();
        let mut frame = RgbFrame::new(64, 64, 0);
        let dets = vec![Detection::new(10.0, 10.0, 50.0, 50.0, 0.9, 1)];
        annotator.annotate(&mut frame, &dets, &[]).unwrap();

        assert_eq!(frame.pixel(10, 10), Some(BLUE));
        assert_eq!(frame.pixel(50, 50), Some(BLUE));
        assert_eq!(frame.pixel(11, 30), Some(BLUE)); // second stroke
        assert_eq!(frame.pixel(30, 30), Some([0, 0, 0]));
        assert_eq!(frame.pixel(9, 30), Some([0, 0, 0]));
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let annotator = FrameAnnotator::new(Pairing::Explicit).unwrap();
        let mut frame = RgbFrame::new(32, 24, 0);
        let dets = vec![
            Detection::new(-20.0, -5.0, 100.0, 100.0, 0.8, 0),
            Detection::new(f32::NAN, 3.0, 10.0, 10.0, 0.8, 0),
        ];
        let labels = annotator.annotate(&mut frame, &dets, &[]).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(frame.pixel(0, 0), Some(GREEN));
        assert_eq!(frame.pixel(31, 23), Some(GREEN));
        assert!(labels.iter().all(|l| l.x >= 0 && l.y >= 0));
    }

    #[test]
    fn mismatched_buffer_is_an_error() {
        let annotator = FrameAnnotator::new(Pairing::Explicit).unwrap();
        let mut frame = RgbFrame::new(4, 4, 0);
        frame.data.truncate(10);
        assert!(annotator.annotate(&mut frame, &[], &[]).is_err());
    }

    #[test]
    fn missing_font_falls_back_to_bundled() {
        let annotator =
            FrameAnnotator::from_font_path(Some(Path::new("/no/such/font.ttf")), Pairing::Explicit)
                .unwrap();
        let mut frame = RgbFrame::new(160, 80, 0);
        let dets = vec![Detection::new(10.0, 40.0, 60.0, 70.0, 0.9, 0)];
        annotator.annotate(&mut frame, &dets, &[]).unwrap();
        assert!(lit_pixels(&frame, 0..38, 0..160) > 0);
        assert!(FrameAnnotator::with_font("/no/such/font.ttf", Pairing::Explicit).is_err());
    }

    /// Non-black pixels in a region. Glyph edges are blended, so colour is
    /// not compared exactly.
    fn lit_pixels(frame: &RgbFrame, rows: std::ops::Range<u32>, cols: std::ops::Range<u32>) -> usize {
        rows.flat_map(|y| cols.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| frame.pixel(x, y).is_some_and(|p| p != [0, 0, 0]))
            .count()
    }

    #[test]
    fn label_glyphs_are_drawn_above_the_box() {
        let annotator = FrameAnnotator::new(Pairing::Explicit).unwrap();
        let mut frame = RgbFrame::new(200, 120, 0);
        let dets = vec![Detection::new(40.0, 50.0, 120.0, 110.0, 0.9, 1)];
        let labels = annotator
            .annotate(&mut frame, &dets, &[track(7, Some(0))])
            .unwrap();

        assert_eq!(labels[0].text, "conf: 0.90, class: 1, id: 7");
        assert!(labels[0].y < 40);
        // everything above the box's top stroke is text
        assert!(lit_pixels(&frame, 0..48, 0..200) > 20);
        // blue-only ink, never the green channel
        assert!((0..48)
            .flat_map(|y| (0..200).map(move |x| (x, y)))
            .all(|(x, y)| frame.pixel(x, y).is_some_and(|p| p[1] == 0)));
        // the box interior stays untouched
        assert_eq!(lit_pixels(&frame, 53..108, 43..118), 0);
    }

    #[test]
    fn no_detections_leaves_frame_black() {
        let annotator = FrameAnnotator::new(Pairing::Explicit).unwrap();
        let mut frame = RgbFrame::new(50, 40, 0);
        annotator.annotate(&mut frame, &[], &[]).unwrap();
        assert!(frame.data.iter().all(|&b| b == 0));
    }
}
