//! detection — object detector contract + YOLOv8 ONNX adapter
//!
//! A `Detector` turns a frame into boxes with confidences and class ids,
//! after class-agnostic NMS. The pipeline owns one detector and never looks
//! inside it, so any backend can be injected.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// Default YOLOv8 input size (square).
pub const DEFAULT_INPUT_SIZE: u32 = 640;
/// Box coordinates preceding the class scores in each YOLOv8 proposal.
const BOX_ROWS: usize = 4;

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in pixel coordinates of the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter / union
    }

    /// Clamp to `[0, width] × [0, height]`.
    pub fn clamped(&self, width: u32, height: u32) -> BBox {
        let (w, h) = (width as f32, height as f32);
        BBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One candidate object in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence,
            class_id,
        }
    }
}

/// A detection backend.
///
/// Implementations apply class-agnostic NMS at `iou_threshold` and drop
/// detections below `confidence_threshold`. The returned order is
/// unspecified.
pub trait Detector {
    fn detect(
        &mut self,
        frame: &RgbFrame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(
        &mut self,
        frame: &RgbFrame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>> {
        (**self).detect(frame, confidence_threshold, iou_threshold)
    }
}

// ── YOLOv8 ───────────────────────────────────────────────────────────────────

/// Wraps a YOLOv8 detection ONNX session (`images` → `output0`).
///
/// `output0` is `[1, 4 + num_classes, num_proposals]`, each column holding
/// `cx, cy, w, h` in input-size pixels followed by per-class scores.
pub struct YoloDetector {
    session: Session,
    input_size: u32,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl YoloDetector {
    /// Load a YOLOv8 ONNX model from `model_path` with the default 640×640 input.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::load_with_input_size(model_path, DEFAULT_INPUT_SIZE)
    }

    pub fn load_with_input_size<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let path = model_path.as_ref();
        if !path.is_file() {
            return Err(model_unavailable(path, "model file does not exist"));
        }
        let session = build_ort_session(path).map_err(|e| model_unavailable(path, e))?;
        debug!(path = %path.display(), input_size, "YOLO session ready");
        Ok(Self {
            session,
            input_size,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (input_size * input_size * 3) as usize],
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let size = self.input_size;
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            size,
            size,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize YOLO downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, S, S].
        let plane = (size * size) as usize;
        let mut tensor_data = vec![0f32; 3 * plane];

        let (r_plane, gb_plane) = tensor_data.split_at_mut(plane);
        let (g_plane, b_plane) = gb_plane.split_at_mut(plane);
        rayon::join(
            || fill_plane(r_plane, raw, 0),
            || rayon::join(|| fill_plane(g_plane, raw, 1), || fill_plane(b_plane, raw, 2)),
        );

        let shape = [1usize, 3, size as usize, size as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

impl Detector for YoloDetector {
    fn detect(
        &mut self,
        frame: &RgbFrame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let input_tensor = self.preprocess(frame)?;
        let input_size = self.input_size as f32;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("YOLOv8 inference failed")?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLOv8 output tensor")?;

        if shape.len() != 3 || shape[1] <= BOX_ROWS as i64 {
            return Err(anyhow::anyhow!(
                "unexpected YOLOv8 output shape {:?}",
                &shape[..]
            ));
        }
        let num_classes = shape[1] as usize - BOX_ROWS;
        let num_proposals = shape[2] as usize;

        let candidates = decode_proposals(
            data,
            num_classes,
            num_proposals,
            (
                frame.width as f32 / input_size,
                frame.height as f32 / input_size,
            ),
            (frame.width, frame.height),
            confidence_threshold,
        );
        let kept = nms(candidates, iou_threshold);
        debug!(detections = kept.len(), pts = frame.pts, "frame detected");
        Ok(kept)
    }
}

// ── Pre/post-processing helpers ──────────────────────────────────────────────

fn fill_plane(plane: &mut [f32], raw: &[u8], channel: usize) {
    plane
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, out)| *out = raw[idx * 3 + channel] as f32 / 255.0);
}

/// Turn the column-major YOLOv8 output into frame-space detections above
/// `confidence_threshold`, one per proposal (best class wins).
fn decode_proposals(
    data: &[f32],
    num_classes: usize,
    num_proposals: usize,
    (scale_x, scale_y): (f32, f32),
    (frame_w, frame_h): (u32, u32),
    confidence_threshold: f32,
) -> Vec<Detection> {
    (0..num_proposals)
        .into_par_iter()
        .filter_map(|i| {
            let cx = data[i];
            let cy = data[num_proposals + i];
            let w = data[2 * num_proposals + i];
            let h = data[3 * num_proposals + i];

            let (class_id, score) = (0..num_classes)
                .map(|c| (c, data[(BOX_ROWS + c) * num_proposals + i]))
                .fold((0usize, f32::MIN), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });

            if score < confidence_threshold {
                return None;
            }

            // Convert YOLO (cx,cy,w,h) in input space → (x1,y1,x2,y2) in frame space
            let bbox = BBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            )
            .clamped(frame_w, frame_h);

            if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
                return None;
            }

            Some(Detection {
                bbox,
                confidence: score,
                class_id: class_id as u32,
            })
        })
        .collect()
}

fn build_ort_session(model_path: &Path) -> ort::Result<Session> {
    let mut builder = Session::builder()?;
    builder = builder.with_intra_threads(rayon::current_num_threads())?;
    #[cfg(feature = "cuda")]
    {
        builder = builder.with_execution_providers([
            ort::execution_providers::CUDAExecutionProvider::default().build(),
        ])?;
    }
    builder.commit_from_file(model_path)
}

fn model_unavailable(path: &Path, reason: impl ToString) -> anyhow::Error {
    Error::ModelUnavailable {
        path: PathBuf::from(path),
        reason: reason.to_string(),
    }
    .into()
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy class-agnostic NMS: sort by confidence descending, suppress boxes
/// overlapping a kept box by more than `iou_thresh`.
pub fn nms(mut boxes: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].bbox.iou(&boxes[j].bbox) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}
