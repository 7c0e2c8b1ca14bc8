//! tracking — multi-object tracker contract + SORT reference tracker
//!
//! A `Tracker` is fed one frame's detections at a time, in frame order, and
//! answers with the tracks it currently reports. Track identity across frames
//! is entirely the tracker's business.
//!
//! `SortTracker` follows SORT (Bewley et al. 2016):
//!
//! State vector: [u, v, s, r, u̇, v̇, ṡ]ᵀ  (box centre, area, aspect ratio and
//!               the velocities of the first three; aspect is held constant)
//! Measurement:  [u, v, s, r]ᵀ
//!
//! Association is a maximum-IoU assignment (Hungarian) gated by
//! `iou_threshold`.

use anyhow::Result;
use nalgebra::{SMatrix, SVector};
use pathfinding::kuhn_munkres::kuhn_munkres;
use pathfinding::matrix::Matrix;
use tracing::{debug, trace};

use crate::detection::{BBox, Detection};
use crate::error::Error;

// ── Public types ──────────────────────────────────────────────────────────────

/// Tracker input: one detection without its class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub bbox: BBox,
    pub confidence: f32,
}

impl From<&Detection> for Observation {
    fn from(d: &Detection) -> Self {
        Self {
            bbox: d.bbox,
            confidence: d.confidence,
        }
    }
}

/// A reported track for the current frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackRecord {
    pub bbox: BBox,
    pub track_id: u64,
    /// Index into this frame's observation list of the detection that
    /// supported the track, if any.
    pub detection_index: Option<usize>,
}

/// A stateful multi-object tracker. One `update` per frame, in frame order.
pub trait Tracker {
    /// Associate `observations` with live tracks and return the tracks
    /// reported for this frame. The result length may differ from the input.
    fn update(&mut self, observations: &[Observation]) -> Result<Vec<TrackRecord>>;
}

impl<T: Tracker + ?Sized> Tracker for Box<T> {
    fn update(&mut self, observations: &[Observation]) -> Result<Vec<TrackRecord>> {
        (**self).update(observations)
    }
}

// ── Kalman filter ─────────────────────────────────────────────────────────────

type Matrix7 = SMatrix<f64, 7, 7>;
type Matrix4x7 = SMatrix<f64, 4, 7>;
type Matrix7x4 = SMatrix<f64, 7, 4>;
type Matrix4 = SMatrix<f64, 4, 4>;
type Vector7 = SVector<f64, 7>;
type Vector4 = SVector<f64, 4>;

/// Constant-velocity Kalman filter over a box in `[u, v, s, r]` space.
struct KalmanBoxFilter {
    x: Vector7,
    p: Matrix7,
    f: Matrix7,
    h: Matrix4x7,
    q: Matrix7,
    r: Matrix4,
}

impl KalmanBoxFilter {
    fn new(bbox: &BBox) -> Self {
        let mut f = Matrix7::identity();
        f[(0, 4)] = 1.0;
        f[(1, 5)] = 1.0;
        f[(2, 6)] = 1.0;

        let mut h = Matrix4x7::zeros();
        for i in 0..4 {
            h[(i, i)] = 1.0;
        }

        // Area and aspect are noisier than the centre.
        let mut r = Matrix4::identity();
        r[(2, 2)] = 10.0;
        r[(3, 3)] = 10.0;

        // Velocities start unobserved: give them a large covariance.
        let mut p = Matrix7::identity() * 10.0;
        for i in 4..7 {
            p[(i, i)] = 10_000.0;
        }

        let mut q = Matrix7::identity();
        q[(4, 4)] = 0.01;
        q[(5, 5)] = 0.01;
        q[(6, 6)] = 0.0001;

        let mut x = Vector7::zeros();
        x.fixed_rows_mut::<4>(0).copy_from(&bbox_to_z(bbox));

        Self { x, p, f, h, q, r }
    }

    /// Predict step: advance state one frame.
    fn predict(&mut self) {
        // Area must stay positive.
        if self.x[6] + self.x[2] <= 0.0 {
            self.x[6] = 0.0;
        }
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Update step: incorporate a new measured box.
    fn update(&mut self, bbox: &BBox) {
        let z = bbox_to_z(bbox);
        let y = z - self.h * self.x; // innovation
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix7x4 = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        // Joseph form keeps P symmetric positive semi-definite.
        let i_kh = Matrix7::identity() - k * self.h;
        self.p = i_kh * self.p * i_kh.transpose() + k * self.r * k.transpose();
    }

    fn bbox(&self) -> BBox {
        z_to_bbox(&self.x)
    }
}

fn bbox_to_z(b: &BBox) -> Vector4 {
    let w = b.width() as f64;
    let h = b.height() as f64;
    let u = b.x1 as f64 + w / 2.0;
    let v = b.y1 as f64 + h / 2.0;
    Vector4::new(u, v, w * h, w / h)
}

fn z_to_bbox(x: &Vector7) -> BBox {
    let w = (x[2] * x[3]).sqrt();
    let h = x[2] / w;
    BBox::new(
        (x[0] - w / 2.0) as f32,
        (x[1] - h / 2.0) as f32,
        (x[0] + w / 2.0) as f32,
        (x[1] + h / 2.0) as f32,
    )
}

// ── SORT ──────────────────────────────────────────────────────────────────────

struct SortTrack {
    id: u64,
    kalman: KalmanBoxFilter,
    time_since_update: u32,
    hit_streak: u32,
    hits: u32,
    age: u32,
    detection_index: Option<usize>,
}

impl SortTrack {
    fn new(id: u64, obs: &Observation, detection_index: usize) -> Self {
        Self {
            id,
            kalman: KalmanBoxFilter::new(&obs.bbox),
            time_since_update: 0,
            hit_streak: 0,
            hits: 0,
            age: 0,
            detection_index: Some(detection_index),
        }
    }

    fn predict(&mut self) -> BBox {
        self.kalman.predict();
        self.age += 1;
        if self.time_since_update > 0 {
            self.hit_streak = 0;
        }
        self.time_since_update += 1;
        self.detection_index = None;
        self.kalman.bbox()
    }

    fn correct(&mut self, obs: &Observation, detection_index: usize) {
        self.time_since_update = 0;
        self.hits += 1;
        self.hit_streak += 1;
        self.detection_index = Some(detection_index);
        self.kalman.update(&obs.bbox);
    }
}

/// SORT tracker: Kalman-predicted boxes + Hungarian IoU association.
pub struct SortTracker {
    max_age: u32,
    min_hits: u32,
    iou_threshold: f32,
    tracks: Vec<SortTrack>,
    frame_count: u64,
    next_id: u64,
}

impl SortTracker {
    pub fn new(max_age: u32, min_hits: u32, iou_threshold: f32) -> Self {
        Self {
            max_age,
            min_hits,
            iou_threshold,
            tracks: Vec::new(),
            frame_count: 0,
            next_id: 1,
        }
    }

    /// Number of tracks currently alive (reported or not).
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Drop all tracks and restart frame counting. Ids keep increasing.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.frame_count = 0;
    }

    fn is_reportable(&self, track: &SortTrack) -> bool {
        track.time_since_update < 1
            && (track.hit_streak >= self.min_hits || self.frame_count <= self.min_hits as u64)
    }
}

impl Tracker for SortTracker {
    fn update(&mut self, observations: &[Observation]) -> Result<Vec<TrackRecord>> {
        self.frame_count += 1;

        // Predict every track forward; drop the ones whose state blew up.
        let mut predicted = Vec::with_capacity(self.tracks.len());
        self.tracks.retain_mut(|t| {
            let b = t.predict();
            let finite = [b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite());
            if finite {
                predicted.push(b);
            }
            finite
        });

        let detections: Vec<BBox> = observations.iter().map(|o| o.bbox).collect();
        let assoc = associate(&detections, &predicted, self.iou_threshold)?;

        for &(det, trk) in &assoc.matches {
            self.tracks[trk].correct(&observations[det], det);
        }
        for &det in &assoc.unmatched_detections {
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(SortTrack::new(id, &observations[det], det));
        }

        // Report newest first, then retire tracks that aged out.
        let mut reported = Vec::new();
        for track in self.tracks.iter().rev() {
            if self.is_reportable(track) {
                reported.push(TrackRecord {
                    bbox: track.kalman.bbox(),
                    track_id: track.id,
                    detection_index: track.detection_index,
                });
            }
        }
        let max_age = self.max_age;
        self.tracks.retain(|t| {
            let alive = t.time_since_update <= max_age;
            if !alive {
                debug!(track_id = t.id, hits = t.hits, age = t.age, "track retired");
            }
            alive
        });

        debug!(
            frame = self.frame_count,
            observations = observations.len(),
            matched = assoc.matches.len(),
            live = self.tracks.len(),
            reported = reported.len(),
            "tracker updated"
        );
        Ok(reported)
    }
}

// ── Association ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Association {
    /// `(detection index, track index)`
    matches: Vec<(usize, usize)>,
    unmatched_detections: Vec<usize>,
    unmatched_tracks: Vec<usize>,
}

/// Scale for turning IoU into integer assignment weights.
const IOU_WEIGHT_SCALE: f64 = 1_000_000.0;

fn associate(detections: &[BBox], tracks: &[BBox], iou_threshold: f32) -> Result<Association> {
    if tracks.is_empty() || detections.is_empty() {
        return Ok(Association {
            matches: Vec::new(),
            unmatched_detections: (0..detections.len()).collect(),
            unmatched_tracks: (0..tracks.len()).collect(),
        });
    }

    let iou: Vec<Vec<f32>> = detections
        .iter()
        .map(|d| tracks.iter().map(|t| d.iou(t)).collect())
        .collect();

    let candidates = unique_pairs_above(&iou, iou_threshold)
        .map_or_else(|| hungarian(&iou), Ok)?;

    let mut assoc = Association::default();
    let mut det_used = vec![false; detections.len()];
    let mut trk_used = vec![false; tracks.len()];
    for (d, t) in candidates {
        if iou[d][t] < iou_threshold {
            continue;
        }
        det_used[d] = true;
        trk_used[t] = true;
        assoc.matches.push((d, t));
    }
    assoc.matches.sort_unstable();
    assoc.unmatched_detections = (0..detections.len()).filter(|&d| !det_used[d]).collect();
    assoc.unmatched_tracks = (0..tracks.len()).filter(|&t| !trk_used[t]).collect();

    trace!(?assoc, "association");
    Ok(assoc)
}

/// When every detection and every track has at most one partner above the
/// threshold the assignment is trivially those pairs.
fn unique_pairs_above(iou: &[Vec<f32>], iou_threshold: f32) -> Option<Vec<(usize, usize)>> {
    let cols = iou.first().map_or(0, Vec::len);
    let mut col_hits = vec![0usize; cols];
    let mut pairs = Vec::new();
    for (d, row) in iou.iter().enumerate() {
        let mut row_hits = 0;
        for (t, &v) in row.iter().enumerate() {
            if v > iou_threshold {
                row_hits += 1;
                col_hits[t] += 1;
                pairs.push((d, t));
            }
        }
        if row_hits > 1 {
            return None;
        }
    }
    if col_hits.iter().any(|&c| c > 1) {
        return None;
    }
    Some(pairs)
}

/// Maximum-IoU assignment over a detection × track matrix.
fn hungarian(iou: &[Vec<f32>]) -> Result<Vec<(usize, usize)>> {
    let rows = iou.len();
    let cols = iou.first().map_or(0, Vec::len);
    let weight = |v: f32| (v as f64 * IOU_WEIGHT_SCALE).round() as i64;

    // kuhn_munkres needs rows <= columns.
    let transposed = rows > cols;
    let (r, c) = if transposed { (cols, rows) } else { (rows, cols) };
    let mut weights = Vec::with_capacity(r * c);
    for i in 0..r {
        for j in 0..c {
            let v = if transposed { iou[j][i] } else { iou[i][j] };
            weights.push(weight(v));
        }
    }
    let matrix = Matrix::from_vec(r, c, weights).map_err(|e| Error::Tracker(e.to_string()))?;
    let (_, assignment) = kuhn_munkres(&matrix);

    Ok(assignment
        .into_iter()
        .enumerate()
        .map(|(i, j)| if transposed { (j, i) } else { (i, j) })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearly_eq::assert_nearly_eq;

    fn obs(x1: f32, y1: f32, x2: f32, y2: f32) -> Observation {
        Observation {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence: 0.9,
        }
    }

    #[test]
    fn z_round_trip_preserves_box() {
        let b = BBox::new(10.0, 20.0, 50.0, 100.0);
        let mut x = Vector7::zeros();
        x.fixed_rows_mut::<4>(0).copy_from(&bbox_to_z(&b));
        let back = z_to_bbox(&x);
        assert_nearly_eq!(back.x1, b.x1, 1e-4);
        assert_nearly_eq!(back.y1, b.y1, 1e-4);
        assert_nearly_eq!(back.x2, b.x2, 1e-4);
        assert_nearly_eq!(back.y2, b.y2, 1e-4);
    }

    #[test]
    fn static_box_keeps_its_id() {
        let mut tracker = SortTracker::new(5, 2, 0.1);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let tracks = tracker.update(&[obs(10.0, 10.0, 50.0, 50.0)]).unwrap();
            assert_eq!(tracks.len(), 1);
            assert_eq!(tracks[0].detection_index, Some(0));
            assert_nearly_eq!(tracks[0].bbox.x1, 10.0, 0.5);
            assert_nearly_eq!(tracks[0].bbox.y2, 50.0, 0.5);
            ids.push(tracks[0].track_id);
        }
        assert!(ids.iter().all(|&id| id == 1));
    }

    #[test]
    fn new_tracks_wait_for_min_hits_after_warmup() {
        let mut tracker = SortTracker::new(5, 2, 0.1);
        let a = obs(0.0, 0.0, 20.0, 20.0);
        let b = obs(100.0, 100.0, 140.0, 140.0);
        for _ in 0..3 {
            tracker.update(&[a]).unwrap();
        }
        // frame 4: b is born, hit_streak 0
        let t = tracker.update(&[a, b]).unwrap();
        assert_eq!(t.len(), 1);
        // frame 5: hit_streak 1
        let t = tracker.update(&[a, b]).unwrap();
        assert_eq!(t.len(), 1);
        // frame 6: hit_streak 2
        let t = tracker.update(&[a, b]).unwrap();
        assert_eq!(t.len(), 2);
        let b_track = t.iter().find(|r| r.detection_index == Some(1)).unwrap();
        assert_eq!(b_track.track_id, 2);
    }

    #[test]
    fn output_is_newest_track_first() {
        let mut tracker = SortTracker::new(5, 2, 0.1);
        let t = tracker
            .update(&[obs(0.0, 0.0, 20.0, 20.0), obs(100.0, 0.0, 120.0, 20.0)])
            .unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].track_id, 2);
        assert_eq!(t[0].detection_index, Some(1));
        assert_eq!(t[1].track_id, 1);
        assert_eq!(t[1].detection_index, Some(0));
    }

    #[test]
    fn tracks_die_after_max_age() {
        let mut tracker = SortTracker::new(1, 1, 0.1);
        let a = obs(10.0, 10.0, 50.0, 50.0);
        assert_eq!(tracker.update(&[a]).unwrap()[0].track_id, 1);
        assert_eq!(tracker.update(&[a]).unwrap()[0].track_id, 1);

        // unsupported: not reported, kept while time_since_update <= max_age
        assert!(tracker.update(&[]).unwrap().is_empty());
        assert_eq!(tracker.live_tracks(), 1);
        assert!(tracker.update(&[]).unwrap().is_empty());
        assert_eq!(tracker.live_tracks(), 0);

        // reborn past warm-up: needs min_hits supporting frames again
        assert!(tracker.update(&[a]).unwrap().is_empty());
        let t = tracker.update(&[a]).unwrap();
        assert_eq!(t[0].track_id, 2);
    }

    #[test]
    fn low_overlap_spawns_a_new_track() {
        let mut tracker = SortTracker::new(5, 2, 0.3);
        tracker.update(&[obs(0.0, 0.0, 10.0, 10.0)]).unwrap();
        let t = tracker.update(&[obs(8.0, 8.0, 18.0, 18.0)]).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].track_id, 2);
        assert_eq!(tracker.live_tracks(), 2);
    }

    #[test]
    fn reset_clears_tracks_but_not_ids() {
        let mut tracker = SortTracker::new(5, 2, 0.1);
        tracker.update(&[obs(0.0, 0.0, 10.0, 10.0)]).unwrap();
        tracker.reset();
        assert_eq!(tracker.live_tracks(), 0);
        let t = tracker.update(&[obs(0.0, 0.0, 10.0, 10.0)]).unwrap();
        assert_eq!(t[0].track_id, 2);
    }

    #[test]
    fn hungarian_resolves_competing_pairs() {
        // det 0 overlaps both tracks; det 1 only track 0. Best total pairs
        // det 0 → track 1 and det 1 → track 0.
        let iou = vec![vec![0.6, 0.5], vec![0.55, 0.0]];
        assert!(unique_pairs_above(&iou, 0.1).is_none());
        let mut pairs = hungarian(&iou).unwrap();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn hungarian_handles_more_detections_than_tracks() {
        let iou = vec![vec![0.1], vec![0.9], vec![0.3]];
        assert_eq!(hungarian(&iou).unwrap(), vec![(1, 0)]);
    }

    #[test]
    fn association_gates_on_threshold() {
        let dets = [BBox::new(0.0, 0.0, 10.0, 10.0), BBox::new(50.0, 50.0, 60.0, 60.0)];
        let trks = [BBox::new(1.0, 1.0, 11.0, 11.0)];
        let a = associate(&dets, &trks, 0.3).unwrap();
        assert_eq!(a.matches, vec![(0, 0)]);
        assert_eq!(a.unmatched_detections, vec![1]);
        assert!(a.unmatched_tracks.is_empty());

        let a = associate(&dets, &[], 0.3).unwrap();
        assert_eq!(a.unmatched_detections, vec![0, 1]);
    }
}
