//! config — runtime knobs for the detect → track → annotate pipeline
//!
//! Values can come from a YAML file (`PipelineConfig::load`) and are then
//! overridden field by field from the command line.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Detector confidence cutoff.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
/// Detector NMS overlap cutoff.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
/// Frames a track survives without a supporting detection.
pub const DEFAULT_TRACKER_MAX_AGE: u32 = 5;
/// Supporting detections required before a track is reported.
pub const DEFAULT_TRACKER_MIN_HITS: u32 = 2;
/// Minimum IoU for a detection to be associated with an existing track.
pub const DEFAULT_TRACKER_IOU_THRESHOLD: f32 = 0.1;

/// How a detection finds the track id drawn in its label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pairing {
    /// Use the detection index reported by the tracker.
    #[default]
    Explicit,
    /// Reverse the tracker output and zip it with the ascending-confidence
    /// detection list. Only correct for trackers that emit exactly one track
    /// per detection in reverse input order.
    Positional,
}

impl std::str::FromStr for Pairing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "explicit" => Ok(Self::Explicit),
            "positional" => Ok(Self::Positional),
            other => Err(Error::InvalidConfig(format!(
                "unknown pairing `{other}` (expected `explicit` or `positional`)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub tracker_max_age: u32,
    pub tracker_min_hits: u32,
    pub tracker_iou_threshold: f32,
    pub pairing: Pairing,
    /// TrueType/OpenType font for label text. The bundled DejaVu Sans Mono is
    /// used when unset or unreadable.
    pub font_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            tracker_max_age: DEFAULT_TRACKER_MAX_AGE,
            tracker_min_hits: DEFAULT_TRACKER_MIN_HITS,
            tracker_iou_threshold: DEFAULT_TRACKER_IOU_THRESHOLD,
            pairing: Pairing::default(),
            font_path: None,
        }
    }
}

impl PipelineConfig {
    /// Read a YAML config file. Missing fields fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open config {}", path.display()))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        check_unit("confidence_threshold", self.confidence_threshold)?;
        check_unit("iou_threshold", self.iou_threshold)?;
        check_unit("tracker_iou_threshold", self.tracker_iou_threshold)?;
        if self.tracker_min_hits == 0 {
            return Err(Error::InvalidConfig(
                "tracker_min_hits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<(), Error> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}
