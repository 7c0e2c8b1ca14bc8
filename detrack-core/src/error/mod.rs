use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds the core surfaces to callers.
///
/// Most internal plumbing uses `anyhow` with context; these variants mark the
/// cases callers are expected to tell apart (e.g. a missing model vs. a
/// broken input file).
#[derive(Debug, Error)]
pub enum Error {
    #[error("path not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("could not open input {}: {reason}", path.display())]
    InputUnavailable { path: PathBuf, reason: String },
    #[error("detection model unavailable ({}): {reason}", path.display())]
    ModelUnavailable { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("encoder error: {0}")]
    Encode(String),
    #[error("training failed: {0}")]
    Training(String),
}
