pub mod config;
pub mod dataset;
pub mod detection;
pub mod error;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod tracking;
pub mod training;
pub mod video;

// Typed failure kinds; everything else travels as `anyhow::Error`.
pub use anyhow::Result;
pub use error::Error;
