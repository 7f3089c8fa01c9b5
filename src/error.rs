//! Error types for the compile pipeline.
//!
//! Fatal preconditions (no input, no usable reference region) get their own
//! variants so the diagnostic names the failed precondition. Per-item
//! conditions (a single unreadable frame, a single misaligned timepoint) are
//! NOT errors at this level — they are recorded in the metadata table or the
//! drift report and the run continues.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no input frames found under {}", dir.display())]
    NoInputFrames { dir: PathBuf },

    #[error(
        "no trap region accepted in the reference frame of fov {fov} \
         (area > {area_threshold}, {width}x{height} px within {tolerance} px)"
    )]
    NoAcceptedTraps {
        fov: u32,
        area_threshold: usize,
        width: usize,
        height: usize,
        tolerance: usize,
    },

    #[error("no trap region of fov {fov} admits an in-bounds {side}x{side} alignment crop")]
    NoAnchorRegion { fov: u32, side: usize },

    #[error("segmentation strategy selected but no model was provided")]
    ModelRequired,

    #[error("failed to load model {}: {message}", path.display())]
    ModelLoad { path: PathBuf, message: String },

    #[error("model inference failed: {message}")]
    Model { message: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {}: {source}", path.display())]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("failed to encode {}: {source}", path.display())]
    TiffWrite {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialize {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("plane index {index} out of range: frame has {available} plane(s)")]
    PlaneIndex { index: usize, available: usize },

    #[error("container sink error: {message}")]
    Container { message: String },

    #[error("failed to build worker pool: {message}")]
    Pool { message: String },

    #[error("{message}")]
    InvalidGeometry { message: String },
}

impl CompileError {
    /// Wrap an opaque model-backend error.
    pub fn model<E: std::fmt::Display>(err: E) -> Self {
        Self::Model {
            message: err.to_string(),
        }
    }

    /// Wrap an opaque container-backend error.
    pub fn container<E: std::fmt::Display>(err: E) -> Self {
        Self::Container {
            message: err.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
