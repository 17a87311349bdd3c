// error.rs — Crate-wide error type.
//
// Only setup-time operations fail: loading/validating configuration,
// creating a tracker, building an anchor set. Per-frame updates never
// return errors; a bad match becomes a state change instead.

use thiserror::Error;

/// Errors returned by fallible `patchtrack` operations.
#[derive(Debug, Error)]
pub enum TrackError {
    /// A pixel buffer's length does not match its declared dimensions.
    #[error("buffer length {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A template window centered at (x, y) would leave the frame.
    #[error("{size}x{size} template at ({x:.1}, {y:.1}) extends beyond the frame")]
    TemplateOutOfBounds { x: f32, y: f32, size: usize },

    /// The engine already holds its maximum number of trackers.
    #[error("tracker limit reached ({max})")]
    TooManyTrackers { max: usize },

    /// No tracker with this id is active.
    #[error("unknown tracker id {0}")]
    UnknownTracker(u32),

    /// Too few usable anchors around the designated point.
    #[error("found {found} anchors, at least {required} required")]
    InsufficientAnchors { found: usize, required: usize },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrackError>;
