// patchtrack: frame-synchronous template-matching point tracker
//
// Per frame, every tracked point is predicted from its velocity, matched by
// exhaustive SAD search, scored, classified (tracking / occluded / lost)
// and smoothed. Optional detector boxes are fused in by id lock or
// proximity, and can re-acquire lost points. One tracker can be refined
// by a rigid constellation of NCC-tracked anchors.
//
// Pipeline:  RGBA → luma → engine → [tracker + fusion] → anchors → report

pub mod image;
pub mod luma;
pub mod convolution;
pub mod gradient;
pub mod harris;
pub mod nms;

pub mod template;
pub mod search;
pub mod ncc;

pub mod config;
pub mod detection;
pub mod error;
pub mod tracker;
pub mod fusion;
pub mod anchor;
pub mod engine;

pub use config::{AnchorConfig, EngineConfig, FusionConfig, Profile, TrackingConfig};
pub use detection::{BoundingBox, Detection};
pub use engine::{FrameReport, StateChange, TrackerEngine};
pub use error::{Result, TrackError};
pub use image::Image;
pub use tracker::{TrackState, Tracker, TrackerId};
