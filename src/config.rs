// config.rs — Tracking, fusion and anchor configuration.
//
// `TrackingConfig` is derived from one of three profiles that trade search
// radius and resolution for frame-rate headroom:
//
//   precision   — wide, fine search; large templates; 4 trackers
//   balanced    — the default
//   performance — narrow, coarse search; small templates; 6 trackers
//
// A session's configuration is immutable once the engine is built. It can
// be loaded from YAML:
//
//   profile: precision
//   tracking:
//     search_radius: 56
//   fusion:
//     detector_dominant: true
//
// Sections that are omitted keep their defaults; `tracking` fields override
// the selected profile field by field.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};
use crate::search::SearchParams;
use crate::template::MIN_TEMPLATE_SIZE;

/// Built-in tracking profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Precision,
    #[default]
    Balanced,
    Performance,
}

impl FromStr for Profile {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "precision" => Ok(Profile::Precision),
            "balanced" => Ok(Profile::Balanced),
            "performance" => Ok(Profile::Performance),
            other => Err(TrackError::InvalidConfig(format!("unknown profile '{other}'"))),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Profile::Precision => "precision",
            Profile::Balanced => "balanced",
            Profile::Performance => "performance",
        })
    }
}

/// Per-session template tracking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Base coarse search half-width in pixels.
    pub search_radius: usize,
    /// Coarse search step in pixels.
    pub search_step: usize,
    /// Refinement half-width (step 1) around the coarse winner.
    pub refine_radius: usize,
    /// Template side length. Odd, ≥ 15.
    pub template_size: usize,
    /// Fraction of the way moved toward the matched position each frame.
    pub position_smoothing: f32,
    /// Fraction of the way moved toward the new displacement each frame.
    pub velocity_smoothing: f32,
    /// Position smoothing while lost.
    pub lost_smoothing: f32,
    /// SAD score above which a match counts as occluded.
    pub occluded_threshold: f32,
    /// SAD score above which a match counts as lost.
    pub lost_threshold: f32,
    /// Template blend weight for a refresh.
    pub template_update_rate: f32,
    /// Minimum smoothed confidence (0–100) before the template may refresh.
    pub min_confidence_for_update: u8,
    /// Trail samples kept per tracker.
    pub max_history: usize,
    /// Maximum simultaneously active trackers.
    pub max_trackers: usize,
    /// Extra search radius per consecutive lost frame.
    pub lost_radius_growth: usize,
    /// Cap on the grown radius as a multiple of `search_radius`.
    pub max_radius_factor: f32,
}

impl TrackingConfig {
    /// Parameters for a built-in profile.
    pub fn from_profile(profile: Profile) -> Self {
        let base = TrackingConfig {
            search_radius: 40,
            search_step: 3,
            refine_radius: 3,
            template_size: 25,
            position_smoothing: 0.6,
            velocity_smoothing: 0.4,
            lost_smoothing: 0.2,
            occluded_threshold: 0.20,
            lost_threshold: 0.35,
            template_update_rate: 0.10,
            min_confidence_for_update: 55,
            max_history: 60,
            max_trackers: 5,
            lost_radius_growth: 6,
            max_radius_factor: 2.5,
        };
        match profile {
            Profile::Balanced => base,
            Profile::Precision => TrackingConfig {
                search_radius: 48,
                search_step: 2,
                template_size: 31,
                position_smoothing: 0.65,
                velocity_smoothing: 0.45,
                occluded_threshold: 0.18,
                lost_threshold: 0.32,
                template_update_rate: 0.08,
                min_confidence_for_update: 60,
                max_history: 90,
                max_trackers: 4,
                ..base
            },
            Profile::Performance => TrackingConfig {
                search_radius: 32,
                search_step: 4,
                refine_radius: 2,
                template_size: 21,
                position_smoothing: 0.55,
                velocity_smoothing: 0.35,
                occluded_threshold: 0.22,
                lost_threshold: 0.38,
                template_update_rate: 0.12,
                min_confidence_for_update: 50,
                max_history: 40,
                max_trackers: 6,
                ..base
            },
        }
    }

    /// Coarse search radius after `lost_frames` consecutive lost frames:
    /// `min(base + lost_frames·growth, base·factor)`.
    pub fn search_radius_for(&self, lost_frames: u32) -> usize {
        let grown = self.search_radius + lost_frames as usize * self.lost_radius_growth;
        let cap = (self.search_radius as f32 * self.max_radius_factor).floor() as usize;
        grown.min(cap.max(self.search_radius))
    }

    /// Search parameters for a tracker that has been lost `lost_frames`.
    pub fn search_params(&self, lost_frames: u32) -> SearchParams {
        SearchParams {
            radius: self.search_radius_for(lost_frames),
            step: self.search_step,
            refine_radius: self.refine_radius,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.template_size % 2 == 0 || self.template_size < MIN_TEMPLATE_SIZE {
            return Err(invalid(format!(
                "template_size must be odd and >= {MIN_TEMPLATE_SIZE} (got {})",
                self.template_size
            )));
        }
        if self.search_step == 0 {
            return Err(invalid("search_step must be >= 1".into()));
        }
        if self.search_radius == 0 {
            return Err(invalid("search_radius must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.occluded_threshold)
            || !(0.0..=1.0).contains(&self.lost_threshold)
            || self.occluded_threshold >= self.lost_threshold
        {
            return Err(invalid(format!(
                "thresholds must satisfy 0 <= occluded ({}) < lost ({}) <= 1",
                self.occluded_threshold, self.lost_threshold
            )));
        }
        for (name, v) in [
            ("position_smoothing", self.position_smoothing),
            ("velocity_smoothing", self.velocity_smoothing),
            ("lost_smoothing", self.lost_smoothing),
            ("template_update_rate", self.template_update_rate),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!("{name} must be within [0, 1] (got {v})")));
            }
        }
        if self.min_confidence_for_update > 100 {
            return Err(invalid("min_confidence_for_update must be <= 100".into()));
        }
        if self.max_trackers == 0 {
            return Err(invalid("max_trackers must be >= 1".into()));
        }
        if self.max_radius_factor < 1.0 {
            return Err(invalid("max_radius_factor must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig::from_profile(Profile::Balanced)
    }
}

/// Detector fusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Base weight of the detector position in the blend.
    pub yolo_weight: f32,
    /// Detector center is authoritative whenever a detection is matched.
    pub detector_dominant: bool,
    /// Host frame rate; sets the lock miss tolerance to ~half a second.
    pub target_fps: f32,
    /// Re-acquisition radius for lost trackers. `None` → 2 × search radius.
    pub reacquire_radius: Option<f32>,
    /// Minimum detection confidence for re-acquisition (exclusive).
    pub reacquire_min_confidence: f32,
    /// Detections at or below this confidence are ignored entirely.
    pub min_detection_confidence: f32,
    /// Matched confidence above which a locked tracker is `Tracking`.
    pub tracking_confidence: f32,
    /// Template/detector agreement distance. `None` → template size.
    pub agreement_radius: Option<f32>,
    /// Confidence points added when template and detector agree.
    pub agreement_bonus: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            yolo_weight: 0.5,
            detector_dominant: false,
            target_fps: 30.0,
            reacquire_radius: None,
            reacquire_min_confidence: 0.35,
            min_detection_confidence: 0.05,
            tracking_confidence: 0.25,
            agreement_radius: None,
            agreement_bonus: 10.0,
        }
    }
}

impl FusionConfig {
    /// Consecutive misses after which a detector lock is dropped:
    /// `max(3, round(fps·0.5))`.
    pub fn miss_limit(&self) -> u32 {
        ((self.target_fps * 0.5).round() as u32).max(3)
    }

    pub fn reacquire_radius_for(&self, tracking: &TrackingConfig) -> f32 {
        self.reacquire_radius
            .unwrap_or(2.0 * tracking.search_radius as f32)
    }

    pub fn agreement_radius_for(&self, tracking: &TrackingConfig) -> f32 {
        self.agreement_radius
            .unwrap_or(tracking.template_size as f32)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.yolo_weight) {
            return Err(invalid(format!("yolo_weight must be within [0, 1] (got {})", self.yolo_weight)));
        }
        if self.target_fps <= 0.0 {
            return Err(invalid("target_fps must be > 0".into()));
        }
        if matches!(self.reacquire_radius, Some(r) if r <= 0.0) {
            return Err(invalid("reacquire_radius must be > 0".into()));
        }
        for (name, v) in [
            ("reacquire_min_confidence", self.reacquire_min_confidence),
            ("min_detection_confidence", self.min_detection_confidence),
            ("tracking_confidence", self.tracking_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!("{name} must be within [0, 1] (got {v})")));
            }
        }
        Ok(())
    }
}

/// Rigid-body anchor sub-tracker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub max_anchors: usize,
    /// Valid anchors needed for the rigid constraint and consensus.
    pub min_anchors: usize,
    /// Anchor template side length (odd).
    pub anchor_template_size: usize,
    /// Half-width of the window searched for anchor candidates.
    pub detection_radius: usize,
    /// Minimum distance between two anchors.
    pub min_spacing: f32,
    /// Per-anchor NCC search half-width.
    pub search_radius: usize,
    /// NCC below which an anchor match is rejected.
    pub min_ncc: f32,
    /// Relative pairwise distance deviation tolerated before a pair violates.
    pub distance_tolerance: f32,
    /// Coherence below which the anchor consensus is not trusted.
    pub min_coherence: f32,
    /// Trust in the anchor consensus versus the single-point estimate.
    pub anchor_weight: f32,
    pub harris_k: f32,
    /// Confidence reported when falling back to the single-point estimate.
    pub fallback_confidence: f32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        AnchorConfig {
            max_anchors: 6,
            min_anchors: 3,
            anchor_template_size: 11,
            detection_radius: 24,
            min_spacing: 8.0,
            search_radius: 8,
            min_ncc: 0.6,
            distance_tolerance: 0.25,
            min_coherence: 0.5,
            anchor_weight: 0.6,
            harris_k: 0.04,
            fallback_confidence: 0.5,
        }
    }
}

impl AnchorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.anchor_template_size % 2 == 0 || self.anchor_template_size < 3 {
            return Err(invalid(format!(
                "anchor_template_size must be odd and >= 3 (got {})",
                self.anchor_template_size
            )));
        }
        if self.min_anchors < 2 || self.min_anchors > self.max_anchors {
            return Err(invalid(format!(
                "need 2 <= min_anchors ({}) <= max_anchors ({})",
                self.min_anchors, self.max_anchors
            )));
        }
        if self.min_spacing <= 0.0 {
            return Err(invalid("min_spacing must be > 0".into()));
        }
        for (name, v) in [
            ("anchor_weight", self.anchor_weight),
            ("min_coherence", self.min_coherence),
            ("fallback_confidence", self.fallback_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!("{name} must be within [0, 1] (got {v})")));
            }
        }
        if self.distance_tolerance <= 0.0 {
            return Err(invalid("distance_tolerance must be > 0".into()));
        }
        Ok(())
    }
}

/// Everything an engine needs, as loaded from a config file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub profile: Profile,
    pub tracking: TrackingConfig,
    pub fusion: FusionConfig,
    pub anchors: AnchorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from_profile(Profile::default())
    }
}

/// On-disk shape: tracking fields are optional overrides of the profile.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEngineConfig {
    profile: Profile,
    tracking: serde_yaml::Mapping,
    fusion: FusionConfig,
    anchors: AnchorConfig,
}

impl EngineConfig {
    pub fn from_profile(profile: Profile) -> Self {
        EngineConfig {
            profile,
            tracking: TrackingConfig::from_profile(profile),
            fusion: FusionConfig::default(),
            anchors: AnchorConfig::default(),
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawEngineConfig = if text.trim().is_empty() {
            RawEngineConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };

        // Overlay the explicit tracking keys on top of the profile values.
        let mut tracking = serde_yaml::to_value(TrackingConfig::from_profile(raw.profile))?;
        if let serde_yaml::Value::Mapping(base) = &mut tracking {
            for (k, v) in raw.tracking {
                base.insert(k, v);
            }
        }
        let config = EngineConfig {
            profile: raw.profile,
            tracking: serde_yaml::from_value(tracking)?,
            fusion: raw.fusion,
            anchors: raw.anchors,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        EngineConfig::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracking.validate()?;
        self.fusion.validate()?;
        self.anchors.validate()
    }
}

fn invalid(msg: String) -> TrackError {
    TrackError::InvalidConfig(msg)
}
