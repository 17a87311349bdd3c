// tracker.rs — One tracked point and its per-frame template step.
//
// Per frame, with no detector input:
//
//   1. predict   p' = p + v
//   2. search    two-phase SAD around p', radius grown while lost
//   3. raw conf  round((1 − score)·100)
//   4. conf      round(0.7·conf + 0.3·raw)
//   5. state     score > lost → Lost, score > occluded → Occluded, else Tracking
//   6. position  p += (target − p)·s   target = match (or p' while lost),
//                                      s = position_smoothing (or lost_smoothing)
//   7. velocity  v += (Δp − v)·velocity_smoothing
//   8. template  blend a fresh patch in, only while Tracking with enough confidence
//   9. history   append (x, y, t) unless Lost
//
// Steps 1–6 are `observe`, which does not mutate the tracker; fusion
// adjusts its outcome before `commit` applies steps 7–9. The template-only
// path is `update` = observe + commit.
//
// Positions are kept so the template window stays inside the frame.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::TrackingConfig;
use crate::error::Result;
use crate::image::{clamp_center, Image};
use crate::search::{self, MatchResult};
use crate::template::Template;

/// Engine-assigned tracker id.
pub type TrackerId = u32;

/// Display color (RGB).
pub type Color = [u8; 3];

/// Confidence retained from the previous frame when smoothing.
const CONFIDENCE_RETENTION: f32 = 0.7;

/// Match quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Tracking,
    Occluded,
    Lost,
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackState::Tracking => "tracking",
            TrackState::Occluded => "occluded",
            TrackState::Lost => "lost",
        })
    }
}

/// Where a tracker's label came from. Detector labels only replace
/// placeholders; a confirmed label is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelStatus {
    Placeholder,
    Detected,
    Confirmed,
}

/// Smoothed per-frame displacement in px/frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
}

/// Trail sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub x: f32,
    pub y: f32,
    /// Host timestamp in milliseconds.
    pub t: f64,
}

/// Link to the external detector's view of this subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorLink {
    /// Persistent detector id this tracker is locked to.
    pub track_id: Option<u32>,
    pub label: Option<String>,
    /// Confidence of the last matched detection.
    pub confidence: f32,
    /// Consecutive frames without a match while locked.
    pub misses: u32,
    pub last_seen_at: Option<f64>,
}

impl DetectorLink {
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.track_id.is_some()
    }
}

/// Classify a normalized SAD score.
pub fn classify(score: f32, config: &TrackingConfig) -> TrackState {
    if score > config.lost_threshold {
        TrackState::Lost
    } else if score > config.occluded_threshold {
        TrackState::Occluded
    } else {
        TrackState::Tracking
    }
}

/// `round((1 − score)·100)` clamped to [0, 100].
pub fn raw_confidence(score: f32) -> u8 {
    ((1.0 - score) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// `round(0.7·previous + 0.3·raw)`.
pub fn smooth_confidence(previous: u8, raw: u8) -> u8 {
    let v = previous as f32 * CONFIDENCE_RETENTION + raw as f32 * (1.0 - CONFIDENCE_RETENTION);
    v.round().clamp(0.0, 100.0) as u8
}

/// Whether `label` is one of the generated placeholders
/// ("Target N", "Subject N", "Region N").
pub fn is_placeholder_label(label: &str) -> bool {
    match label.split_once(' ') {
        Some((prefix, number)) => {
            matches!(prefix, "Target" | "Subject" | "Region")
                && !number.is_empty()
                && number.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Outcome of the template search for one frame, before anything is
/// committed to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateStep {
    /// Velocity-extrapolated position.
    pub predicted: (f32, f32),
    /// Best SAD match, if any window fit in the frame.
    pub matched: Option<MatchResult>,
    /// Normalized SAD (1.0 when nothing matched).
    pub score: f32,
    /// Smoothed confidence.
    pub confidence: u8,
    pub state: TrackState,
    /// Smoothed, clamped new position.
    pub position: (f32, f32),
}

/// Final per-frame values to write back into a tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Commit {
    pub position: (f32, f32),
    pub state: TrackState,
    pub confidence: u8,
}

impl From<TemplateStep> for Commit {
    fn from(step: TemplateStep) -> Self {
        Commit {
            position: step.position,
            state: step.state,
            confidence: step.confidence,
        }
    }
}

/// A tracked point.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub id: TrackerId,
    pub label: String,
    pub label_status: LabelStatus,
    pub color: Color,
    /// Sub-pixel center in frame coordinates.
    pub x: f32,
    pub y: f32,
    pub velocity: Velocity,
    pub state: TrackState,
    /// Smoothed match confidence, 0–100.
    pub confidence: u8,
    /// Consecutive frames spent `Lost`.
    pub lost_frames: u32,
    /// Host timestamp (ms) at creation.
    pub created_at: f64,
    pub detector: DetectorLink,
    template: Template,
    history: VecDeque<HistorySample>,
    max_history: usize,
}

impl Tracker {
    /// Create a tracker on (x, y). Fails if the template window does not fit
    /// in the frame; no tracker is created with truncated appearance data.
    pub fn new(
        id: TrackerId,
        label: impl Into<String>,
        color: Color,
        frame: &Image<u8>,
        x: f32,
        y: f32,
        config: &TrackingConfig,
        timestamp: f64,
    ) -> Result<Tracker> {
        let template = Template::try_extract(frame, x, y, config.template_size)?;
        // Extraction rounds the center; keep the stored position in range too.
        let (x, y) = clamp_center(x, y, template.half(), frame.width(), frame.height());
        let label = label.into();
        let label_status = if is_placeholder_label(&label) {
            LabelStatus::Placeholder
        } else {
            LabelStatus::Confirmed
        };
        let mut history = VecDeque::with_capacity(config.max_history.min(256));
        if config.max_history > 0 {
            history.push_back(HistorySample { x, y, t: timestamp });
        }
        Ok(Tracker {
            id,
            label,
            label_status,
            color,
            x,
            y,
            velocity: Velocity::default(),
            state: TrackState::Tracking,
            confidence: 100,
            lost_frames: 0,
            created_at: timestamp,
            detector: DetectorLink::default(),
            template,
            history,
            max_history: config.max_history,
        })
    }

    #[inline]
    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    #[inline]
    pub fn template(&self) -> &Template {
        &self.template
    }

    #[inline]
    pub fn template_size(&self) -> usize {
        self.template.size()
    }

    /// Trail samples, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HistorySample> + '_ {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Pin a label so detector classes never replace it.
    pub fn confirm_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
        self.label_status = LabelStatus::Confirmed;
    }

    /// Steps 1–6: predict, search, score, classify, smooth position.
    /// Does not modify the tracker.
    pub fn observe(&self, frame: &Image<u8>, config: &TrackingConfig) -> TemplateStep {
        let predicted = (self.x + self.velocity.x, self.y + self.velocity.y);
        let params = config.search_params(self.lost_frames);
        let matched = search::search(frame, &self.template, predicted, params);

        let score = matched.map_or(1.0, |m| m.score);
        let confidence = smooth_confidence(self.confidence, raw_confidence(score));
        let state = classify(score, config);

        let (target, smoothing) = match (state, matched) {
            (TrackState::Lost, _) | (_, None) => (predicted, config.lost_smoothing),
            (_, Some(m)) => ((m.x as f32, m.y as f32), config.position_smoothing),
        };
        let position = self.clamp_to_frame(
            self.x + (target.0 - self.x) * smoothing,
            self.y + (target.1 - self.y) * smoothing,
            frame,
        );

        trace!(
            tracker = self.id,
            score,
            confidence,
            ?state,
            radius = params.radius,
            "template step"
        );

        TemplateStep {
            predicted,
            matched,
            score,
            confidence,
            state,
            position,
        }
    }

    /// Steps 7–9: velocity, lost counter, template refresh, history.
    pub fn commit(&mut self, frame: &Image<u8>, config: &TrackingConfig, commit: Commit, timestamp: f64) {
        let (nx, ny) = self.clamp_to_frame(commit.position.0, commit.position.1, frame);
        let a = config.velocity_smoothing;
        self.velocity.x += ((nx - self.x) - self.velocity.x) * a;
        self.velocity.y += ((ny - self.y) - self.velocity.y) * a;
        self.x = nx;
        self.y = ny;
        self.state = commit.state;
        self.confidence = commit.confidence.min(100);

        if self.state == TrackState::Lost {
            self.lost_frames = self.lost_frames.saturating_add(1);
        } else {
            self.lost_frames = 0;
        }

        // Near an edge the refresh window may not fit; skip it this frame.
        if self.state == TrackState::Tracking && self.confidence >= config.min_confidence_for_update {
            self.template.refresh(frame, nx, ny, config.template_update_rate);
        }

        if self.state != TrackState::Lost {
            self.push_history(nx, ny, timestamp);
        }
    }

    /// Template-only update. Returns the new state.
    pub fn update(&mut self, frame: &Image<u8>, config: &TrackingConfig, timestamp: f64) -> TrackState {
        let step = self.observe(frame, config);
        self.commit(frame, config, step.into(), timestamp);
        self.state
    }

    /// Jump to a position found by other means (detector re-acquisition):
    /// velocity is cleared and the lost counter reset.
    pub fn snap_to(&mut self, frame: &Image<u8>, x: f32, y: f32, confidence: u8, timestamp: f64) {
        let (nx, ny) = self.clamp_to_frame(x, y, frame);
        self.x = nx;
        self.y = ny;
        self.velocity = Velocity::default();
        self.state = TrackState::Tracking;
        self.confidence = confidence.min(100);
        self.lost_frames = 0;
        self.push_history(nx, ny, timestamp);
    }

    /// Replace the position with a refined estimate of the same frame.
    /// Velocity, state and history are left alone.
    pub fn refine_to(&mut self, frame: &Image<u8>, x: f32, y: f32) {
        let (nx, ny) = self.clamp_to_frame(x, y, frame);
        self.x = nx;
        self.y = ny;
    }

    fn clamp_to_frame(&self, x: f32, y: f32, frame: &Image<u8>) -> (f32, f32) {
        clamp_center(x, y, self.template.half(), frame.width(), frame.height())
    }

    fn push_history(&mut self, x: f32, y: f32, t: f64) {
        if self.max_history == 0 {
            return;
        }
        while self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(HistorySample { x, y, t });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackingConfig {
        TrackingConfig {
            search_radius: 12,
            search_step: 2,
            refine_radius: 2,
            template_size: 15,
            max_history: 4,
            ..TrackingConfig::default()
        }
    }

    /// Dark background with a 20×20 block of non-repeating texture whose
    /// top-left corner is at (ox, oy).
    fn scene(ox: usize, oy: usize) -> Image<u8> {
        let mut img = Image::filled(96, 96, 30u8);
        for y in 0..20 {
            for x in 0..20 {
                let v = (60 + (x * x + 2 * y * y + x * y) / 10) as u8;
                if ox + x < 96 && oy + y < 96 {
                    img.set(ox + x, oy + y, v);
                }
            }
        }
        img
    }

    #[test]
    fn test_placeholder_labels() {
        assert!(is_placeholder_label("Target 1"));
        assert!(is_placeholder_label("Subject 12"));
        assert!(is_placeholder_label("Region 3"));
        assert!(!is_placeholder_label("Target"));
        assert!(!is_placeholder_label("Target A"));
        assert!(!is_placeholder_label("person"));
        assert!(!is_placeholder_label("Target 1 2"));
    }

    #[test]
    fn test_confidence_helpers() {
        assert_eq!(raw_confidence(0.0), 100);
        assert_eq!(raw_confidence(1.0), 0);
        assert_eq!(raw_confidence(0.234), 77);
        assert_eq!(smooth_confidence(100, 0), 70);
        assert_eq!(smooth_confidence(50, 100), 65);
    }

    #[test]
    fn test_classify_thresholds() {
        let c = config();
        assert_eq!(classify(0.0, &c), TrackState::Tracking);
        assert_eq!(classify(c.occluded_threshold, &c), TrackState::Tracking);
        assert_eq!(classify(c.occluded_threshold + 0.01, &c), TrackState::Occluded);
        assert_eq!(classify(c.lost_threshold, &c), TrackState::Occluded);
        assert_eq!(classify(c.lost_threshold + 0.01, &c), TrackState::Lost);
    }

    #[test]
    fn test_creation_refused_at_edge() {
        let frame = scene(30, 30);
        assert!(Tracker::new(1, "Target 1", [255, 0, 0], &frame, 3.0, 40.0, &config(), 0.0).is_err());
        let t = Tracker::new(1, "Target 1", [255, 0, 0], &frame, 40.0, 40.0, &config(), 0.0).unwrap();
        assert_eq!(t.state, TrackState::Tracking);
        assert_eq!(t.label_status, LabelStatus::Placeholder);
        assert_eq!(t.template_size(), 15);
        assert_eq!(t.history_len(), 1);
    }

    #[test]
    fn test_creation_clamps_rounded_center() {
        let frame = scene(0, 30);
        // 6.6 rounds to 7, which fits a 15 px window; 6.6 itself does not.
        let t = Tracker::new(1, "Target 1", [0; 3], &frame, 6.6, 40.0, &config(), 0.0).unwrap();
        assert_eq!(t.position(), (7.0, 40.0));
        let first = t.history().next().unwrap();
        assert_eq!((first.x, first.y), (7.0, 40.0));

        let t = Tracker::new(2, "Target 2", [0; 3], &frame, 88.4, 88.4, &config(), 0.0).unwrap();
        assert_eq!(t.position(), (88.0, 88.0));
    }

    #[test]
    fn test_static_scene_stays_put() {
        let frame = scene(30, 30);
        let mut t = Tracker::new(1, "Target 1", [0; 3], &frame, 40.0, 40.0, &config(), 0.0).unwrap();
        for i in 0..5 {
            assert_eq!(t.update(&frame, &config(), i as f64), TrackState::Tracking);
        }
        assert_eq!(t.position(), (40.0, 40.0));
        assert_eq!(t.confidence, 100);
        assert_eq!(t.velocity, Velocity::default());
    }

    #[test]
    fn test_follows_motion() {
        let c = config();
        let mut t = Tracker::new(1, "Target 1", [0; 3], &scene(30, 30), 40.0, 40.0, &c, 0.0).unwrap();
        for step in 1..=8 {
            let frame = scene(30 + step * 2, 30 + step);
            t.update(&frame, &c, step as f64);
        }
        // Object center moved from (40, 40) to (56, 48); smoothing lags a bit.
        assert!((t.x - 56.0).abs() < 4.0, "x = {}", t.x);
        assert!((t.y - 48.0).abs() < 4.0, "y = {}", t.y);
        assert!(t.velocity.x > 1.0, "vx = {}", t.velocity.x);
        assert_eq!(t.state, TrackState::Tracking);
    }

    #[test]
    fn test_history_is_bounded() {
        let frame = scene(30, 30);
        let c = config();
        let mut t = Tracker::new(1, "Target 1", [0; 3], &frame, 40.0, 40.0, &c, 0.0).unwrap();
        for i in 1..10 {
            t.update(&frame, &c, i as f64);
        }
        assert_eq!(t.history_len(), 4);
        let ts: Vec<f64> = t.history().map(|s| s.t).collect();
        assert_eq!(ts, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_position_clamped_to_frame() {
        let frame = scene(30, 30);
        let c = config();
        let mut t = Tracker::new(1, "Target 1", [0; 3], &frame, 40.0, 40.0, &c, 0.0).unwrap();
        t.velocity = Velocity { x: -500.0, y: 900.0 };
        t.update(&frame, &c, 1.0);
        let half = 7.0;
        assert!(t.x >= half && t.x <= 95.0 - half);
        assert!(t.y >= half && t.y <= 95.0 - half);
    }

    #[test]
    fn test_snap_resets_motion() {
        let frame = scene(30, 30);
        let c = config();
        let mut t = Tracker::new(1, "Target 1", [0; 3], &frame, 40.0, 40.0, &c, 0.0).unwrap();
        t.state = TrackState::Lost;
        t.lost_frames = 9;
        t.velocity = Velocity { x: 3.0, y: -1.0 };
        t.snap_to(&frame, 60.0, 50.0, 50, 5.0);
        assert_eq!(t.state, TrackState::Tracking);
        assert_eq!(t.lost_frames, 0);
        assert_eq!(t.velocity, Velocity::default());
        assert_eq!(t.position(), (60.0, 50.0));
        assert_eq!(t.confidence, 50);
    }

    #[test]
    fn test_confirm_label() {
        let frame = scene(30, 30);
        let mut t = Tracker::new(1, "Target 1", [0; 3], &frame, 40.0, 40.0, &config(), 0.0).unwrap();
        t.confirm_label("mug");
        assert_eq!(t.label, "mug");
        assert_eq!(t.label_status, LabelStatus::Confirmed);
    }
}
