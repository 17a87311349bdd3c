// engine.rs — Multi-tracker frame loop.
//
// The engine is what a host calls once per video frame:
//
//   1. Snapshot every tracker's state
//   2. No detections → template-only step per tracker
//      Detections     → fusion pass 1 (all trackers, in order), then
//                       pass 2 (re-acquire lost trackers)
//   3. Refine the focused tracker with its anchor set, if any
//   4. Diff states → StateChange events
//
// Trackers are independent: each reads the shared frame and detection
// list, and only the per-frame claimed set couples them. The engine never
// removes a tracker on its own; a permanently lost tracker stays Lost while
// its `lost_frames` grows.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::anchor::{AnchorEstimate, AnchorSet};
use crate::config::{EngineConfig, TrackingConfig};
use crate::detection::Detection;
use crate::error::{Result, TrackError};
use crate::fusion::FusionPass;
use crate::image::Image;
use crate::luma::rgba_to_luma;
use crate::tracker::{Color, TrackState, Tracker, TrackerId};

/// Display colors, cycled by tracker id.
pub const PALETTE: [Color; 8] = [
    [239, 68, 68],
    [34, 197, 94],
    [59, 130, 246],
    [234, 179, 8],
    [168, 85, 247],
    [6, 182, 212],
    [249, 115, 22],
    [236, 72, 153],
];

/// A tracker changed state during one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub tracker_id: TrackerId,
    pub from: TrackState,
    pub to: TrackState,
}

/// Per-frame output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    /// Zero-based index of the processed frame.
    pub frame_index: u64,
    pub events: Vec<StateChange>,
    pub tracking: usize,
    pub occluded: usize,
    pub lost: usize,
    /// Detections paired with a tracker this frame.
    pub claimed_detections: usize,
    /// Lost trackers snapped back onto a detection.
    pub reacquired: usize,
    /// Anchor refinement of the focused tracker.
    pub anchor: Option<AnchorEstimate>,
}

struct Focus {
    tracker_id: TrackerId,
    anchors: AnchorSet,
}

/// Owns the active trackers of one session.
pub struct TrackerEngine {
    config: EngineConfig,
    trackers: Vec<Tracker>,
    /// Next id to assign. Monotonically increasing, never reused.
    next_id: TrackerId,
    frame_index: u64,
    focus: Option<Focus>,
}

impl TrackerEngine {
    /// Build an engine. The configuration is validated once and is
    /// immutable afterwards.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(TrackerEngine {
            config,
            trackers: Vec::new(),
            next_id: 1,
            frame_index: 0,
            focus: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracking_config(&self) -> &TrackingConfig {
        &self.config.tracking
    }

    /// Active trackers in creation order.
    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    pub fn tracker(&self, id: TrackerId) -> Option<&Tracker> {
        self.trackers.iter().find(|t| t.id == id)
    }

    pub fn tracker_mut(&mut self, id: TrackerId) -> Option<&mut Tracker> {
        self.trackers.iter_mut().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Number of frames processed so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Start tracking the point (x, y) with a placeholder label.
    pub fn add_tracker(&mut self, frame: &Image<u8>, x: f32, y: f32, timestamp: f64) -> Result<TrackerId> {
        let label = format!("Target {}", self.next_id);
        self.add_tracker_labeled(frame, x, y, label, timestamp)
    }

    /// Start tracking (x, y) under `label`. A non-placeholder label counts
    /// as confirmed and is never replaced by detector classes.
    pub fn add_tracker_labeled(
        &mut self,
        frame: &Image<u8>,
        x: f32,
        y: f32,
        label: impl Into<String>,
        timestamp: f64,
    ) -> Result<TrackerId> {
        let max = self.config.tracking.max_trackers;
        if self.trackers.len() >= max {
            warn!(max, "tracker limit reached, not creating tracker");
            return Err(TrackError::TooManyTrackers { max });
        }

        let id = self.next_id;
        let color = PALETTE[(id as usize - 1) % PALETTE.len()];
        let tracker = match Tracker::new(id, label, color, frame, x, y, &self.config.tracking, timestamp) {
            Ok(t) => t,
            Err(e) => {
                warn!(x, y, error = %e, "refusing tracker creation");
                return Err(e);
            }
        };

        info!(tracker = id, label = %tracker.label, x, y, "tracker created");
        self.next_id += 1;
        self.trackers.push(tracker);
        Ok(id)
    }

    /// Remove a tracker. Returns false if the id is unknown.
    pub fn remove_tracker(&mut self, id: TrackerId) -> bool {
        let Some(pos) = self.trackers.iter().position(|t| t.id == id) else {
            return false;
        };
        let t = self.trackers.remove(pos);
        if self.focused() == Some(id) {
            self.focus = None;
        }
        info!(tracker = id, label = %t.label, "tracker removed");
        true
    }

    /// Drop all trackers and the anchor focus. Ids keep increasing.
    pub fn clear(&mut self) {
        if !self.trackers.is_empty() {
            info!(count = self.trackers.len(), "clearing trackers");
        }
        self.trackers.clear();
        self.focus = None;
    }

    /// Refine tracker `id` with a rigid anchor set detected on `frame`.
    /// Replaces any previous focus.
    pub fn focus(&mut self, id: TrackerId, frame: &Image<u8>) -> Result<()> {
        let t = self.tracker(id).ok_or(TrackError::UnknownTracker(id))?;
        let anchors = AnchorSet::detect(frame, t.x, t.y, t.label.clone(), &self.config.anchors)?;
        info!(tracker = id, anchors = anchors.len(), "anchor focus set");
        self.focus = Some(Focus { tracker_id: id, anchors });
        Ok(())
    }

    pub fn unfocus(&mut self) {
        self.focus = None;
    }

    pub fn focused(&self) -> Option<TrackerId> {
        self.focus.as_ref().map(|f| f.tracker_id)
    }

    pub fn anchor_set(&self) -> Option<&AnchorSet> {
        self.focus.as_ref().map(|f| &f.anchors)
    }

    /// Advance every tracker by one frame.
    ///
    /// `detections: None` means the detector produced nothing for this
    /// frame and trackers run template-only. `Some(&[])` is an explicit
    /// empty result: locked trackers count a miss.
    pub fn update(&mut self, frame: &Image<u8>, detections: Option<&[Detection]>, timestamp: f64) -> FrameReport {
        let before: Vec<TrackState> = self.trackers.iter().map(|t| t.state).collect();
        let mut report = FrameReport {
            frame_index: self.frame_index,
            ..FrameReport::default()
        };

        match detections {
            None => {
                for t in &mut self.trackers {
                    t.update(frame, &self.config.tracking, timestamp);
                }
            }
            Some(dets) => {
                let mut pass = FusionPass::new(frame, dets, &self.config.tracking, &self.config.fusion, timestamp);
                for t in &mut self.trackers {
                    pass.update_tracker(t);
                }
                for t in &mut self.trackers {
                    if pass.reacquire(t).is_some() {
                        report.reacquired += 1;
                    }
                }
                report.claimed_detections = (0..dets.len()).filter(|&i| pass.is_claimed(i)).count();
            }
        }

        if let Some(focus) = &mut self.focus {
            if let Some(t) = self.trackers.iter_mut().find(|t| t.id == focus.tracker_id) {
                let estimate = focus
                    .anchors
                    .update(frame, t.position(), t.confidence as f32 / 100.0);
                if !estimate.fallback && t.state != TrackState::Lost {
                    t.refine_to(frame, estimate.position.0, estimate.position.1);
                }
                report.anchor = Some(estimate);
            }
        }

        for (t, &from) in self.trackers.iter().zip(&before) {
            match t.state {
                TrackState::Tracking => report.tracking += 1,
                TrackState::Occluded => report.occluded += 1,
                TrackState::Lost => report.lost += 1,
            }
            if t.state != from {
                debug!(tracker = t.id, %from, to = %t.state, "state change");
                report.events.push(StateChange {
                    tracker_id: t.id,
                    from,
                    to: t.state,
                });
            }
        }

        self.frame_index += 1;
        report
    }

    /// Convenience wrapper: convert an RGBA frame to luma, then `update`.
    pub fn update_rgba(
        &mut self,
        rgba: &[u8],
        width: usize,
        height: usize,
        detections: Option<&[Detection]>,
        timestamp: f64,
    ) -> Result<FrameReport> {
        let frame = rgba_to_luma(rgba, width, height)?;
        Ok(self.update(&frame, detections, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;

    fn engine() -> TrackerEngine {
        let mut config = EngineConfig::from_profile(Profile::Performance);
        config.tracking.search_radius = 12;
        config.tracking.template_size = 15;
        TrackerEngine::new(config).unwrap()
    }

    fn scene() -> Image<u8> {
        let mut img = Image::filled(160, 120, 20u8);
        for y in 0..40 {
            for x in 0..60 {
                img.set(40 + x, 30 + y, (40 + (x * x + 2 * y * y + 3 * x * y) % 180) as u8);
            }
        }
        img
    }

    #[test]
    fn test_ids_labels_colors() {
        let mut e = engine();
        let frame = scene();
        let a = e.add_tracker(&frame, 60.0, 50.0, 0.0).unwrap();
        let b = e.add_tracker(&frame, 80.0, 50.0, 0.0).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(e.tracker(a).unwrap().label, "Target 1");
        assert_eq!(e.tracker(b).unwrap().color, PALETTE[1]);

        assert!(e.remove_tracker(a));
        assert!(!e.remove_tracker(a));
        let c = e.add_tracker(&frame, 60.0, 50.0, 0.0).unwrap();
        assert_eq!(c, 3);
        assert_eq!(e.len(), 2);
    }

    #[test]
    fn test_refused_creation_keeps_ids() {
        let mut e = engine();
        let frame = scene();
        let err = e.add_tracker(&frame, 1.0, 1.0, 0.0).unwrap_err();
        assert!(matches!(err, TrackError::TemplateOutOfBounds { .. }));
        assert!(e.is_empty());
        assert_eq!(e.add_tracker(&frame, 60.0, 50.0, 0.0).unwrap(), 1);
    }

    #[test]
    fn test_tracker_limit() {
        let mut e = engine();
        let frame = scene();
        let max = e.tracking_config().max_trackers;
        for i in 0..max {
            e.add_tracker(&frame, 50.0 + i as f32 * 6.0, 50.0, 0.0).unwrap();
        }
        let err = e.add_tracker(&frame, 60.0, 60.0, 0.0).unwrap_err();
        assert!(matches!(err, TrackError::TooManyTrackers { max: m } if m == max));
    }

    #[test]
    fn test_labeled_tracker_is_confirmed() {
        let mut e = engine();
        let id = e.add_tracker_labeled(&scene(), 60.0, 50.0, "mug", 0.0).unwrap();
        assert_eq!(e.tracker(id).unwrap().label_status, crate::tracker::LabelStatus::Confirmed);
    }

    #[test]
    fn test_static_frames_emit_no_events() {
        let mut e = engine();
        let frame = scene();
        e.add_tracker(&frame, 60.0, 50.0, 0.0).unwrap();
        for i in 0..3 {
            let r = e.update(&frame, None, i as f64 * 33.0);
            assert_eq!(r.frame_index, i);
            assert!(r.events.is_empty());
            assert_eq!(r.tracking, 1);
        }
        assert_eq!(e.frame_index(), 3);
    }

    #[test]
    fn test_unknown_focus() {
        let mut e = engine();
        let err = e.focus(42, &scene()).unwrap_err();
        assert!(matches!(err, TrackError::UnknownTracker(42)));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut e = engine();
        let frame = scene();
        e.add_tracker(&frame, 60.0, 50.0, 0.0).unwrap();
        e.clear();
        assert!(e.is_empty());
        assert_eq!(e.focused(), None);
        assert_eq!(e.add_tracker(&frame, 60.0, 50.0, 0.0).unwrap(), 2);
    }

    #[test]
    fn test_update_rgba_checks_dimensions() {
        let mut e = engine();
        let err = e.update_rgba(&[0u8; 10], 4, 4, None, 0.0).unwrap_err();
        assert!(matches!(err, TrackError::DimensionMismatch { .. }));
    }
}
