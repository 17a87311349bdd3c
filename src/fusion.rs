// fusion.rs — Blending template tracking with external detector boxes.
//
// One `FusionPass` covers one frame. It owns the per-frame "claimed" set so
// no detection feeds two trackers, and is driven in two passes by the
// engine:
//
//   pass 1  update_tracker, in tracker order
//             - locked trackers look up their detector id (stable link,
//               any confidence)
//             - otherwise, or if the id is gone, nearest unclaimed
//               detection within 1.5 × search radius (first contact)
//             - lost trackers only get the id lookup here
//   pass 2  reacquire, for trackers still Lost
//             - nearest unclaimed detection within the re-acquisition
//               radius with confidence > reacquire_min_confidence
//
// Claiming is first-match-wins in tracker order, so locked trackers keep
// their detections before any speculative re-acquisition runs.
//
// Blend, when a tracker matched detection d:
//   dominant   p = center(d), conf = max(conf_tpl, 100·c_d)
//   weighted   w = min(0.9, (yolo_weight + 0.4·[locked]) · max(0.35, c_d))
//              p = p_tpl·(1 − w) + center(d)·w
//              conf = conf_tpl·(1 − w) + 100·c_d·w (+ bonus if they agree)
//   state      Tracking if c_d > tracking_confidence, else Occluded
//
// A locked tracker with no match is Occluded until `miss_limit` consecutive
// misses, then Lost and unlocked. Unlocked trackers without a match keep
// the template-only result unchanged.

use tracing::{debug, info};

use crate::config::{FusionConfig, TrackingConfig};
use crate::detection::Detection;
use crate::image::Image;
use crate::tracker::{is_placeholder_label, Commit, LabelStatus, TemplateStep, TrackState, Tracker};

/// Bonus added to the locked tracker's detector weight.
const LOCK_WEIGHT_BONUS: f32 = 0.4;
/// Floor on the detection confidence used as a weight multiplier.
const MIN_WEIGHT_CONFIDENCE: f32 = 0.35;
/// Ceiling on the detector weight.
const MAX_DETECTOR_WEIGHT: f32 = 0.9;
/// First-contact matching radius as a multiple of the search radius.
const FIRST_CONTACT_FACTOR: f32 = 1.5;

/// How a tracker was paired with a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Same persistent detector id as last frame.
    Id,
    /// Nearest detection center.
    Proximity,
}

/// Result of pass 1 for one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionOutcome {
    /// Matched detection `index`.
    Matched { index: usize, kind: MatchKind },
    /// Locked, but the detection was missing this frame.
    Missed { misses: u32 },
    /// The lock was dropped after too many misses.
    LockLost,
    /// No detector involvement; template-only result.
    TemplateOnly,
}

/// Position and confidence after blending a template step with a detection.
pub fn blend(step: &TemplateStep, det: &Detection, locked: bool, tracking: &TrackingConfig, fusion: &FusionConfig) -> Commit {
    let (dx, dy) = det.center();
    let det_conf = det.confidence * 100.0;
    let state = if det.confidence > fusion.tracking_confidence {
        TrackState::Tracking
    } else {
        TrackState::Occluded
    };

    if fusion.detector_dominant {
        return Commit {
            position: (dx, dy),
            state,
            confidence: (step.confidence as f32).max(det_conf).round().clamp(0.0, 100.0) as u8,
        };
    }

    let w = detector_weight(fusion.yolo_weight, locked, det.confidence);
    let (tx, ty) = step.position;
    let position = (tx * (1.0 - w) + dx * w, ty * (1.0 - w) + dy * w);

    let mut confidence = step.confidence as f32 * (1.0 - w) + det_conf * w;
    let agree_radius = fusion.agreement_radius_for(tracking);
    if let Some(m) = step.matched {
        let d = ((m.x as f32 - dx).powi(2) + (m.y as f32 - dy).powi(2)).sqrt();
        if d <= agree_radius {
            confidence += fusion.agreement_bonus;
        }
    }

    Commit {
        position,
        state,
        confidence: confidence.round().clamp(0.0, 100.0) as u8,
    }
}

/// `min(0.9, (base + 0.4·[locked]) · max(0.35, confidence))`
pub fn detector_weight(base: f32, locked: bool, confidence: f32) -> f32 {
    let lock_bonus = if locked { LOCK_WEIGHT_BONUS } else { 0.0 };
    ((base + lock_bonus) * confidence.max(MIN_WEIGHT_CONFIDENCE)).min(MAX_DETECTOR_WEIGHT)
}

/// Replace a placeholder label with the detector's class label, unless the
/// label was ever confirmed.
pub fn adopt_label(tracker: &mut Tracker, det: &Detection) -> bool {
    if tracker.label_status == LabelStatus::Confirmed || !is_placeholder_label(&tracker.label) {
        return false;
    }
    if det.label.is_empty() {
        return false;
    }
    debug!(tracker = tracker.id, from = %tracker.label, to = %det.label, "adopting detector label");
    tracker.label = det.label.clone();
    tracker.label_status = LabelStatus::Detected;
    true
}

/// Per-frame fusion state.
pub struct FusionPass<'a> {
    frame: &'a Image<u8>,
    detections: &'a [Detection],
    tracking: &'a TrackingConfig,
    fusion: &'a FusionConfig,
    claimed: Vec<bool>,
    timestamp: f64,
}

impl<'a> FusionPass<'a> {
    pub fn new(
        frame: &'a Image<u8>,
        detections: &'a [Detection],
        tracking: &'a TrackingConfig,
        fusion: &'a FusionConfig,
        timestamp: f64,
    ) -> Self {
        FusionPass {
            frame,
            detections,
            tracking,
            fusion,
            claimed: vec![false; detections.len()],
            timestamp,
        }
    }

    /// Whether detection `index` has been claimed this frame.
    pub fn is_claimed(&self, index: usize) -> bool {
        self.claimed.get(index).copied().unwrap_or(false)
    }

    fn usable(&self, index: usize) -> bool {
        !self.claimed[index] && self.detections[index].confidence > self.fusion.min_detection_confidence
    }

    /// The confidence floor does not apply: a locked tracker whose id is
    /// still reported is matched, however weak the box.
    fn find_by_id(&self, track_id: u32) -> Option<usize> {
        (0..self.detections.len())
            .find(|&i| !self.claimed[i] && self.detections[i].track_id == Some(track_id))
    }

    /// Nearest usable detection within `radius` of (x, y) that passes
    /// `accept`. Ties keep the earlier detection.
    fn find_nearest(&self, x: f32, y: f32, radius: f32, accept: impl Fn(&Detection) -> bool) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for i in 0..self.detections.len() {
            if !self.usable(i) || !accept(&self.detections[i]) {
                continue;
            }
            let d = self.detections[i].distance_to(x, y);
            if d <= radius && best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Pass 1: template step, detector matching, blend, commit.
    pub fn update_tracker(&mut self, tracker: &mut Tracker) -> FusionOutcome {
        let step = tracker.observe(self.frame, self.tracking);
        let lock = tracker.detector.track_id;

        let mut found = lock.and_then(|id| self.find_by_id(id)).map(|i| (i, MatchKind::Id));
        if found.is_none() && tracker.state != TrackState::Lost {
            let radius = self.tracking.search_radius as f32 * FIRST_CONTACT_FACTOR;
            found = self
                .find_nearest(tracker.x, tracker.y, radius, |_| true)
                .map(|i| (i, MatchKind::Proximity));
        }

        match found {
            Some((index, kind)) => {
                self.claimed[index] = true;
                let det = &self.detections[index];
                let commit = blend(&step, det, kind == MatchKind::Id, self.tracking, self.fusion);
                self.link(tracker, det);
                tracker.commit(self.frame, self.tracking, commit, self.timestamp);
                FusionOutcome::Matched { index, kind }
            }
            None if lock.is_some() => {
                let link = &mut tracker.detector;
                link.misses += 1;
                let misses = link.misses;
                let (state, outcome) = if misses >= self.fusion.miss_limit() {
                    debug!(tracker = tracker.id, lock = ?lock, misses, "detector lock lost");
                    link.track_id = None;
                    link.misses = 0;
                    (TrackState::Lost, FusionOutcome::LockLost)
                } else {
                    (TrackState::Occluded, FusionOutcome::Missed { misses })
                };
                let commit = Commit { state, ..Commit::from(step) };
                tracker.commit(self.frame, self.tracking, commit, self.timestamp);
                outcome
            }
            None => {
                tracker.commit(self.frame, self.tracking, step.into(), self.timestamp);
                FusionOutcome::TemplateOnly
            }
        }
    }

    /// Pass 2: snap a lost tracker onto a nearby unclaimed detection.
    /// Returns the claimed detection index.
    pub fn reacquire(&mut self, tracker: &mut Tracker) -> Option<usize> {
        if tracker.state != TrackState::Lost {
            return None;
        }
        let radius = self.fusion.reacquire_radius_for(self.tracking);
        let min_conf = self.fusion.reacquire_min_confidence;
        let index = self.find_nearest(tracker.x, tracker.y, radius, |d| d.confidence > min_conf)?;

        self.claimed[index] = true;
        let det = &self.detections[index];
        let (cx, cy) = det.center();
        info!(
            tracker = tracker.id,
            lost_frames = tracker.lost_frames,
            detection = det.id,
            label = %det.label,
            "re-acquired lost tracker from detection"
        );
        let confidence = (det.confidence * 100.0).round().clamp(0.0, 100.0) as u8;
        tracker.snap_to(self.frame, cx, cy, confidence, self.timestamp);
        self.link(tracker, det);
        Some(index)
    }

    fn link(&self, tracker: &mut Tracker, det: &Detection) {
        let link = &mut tracker.detector;
        if det.track_id.is_some() && det.track_id != link.track_id {
            debug!(tracker = tracker.id, track_id = ?det.track_id, "locked to detector track");
        }
        link.track_id = det.track_id;
        link.label = Some(det.label.clone());
        link.confidence = det.confidence;
        link.misses = 0;
        link.last_seen_at = Some(self.timestamp);
        adopt_label(tracker, det);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    fn tracking() -> TrackingConfig {
        TrackingConfig {
            search_radius: 10,
            search_step: 2,
            refine_radius: 2,
            template_size: 15,
            ..TrackingConfig::default()
        }
    }

    fn frame() -> Image<u8> {
        let mut img = Image::filled(120, 120, 25u8);
        for y in 0..24 {
            for x in 0..24 {
                img.set(48 + x, 48 + y, (50 + (x * x + 3 * y * y + x * y) / 12) as u8);
            }
        }
        img
    }

    fn det(id: u32, cx: f32, cy: f32, conf: f32) -> Detection {
        Detection::new(id, "cup", conf, BoundingBox::from_center(cx, cy, 20.0, 20.0))
    }

    fn step_at(x: f32, y: f32, confidence: u8) -> TemplateStep {
        TemplateStep {
            predicted: (x, y),
            matched: None,
            score: 0.5,
            confidence,
            state: TrackState::Lost,
            position: (x, y),
        }
    }

    #[test]
    fn test_detector_weight() {
        assert!((detector_weight(0.5, false, 1.0) - 0.5).abs() < 1e-6);
        assert!((detector_weight(0.5, false, 0.1) - 0.175).abs() < 1e-6);
        assert!((detector_weight(0.5, true, 1.0) - 0.9).abs() < 1e-6);
        assert!((detector_weight(0.5, true, 0.5) - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_blend() {
        let t = tracking();
        let f = FusionConfig::default();
        let step = step_at(40.0, 40.0, 60);
        let c = blend(&step, &det(0, 50.0, 40.0, 1.0), false, &t, &f);
        assert!((c.position.0 - 45.0).abs() < 1e-4);
        assert_eq!(c.position.1, 40.0);
        // 60·0.5 + 100·0.5, no agreement bonus (no template match)
        assert_eq!(c.confidence, 80);
        assert_eq!(c.state, TrackState::Tracking);
    }

    #[test]
    fn test_agreement_bonus() {
        let t = tracking();
        let f = FusionConfig::default();
        let mut step = step_at(40.0, 40.0, 60);
        step.matched = Some(crate::search::MatchResult { x: 42, y: 40, score: 0.1 });
        let c = blend(&step, &det(0, 44.0, 40.0, 0.8), false, &t, &f);
        // w = 0.4 → 60·0.6 + 80·0.4 = 68, +10 bonus
        assert_eq!(c.confidence, 78);
    }

    #[test]
    fn test_dominant_blend() {
        let t = tracking();
        let f = FusionConfig { detector_dominant: true, ..FusionConfig::default() };
        let c = blend(&step_at(40.0, 40.0, 90), &det(0, 70.0, 20.0, 0.2), true, &t, &f);
        assert_eq!(c.position, (70.0, 20.0));
        assert_eq!(c.confidence, 90);
        assert_eq!(c.state, TrackState::Occluded);

        // Detector more confident than the template: its confidence wins.
        let c = blend(&step_at(40.0, 40.0, 30), &det(0, 44.0, 42.0, 0.8), false, &t, &f);
        assert_eq!(c.position, (44.0, 42.0));
        assert_eq!(c.confidence, 80);
        assert_eq!(c.state, TrackState::Tracking);
    }

    #[test]
    fn test_label_adoption_policy() {
        let img = frame();
        let t = tracking();
        let mut tr = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        assert!(adopt_label(&mut tr, &det(0, 60.0, 60.0, 0.9)));
        assert_eq!(tr.label, "cup");
        assert_eq!(tr.label_status, LabelStatus::Detected);
        // Already replaced: no longer a placeholder.
        let mut other = det(0, 60.0, 60.0, 0.9);
        other.label = "bowl".into();
        assert!(!adopt_label(&mut tr, &other));

        let mut pinned = Tracker::new(2, "Target 2", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        pinned.confirm_label("Target 2");
        assert!(!adopt_label(&mut pinned, &other));
        assert_eq!(pinned.label, "Target 2");
    }

    #[test]
    fn test_first_contact_adopts_track_id() {
        let img = frame();
        let t = tracking();
        let f = FusionConfig::default();
        let mut tr = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        let dets = vec![det(0, 100.0, 100.0, 0.9).with_track_id(3), det(1, 62.0, 61.0, 0.9).with_track_id(7)];
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 1.0);
        let outcome = pass.update_tracker(&mut tr);
        assert_eq!(outcome, FusionOutcome::Matched { index: 1, kind: MatchKind::Proximity });
        assert_eq!(tr.detector.track_id, Some(7));
        assert!(pass.is_claimed(1));
        assert!(!pass.is_claimed(0));
        assert_eq!(tr.state, TrackState::Tracking);
    }

    #[test]
    fn test_claimed_detection_not_shared() {
        let img = frame();
        let t = tracking();
        let f = FusionConfig::default();
        let mut a = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        let mut b = Tracker::new(2, "Target 2", [0; 3], &img, 61.0, 60.0, &t, 0.0).unwrap();
        let dets = vec![det(0, 60.0, 60.0, 0.9)];
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 1.0);
        assert!(matches!(pass.update_tracker(&mut a), FusionOutcome::Matched { .. }));
        assert_eq!(pass.update_tracker(&mut b), FusionOutcome::TemplateOnly);
    }

    #[test]
    fn test_miss_accounting_and_lock_loss() {
        let img = frame();
        let t = tracking();
        let f = FusionConfig { target_fps: 6.0, ..FusionConfig::default() }; // limit 3
        let mut tr = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        tr.detector.track_id = Some(5);

        // A detection with another id, far away: neither id nor proximity match.
        let dets = vec![det(0, 110.0, 10.0, 0.9).with_track_id(6)];
        for expected in 1..3 {
            let mut pass = FusionPass::new(&img, &dets, &t, &f, expected as f64);
            assert_eq!(pass.update_tracker(&mut tr), FusionOutcome::Missed { misses: expected });
            assert_eq!(tr.state, TrackState::Occluded);
        }
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 3.0);
        assert_eq!(pass.update_tracker(&mut tr), FusionOutcome::LockLost);
        assert_eq!(tr.state, TrackState::Lost);
        assert_eq!(tr.detector.track_id, None);

        // Unlocked now: a miss no longer overrides the template state.
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 4.0);
        assert_eq!(pass.update_tracker(&mut tr), FusionOutcome::TemplateOnly);
        assert_eq!(tr.state, TrackState::Tracking);
    }

    #[test]
    fn test_id_match_resets_misses() {
        let img = frame();
        let t = tracking();
        let f = FusionConfig::default();
        let mut tr = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        tr.detector.track_id = Some(5);
        tr.detector.misses = 4;
        // Id match wins even though another detection is closer.
        let dets = vec![det(0, 60.0, 60.0, 0.9).with_track_id(9), det(1, 70.0, 66.0, 0.9).with_track_id(5)];
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 1.0);
        assert_eq!(pass.update_tracker(&mut tr), FusionOutcome::Matched { index: 1, kind: MatchKind::Id });
        assert_eq!(tr.detector.misses, 0);
        assert_eq!(tr.detector.last_seen_at, Some(1.0));
    }

    #[test]
    fn test_weak_box_with_locked_id_still_matches() {
        let img = frame();
        let t = tracking();
        let f = FusionConfig::default();
        let mut tr = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        tr.detector.track_id = Some(5);
        tr.detector.misses = 1;
        let dets = vec![det(0, 60.0, 60.0, 0.02).with_track_id(5)];
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 1.0);
        assert_eq!(pass.update_tracker(&mut tr), FusionOutcome::Matched { index: 0, kind: MatchKind::Id });
        assert_eq!(tr.detector.misses, 0);
        assert_eq!(tr.state, TrackState::Occluded);

        // The same weak box is invisible to an unlocked tracker.
        let mut free = Tracker::new(2, "Target 2", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 1.0);
        assert_eq!(pass.update_tracker(&mut free), FusionOutcome::TemplateOnly);
    }

    #[test]
    fn test_reacquire_requires_confidence_and_radius() {
        let img = frame();
        let t = tracking(); // reacquire radius 20
        let f = FusionConfig::default();
        let mut tr = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        tr.state = TrackState::Lost;
        tr.lost_frames = 12;

        let dets = vec![det(0, 65.0, 60.0, 0.3), det(1, 90.0, 60.0, 0.9), det(2, 70.0, 70.0, 0.5)];
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 2.0);
        assert_eq!(pass.reacquire(&mut tr), Some(2));
        assert_eq!(tr.state, TrackState::Tracking);
        assert_eq!(tr.lost_frames, 0);
        assert_eq!(tr.position(), (70.0, 70.0));
        assert_eq!(tr.confidence, 50);
        assert_eq!(tr.label, "cup");
    }

    #[test]
    fn test_reacquire_skips_claimed_and_non_lost() {
        let img = frame();
        let t = tracking();
        let f = FusionConfig::default();
        let mut a = Tracker::new(1, "Target 1", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        let mut b = Tracker::new(2, "Target 2", [0; 3], &img, 60.0, 60.0, &t, 0.0).unwrap();
        b.state = TrackState::Lost;

        let dets = vec![det(0, 62.0, 60.0, 0.9)];
        let mut pass = FusionPass::new(&img, &dets, &t, &f, 1.0);
        assert_eq!(pass.reacquire(&mut a), None);
        pass.update_tracker(&mut a);
        assert!(pass.is_claimed(0));
        assert_eq!(pass.reacquire(&mut b), None);
        assert_eq!(b.state, TrackState::Lost);
    }
}
