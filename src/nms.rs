// nms.rs — Keypoint type and spacing-based non-maximum suppression.
//
// Anchor selection wants a handful of well-separated points around a click,
// not one point per grid cell, so suppression here is greedy by score with
// a minimum Euclidean spacing:
//
//   1. Sort candidates by score (descending; ties keep input order).
//   2. Accept a candidate if it is at least `min_spacing` px from every
//      accepted point.
//   3. Stop at `max_count`.
//
// Pinned candidates (the click point) are accepted first regardless of
// score.

/// Where a keypoint came from. Ordering matters for ranking: a click point
/// always wins, corners are preferred over edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypointKind {
    /// The user-designated point itself.
    Click,
    /// Harris corner.
    Corner,
    /// Gradient-magnitude ridge (edge).
    Edge,
    /// Synthetic point placed when texture is too sparse.
    Fill,
}

/// A candidate point with a ranking score.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Higher is better. Comparable across kinds after weighting.
    pub score: f32,
    pub kind: KeypointKind,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, score: f32, kind: KeypointKind) -> Self {
        Keypoint { x, y, score, kind }
    }

    #[inline]
    pub fn distance_to(&self, other: &Keypoint) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Greedy spacing suppression.
pub struct SpacingNms {
    /// Minimum distance in pixels between two accepted keypoints.
    pub min_spacing: f32,
    /// Maximum number of keypoints to keep.
    pub max_count: usize,
}

impl SpacingNms {
    /// # Panics
    /// Panics if `min_spacing` is not positive.
    pub fn new(min_spacing: f32, max_count: usize) -> Self {
        assert!(min_spacing > 0.0, "min_spacing must be > 0");
        SpacingNms {
            min_spacing,
            max_count,
        }
    }

    /// Select well-separated keypoints.
    ///
    /// `pinned` are accepted first, in order, without a spacing check
    /// against each other. `candidates` are then considered by score.
    pub fn suppress(&self, pinned: &[Keypoint], candidates: &[Keypoint]) -> Vec<Keypoint> {
        let mut kept: Vec<Keypoint> = pinned.iter().take(self.max_count).cloned().collect();

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        // Stable sort keeps detection order among equal scores.
        order.sort_by(|&a, &b| candidates[b].score.total_cmp(&candidates[a].score));

        for i in order {
            if kept.len() >= self.max_count {
                break;
            }
            let c = &candidates[i];
            if kept.iter().all(|k| k.distance_to(c) >= self.min_spacing) {
                kept.push(c.clone());
            }
        }
        kept
    }
}
