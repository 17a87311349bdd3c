// anchor.rs — Rigid-body anchor sub-tracker.
//
// A single point template can rotate out of alignment or get covered
// without its score noticing. An `AnchorSet` tracks several small
// well-textured points around the designated object instead, and uses the
// fact that they move as one rigid body to throw out bad matches.
//
// Creation (once, at designation):
//   1. Crop a window around the click, Harris corners + edge ridges.
//   2. Rank: corners score R/R_max × 2, ridges |∇|/|∇|_max.
//   3. The click itself is always the first anchor.
//   4. Spacing NMS up to `max_anchors`; if fewer than `min_anchors`
//      survive, halve the spacing (down to 2 px), then fall back to
//      synthetic ring points.
//   5. Record each anchor's offset from the click and every pairwise
//      distance.
//
// Per frame:
//   1. NCC search per anchor (`track_anchors`)
//   2. Pairwise distances vs. creation distances; an anchor in two or more
//      pairs off by more than `distance_tolerance` is an outlier
//      (`enforce_rigidity`)
//   3. coherence = max(0, 1 − 2·mean relative error) over surviving pairs
//   4. consensus = confidence-weighted mean of (anchor − offset), or the
//      external flow estimate if too few anchors survive or coherence is
//      low
//   5. final = confidence-weighted mix of consensus and flow estimate
//   6. invalid anchors are re-seeded at center + offset

use tracing::debug;

use crate::config::AnchorConfig;
use crate::error::{Result, TrackError};
use crate::harris::{detect_edge_ridges, HarrisDetector};
use crate::image::Image;
use crate::ncc::NccTemplate;
use crate::nms::{Keypoint, KeypointKind, SpacingNms};
use crate::template::Template;

/// Corner scores are scaled by this so they rank above edges.
const CORNER_WEIGHT: f32 = 2.0;
/// Harris responses below this fraction of the window maximum are dropped.
const CORNER_FRACTION: f32 = 0.01;
/// Ridges below this fraction of the strongest gradient are dropped.
const EDGE_FRACTION: f32 = 0.2;
/// Spacing relaxation stops here.
const MIN_RELAXED_SPACING: f32 = 2.0;
/// Extra pixels cropped around the detection window for filter support.
const WINDOW_MARGIN: usize = 4;
/// Directions tried for synthetic ring anchors.
const FILL_DIRECTIONS: usize = 8;
/// Number of violating pairs that marks an anchor as an outlier.
const OUTLIER_VIOLATIONS: u32 = 2;

/// One tracked anchor point.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub x: f32,
    pub y: f32,
    pub prev_x: f32,
    pub prev_y: f32,
    /// Fixed offset from the set's nominal center.
    pub offset: (f32, f32),
    /// Last NCC score, halved when rejected as an outlier.
    pub confidence: f32,
    pub valid: bool,
    pub kind: KeypointKind,
    template: NccTemplate,
}

impl Anchor {
    #[inline]
    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    /// Object center implied by this anchor.
    #[inline]
    pub fn implied_center(&self) -> (f32, f32) {
        (self.x - self.offset.0, self.y - self.offset.1)
    }

    /// Move the anchor, remembering where it was.
    pub fn move_to(&mut self, x: f32, y: f32) {
        self.prev_x = self.x;
        self.prev_y = self.y;
        self.x = x;
        self.y = y;
    }

    fn distance_to(&self, other: &Anchor) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Result of one anchor update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorEstimate {
    /// Final blended center.
    pub position: (f32, f32),
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Anchor-only consensus center; `None` on fallback.
    pub consensus: Option<(f32, f32)>,
    pub coherence: f32,
    pub surviving: usize,
    /// True when the anchors were not trusted and the flow estimate was
    /// used as-is.
    pub fallback: bool,
}

/// Rigidly constrained constellation of anchors around one object.
#[derive(Debug, Clone)]
pub struct AnchorSet {
    pub name: String,
    anchors: Vec<Anchor>,
    /// Row-major `n × n` pairwise distances at creation.
    expected: Vec<f32>,
    center: (f32, f32),
    coherence: f32,
    surviving: usize,
    config: AnchorConfig,
}

impl AnchorSet {
    /// Detect anchors around (cx, cy) and build a set from them.
    pub fn detect(
        frame: &Image<u8>,
        cx: f32,
        cy: f32,
        name: impl Into<String>,
        config: &AnchorConfig,
    ) -> Result<AnchorSet> {
        let points = select_anchor_points(frame, cx, cy, config);
        AnchorSet::from_points(frame, (cx, cy), &points, name, config)
    }

    /// Build a set from explicit anchor points around `center`.
    ///
    /// Fails if an anchor window leaves the frame or fewer than
    /// `min_anchors` points carry enough texture to correlate.
    pub fn from_points(
        frame: &Image<u8>,
        center: (f32, f32),
        points: &[Keypoint],
        name: impl Into<String>,
        config: &AnchorConfig,
    ) -> Result<AnchorSet> {
        let size = config.anchor_template_size;
        let mut anchors = Vec::with_capacity(points.len());
        for p in points.iter().take(config.max_anchors) {
            let (x, y) = (p.x.round(), p.y.round());
            let template = Template::try_extract(frame, x, y, size)?;
            let Some(ncc) = NccTemplate::new(&template) else {
                debug!(x, y, kind = ?p.kind, "skipping flat anchor");
                continue;
            };
            anchors.push(Anchor {
                x,
                y,
                prev_x: x,
                prev_y: y,
                offset: (x - center.0, y - center.1),
                confidence: 1.0,
                valid: true,
                kind: p.kind,
                template: ncc,
            });
        }

        if anchors.len() < config.min_anchors {
            return Err(TrackError::InsufficientAnchors {
                found: anchors.len(),
                required: config.min_anchors,
            });
        }

        let n = anchors.len();
        let mut expected = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                expected[i * n + j] = anchors[i].distance_to(&anchors[j]);
            }
        }

        let name = name.into();
        debug!(name = %name, anchors = n, "anchor set created");
        Ok(AnchorSet {
            name,
            anchors,
            expected,
            center,
            coherence: 1.0,
            surviving: n,
            config: config.clone(),
        })
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn anchors_mut(&mut self) -> &mut [Anchor] {
        &mut self.anchors
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Nominal center.
    pub fn center(&self) -> (f32, f32) {
        self.center
    }

    pub fn coherence(&self) -> f32 {
        self.coherence
    }

    pub fn surviving(&self) -> usize {
        self.surviving
    }

    /// Distance between anchors `i` and `j` at creation.
    pub fn expected_distance(&self, i: usize, j: usize) -> f32 {
        self.expected[i * self.anchors.len() + j]
    }

    /// Step 1: independent NCC search for every anchor.
    pub fn track_anchors(&mut self, frame: &Image<u8>) {
        let radius = self.config.search_radius;
        let min_ncc = self.config.min_ncc;
        for a in &mut self.anchors {
            let found = a
                .template
                .search(frame, a.x.round() as isize, a.y.round() as isize, radius);
            match found {
                Some(m) if m.score >= min_ncc => {
                    a.move_to(m.x as f32, m.y as f32);
                    a.confidence = m.score;
                    a.valid = true;
                }
                other => {
                    a.confidence = other.map_or(0.0, |m| m.score.max(0.0));
                    a.valid = false;
                }
            }
        }
    }

    /// Steps 2–3: pairwise distance check, outlier rejection, coherence.
    /// Returns the number of anchors rejected.
    pub fn enforce_rigidity(&mut self) -> usize {
        let n = self.anchors.len();
        let tolerance = self.config.distance_tolerance;
        let mut violations = vec![0u32; n];

        for i in 0..n {
            for j in (i + 1)..n {
                if !(self.anchors[i].valid && self.anchors[j].valid) {
                    continue;
                }
                if let Some(err) = self.pair_error(i, j) {
                    if err > tolerance {
                        violations[i] += 1;
                        violations[j] += 1;
                    }
                }
            }
        }

        let mut rejected = 0;
        for (i, a) in self.anchors.iter_mut().enumerate() {
            if a.valid && violations[i] >= OUTLIER_VIOLATIONS {
                a.valid = false;
                a.confidence *= 0.5;
                rejected += 1;
                debug!(set = %self.name, anchor = i, violations = violations[i], "rejected outlier anchor");
            }
        }

        let mut error_sum = 0.0f32;
        let mut pairs = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                if !(self.anchors[i].valid && self.anchors[j].valid) {
                    continue;
                }
                if let Some(err) = self.pair_error(i, j) {
                    error_sum += err;
                    pairs += 1;
                }
            }
        }
        self.coherence = if pairs == 0 {
            0.0
        } else {
            (1.0 - 2.0 * error_sum / pairs as f32).max(0.0)
        };
        self.surviving = self.anchors.iter().filter(|a| a.valid).count();
        rejected
    }

    /// Relative deviation of a pair's distance from its creation distance.
    fn pair_error(&self, i: usize, j: usize) -> Option<f32> {
        let expected = self.expected_distance(i, j);
        if expected <= f32::EPSILON {
            return None;
        }
        let current = self.anchors[i].distance_to(&self.anchors[j]);
        Some((current - expected).abs() / expected)
    }

    /// Steps 4–6 given the current anchor states and an external
    /// single-point estimate with confidence in [0, 1].
    pub fn estimate(&mut self, flow: (f32, f32), flow_confidence: f32) -> AnchorEstimate {
        let flow_confidence = flow_confidence.clamp(0.0, 1.0);
        let consensus = if self.surviving < self.config.min_anchors || self.coherence < self.config.min_coherence {
            None
        } else {
            self.consensus()
        };

        let estimate = match consensus {
            None => AnchorEstimate {
                position: flow,
                confidence: self.config.fallback_confidence,
                consensus: None,
                coherence: self.coherence,
                surviving: self.surviving,
                fallback: true,
            },
            Some((center, mean_conf)) => {
                let anchor_conf = (self.coherence * mean_conf).clamp(0.0, 1.0);
                let wa = self.config.anchor_weight * anchor_conf;
                let wf = (1.0 - self.config.anchor_weight) * flow_confidence;
                let (wa, wf) = if wa + wf > 0.0 {
                    (wa, wf)
                } else {
                    (self.config.anchor_weight, 1.0 - self.config.anchor_weight)
                };
                let total = wa + wf;
                let position = (
                    (center.0 * wa + flow.0 * wf) / total,
                    (center.1 * wa + flow.1 * wf) / total,
                );
                AnchorEstimate {
                    position,
                    confidence: self.config.anchor_weight * anchor_conf
                        + (1.0 - self.config.anchor_weight) * flow_confidence,
                    consensus: Some(center),
                    coherence: self.coherence,
                    surviving: self.surviving,
                    fallback: false,
                }
            }
        };

        self.center = estimate.position;
        self.reseed_invalid();
        estimate
    }

    /// Full per-frame update.
    pub fn update(&mut self, frame: &Image<u8>, flow: (f32, f32), flow_confidence: f32) -> AnchorEstimate {
        self.track_anchors(frame);
        self.enforce_rigidity();
        self.estimate(flow, flow_confidence)
    }

    /// Confidence-weighted mean of the valid anchors' implied centers, and
    /// their mean confidence.
    fn consensus(&self) -> Option<((f32, f32), f32)> {
        let valid: Vec<&Anchor> = self.anchors.iter().filter(|a| a.valid).collect();
        if valid.is_empty() {
            return None;
        }
        let weight_sum: f32 = valid.iter().map(|a| a.confidence.max(0.0)).sum();
        let (mut sx, mut sy) = (0.0f32, 0.0f32);
        for a in &valid {
            let w = if weight_sum > 0.0 { a.confidence.max(0.0) } else { 1.0 };
            let (ix, iy) = a.implied_center();
            sx += ix * w;
            sy += iy * w;
        }
        let norm = if weight_sum > 0.0 { weight_sum } else { valid.len() as f32 };
        let mean_conf = weight_sum / valid.len() as f32;
        Some(((sx / norm, sy / norm), mean_conf))
    }

    fn reseed_invalid(&mut self) {
        let (cx, cy) = self.center;
        for a in self.anchors.iter_mut().filter(|a| !a.valid) {
            a.move_to((cx + a.offset.0).round(), (cy + a.offset.1).round());
        }
    }
}

/// Candidate anchor points around a click, best first, click included.
pub fn select_anchor_points(frame: &Image<u8>, cx: f32, cy: f32, config: &AnchorConfig) -> Vec<Keypoint> {
    let size = config.anchor_template_size;
    let radius = config.detection_radius as f32;
    let (px, py) = (cx.round(), cy.round());
    let click = Keypoint::new(px, py, 0.0, KeypointKind::Click);

    let reach = config.detection_radius + WINDOW_MARGIN;
    let side = 2 * reach + 1;
    let (window, ox, oy) = frame.crop_clipped(px as isize - reach as isize, py as isize - reach as isize, side, side);
    if window.width() < 5 || window.height() < 5 {
        return vec![click];
    }

    let usable = |x: f32, y: f32| {
        ((x - px).powi(2) + (y - py).powi(2)).sqrt() <= radius
            && Template::extract(frame, x, y, size)
                .and_then(|t| NccTemplate::new(&t))
                .is_some()
    };

    let mut candidates = Vec::new();
    let harris = HarrisDetector::new(config.harris_k, 1);
    let corners = harris.detect_relative(&window, CORNER_FRACTION);
    if let Some(max) = corners.first().map(|c| c.score) {
        for c in &corners {
            let (x, y) = (c.x + ox as f32, c.y + oy as f32);
            if usable(x, y) {
                candidates.push(Keypoint::new(x, y, c.score / max * CORNER_WEIGHT, KeypointKind::Corner));
            }
        }
    }
    let ridges = detect_edge_ridges(&window, EDGE_FRACTION);
    if let Some(max) = ridges.first().map(|r| r.score) {
        for r in &ridges {
            let (x, y) = (r.x + ox as f32, r.y + oy as f32);
            if usable(x, y) {
                candidates.push(Keypoint::new(x, y, r.score / max, KeypointKind::Edge));
            }
        }
    }

    let mut spacing = config.min_spacing;
    let mut selected = SpacingNms::new(spacing, config.max_anchors).suppress(&[click.clone()], &candidates);
    while selected.len() < config.min_anchors && spacing > MIN_RELAXED_SPACING {
        spacing = (spacing * 0.5).max(MIN_RELAXED_SPACING);
        selected = SpacingNms::new(spacing, config.max_anchors).suppress(&[click.clone()], &candidates);
    }

    if selected.len() < config.min_anchors {
        let ring = config.min_spacing.max(size as f32);
        for k in 0..FILL_DIRECTIONS {
            if selected.len() >= config.min_anchors {
                break;
            }
            let angle = k as f32 * std::f32::consts::TAU / FILL_DIRECTIONS as f32;
            let (x, y) = ((px + ring * angle.cos()).round(), (py + ring * angle.sin()).round());
            let p = Keypoint::new(x, y, 0.0, KeypointKind::Fill);
            let spaced = selected.iter().all(|s| s.distance_to(&p) >= MIN_RELAXED_SPACING);
            if spaced && usable(x, y) {
                selected.push(p);
            }
        }
    }

    debug!(
        x = px,
        y = py,
        corners = corners.len(),
        ridges = ridges.len(),
        selected = selected.len(),
        "anchor candidates"
    );
    selected
}
