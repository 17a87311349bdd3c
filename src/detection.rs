// detection.rs — Detector output, as consumed by the fusion layer.
//
// The detector itself is out of process; all the tracker needs per frame is
// a snapshot of labeled boxes in frame pixel coordinates. Boxes are stored
// as corners; center and size are derived.

use serde::{Deserialize, Serialize};

/// Axis-aligned box, `x1 <= x2`, `y1 <= y2`, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Build from two corners in any order.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        BoundingBox {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Box of the given size centered on (cx, cy).
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        let (hw, hh) = (width.abs() * 0.5, height.abs() * 0.5);
        BoundingBox::new(cx - hw, cy - hh, cx + hw, cy + hh)
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

/// One labeled box from the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Per-frame detection id.
    pub id: u32,
    /// Numeric class id.
    pub class: u32,
    /// Human-readable class label.
    pub label: String,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Persistent id assigned by the detector's own tracker, if any.
    #[serde(default)]
    pub track_id: Option<u32>,
    /// Detector-estimated velocity in px/frame, if any.
    #[serde(default)]
    pub velocity: Option<(f32, f32)>,
}

impl Detection {
    pub fn new(id: u32, label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Detection {
            id,
            class: 0,
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            track_id: None,
            velocity: None,
        }
    }

    /// Attach a persistent detector track id.
    pub fn with_track_id(mut self, track_id: u32) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_class(mut self, class: u32) -> Self {
        self.class = class;
        self
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    /// Euclidean distance from the box center to (x, y).
    pub fn distance_to(&self, x: f32, y: f32) -> f32 {
        let (cx, cy) = self.center();
        ((cx - x).powi(2) + (cy - y).powi(2)).sqrt()
    }
}
