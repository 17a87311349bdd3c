// template.rs — Square intensity templates.
//
// A template is the appearance model of a tracked point: a `size × size`
// luma patch centered on the point, `size` odd so the point sits on the
// center pixel. Templates never change size after creation; only their
// content is refreshed, by exponential blending toward a freshly extracted
// patch:
//
//   current = current·(1 − rate) + fresh·rate
//
// Extraction is bounds-checked. A window that would leave the frame yields
// `None` rather than a truncated patch.

use crate::error::{Result, TrackError};
use crate::image::Image;

/// Smallest template side length accepted for point trackers.
pub const MIN_TEMPLATE_SIZE: usize = 15;

/// A square luma patch with odd side length.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    patch: Image<u8>,
}

impl Template {
    /// Extract a template centered on the pixel nearest to (x, y).
    ///
    /// Returns `None` if `size` is even or the window leaves the frame.
    pub fn extract(frame: &Image<u8>, x: f32, y: f32, size: usize) -> Option<Template> {
        if size % 2 == 0 {
            return None;
        }
        let cx = x.round() as isize;
        let cy = y.round() as isize;
        frame
            .crop_centered(cx, cy, size / 2)
            .map(|patch| Template { patch })
    }

    /// Like `extract`, but reports why extraction failed.
    pub fn try_extract(frame: &Image<u8>, x: f32, y: f32, size: usize) -> Result<Template> {
        Template::extract(frame, x, y, size).ok_or(TrackError::TemplateOutOfBounds { x, y, size })
    }

    /// Wrap an existing square patch.
    ///
    /// # Panics
    /// Panics if the patch is not square with odd side length.
    pub fn from_patch(patch: Image<u8>) -> Template {
        assert_eq!(patch.width(), patch.height(), "template patch must be square");
        assert!(patch.width() % 2 == 1, "template side must be odd (got {})", patch.width());
        Template { patch }
    }

    /// Side length in pixels.
    #[inline]
    pub fn size(&self) -> usize {
        self.patch.width()
    }

    /// Half side length: the center pixel's offset from the patch edge.
    #[inline]
    pub fn half(&self) -> usize {
        self.patch.width() / 2
    }

    #[inline]
    pub fn patch(&self) -> &Image<u8> {
        &self.patch
    }

    /// Raw row-major template bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.patch.as_slice()
    }

    /// Blend `fresh` into this template with weight `rate` ∈ [0, 1].
    ///
    /// # Panics
    /// Panics if the two templates differ in size.
    pub fn blend(&mut self, fresh: &Template, rate: f32) {
        assert_eq!(self.size(), fresh.size(), "cannot blend templates of different size");
        let rate = rate.clamp(0.0, 1.0);
        let keep = 1.0 - rate;
        for (cur, &new) in self.patch.as_mut_slice().iter_mut().zip(fresh.as_bytes()) {
            let v = *cur as f32 * keep + new as f32 * rate;
            *cur = v.round().clamp(0.0, 255.0) as u8;
        }
    }

    /// Extract a patch at (x, y) and blend it in. Returns `false` and
    /// leaves the template untouched if the window leaves the frame.
    pub fn refresh(&mut self, frame: &Image<u8>, x: f32, y: f32, rate: f32) -> bool {
        match Template::extract(frame, x, y, self.size()) {
            Some(fresh) => {
                self.blend(&fresh, rate);
                true
            }
            None => false,
        }
    }
}
