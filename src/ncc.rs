// ncc.rs — Zero-mean normalized cross-correlation search.
//
// Anchors are small (11×11) and sit on high-contrast structure, where a
// brightness change shifts SAD a lot but leaves NCC untouched:
//
//   ncc = Σ (p − p̄)(t − t̄) / sqrt(Σ (p − p̄)² · Σ (t − t̄)²)   ∈ [−1, 1]
//
// A flat template (zero variance) cannot be correlated; building an
// `NccTemplate` from it yields `None`. Flat candidate patches are skipped
// the same way.

use crate::image::Image;
use crate::template::Template;

/// Variance floor below which a patch is treated as flat.
const MIN_VARIANCE_SUM: f32 = 1e-3;

/// A template pre-centered for NCC.
#[derive(Debug, Clone)]
pub struct NccTemplate {
    /// Zero-mean template values, row-major.
    centered: Vec<f32>,
    /// sqrt(Σ (t − t̄)²)
    norm: f32,
    size: usize,
}

/// Best NCC match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NccMatch {
    pub x: isize,
    pub y: isize,
    /// Correlation in [−1, 1]; 1 is a perfect match.
    pub score: f32,
}

impl NccTemplate {
    /// Prepare a template. `None` if the patch has (near) zero variance.
    pub fn new(template: &Template) -> Option<NccTemplate> {
        let bytes = template.as_bytes();
        let n = bytes.len() as f32;
        let mean = bytes.iter().map(|&v| v as f32).sum::<f32>() / n;
        let centered: Vec<f32> = bytes.iter().map(|&v| v as f32 - mean).collect();
        let var_sum: f32 = centered.iter().map(|v| v * v).sum();
        if var_sum < MIN_VARIANCE_SUM {
            return None;
        }
        Some(NccTemplate {
            centered,
            norm: var_sum.sqrt(),
            size: template.size(),
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// NCC against the frame window centered on (cx, cy). `None` if the
    /// window leaves the frame or the frame patch is flat.
    pub fn score_at(&self, frame: &Image<u8>, cx: isize, cy: isize) -> Option<f32> {
        let half = self.size / 2;
        if !frame.contains_window(cx, cy, half) {
            return None;
        }
        let x0 = (cx - half as isize) as usize;
        let y0 = (cy - half as isize) as usize;
        let n = (self.size * self.size) as f32;

        let mut sum = 0.0f32;
        for y in 0..self.size {
            sum += frame.row(y0 + y)[x0..x0 + self.size]
                .iter()
                .map(|&v| v as f32)
                .sum::<f32>();
        }
        let mean = sum / n;

        let mut cross = 0.0f32;
        let mut var_sum = 0.0f32;
        for y in 0..self.size {
            let frow = &frame.row(y0 + y)[x0..x0 + self.size];
            let trow = &self.centered[y * self.size..(y + 1) * self.size];
            for (&p, &t) in frow.iter().zip(trow) {
                let d = p as f32 - mean;
                cross += d * t;
                var_sum += d * d;
            }
        }
        if var_sum < MIN_VARIANCE_SUM {
            return None;
        }
        Some((cross / (var_sum.sqrt() * self.norm)).clamp(-1.0, 1.0))
    }

    /// Exhaustive step-1 search within ±radius of (cx, cy). The center is
    /// evaluated first; later candidates must be strictly better.
    pub fn search(&self, frame: &Image<u8>, cx: isize, cy: isize, radius: usize) -> Option<NccMatch> {
        let mut best = self
            .score_at(frame, cx, cy)
            .map(|score| NccMatch { x: cx, y: cy, score });
        let r = radius as isize;
        for dy in -r..=r {
            for dx in -r..=r {
                let (x, y) = (cx + dx, cy + dy);
                if let Some(score) = self.score_at(frame, x, y) {
                    if best.map_or(true, |b| score > b.score) {
                        best = Some(NccMatch { x, y, score });
                    }
                }
            }
        }
        best
    }
}
