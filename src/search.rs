// search.rs — Exhaustive SAD template search.
//
// Score of a candidate center (cx, cy):
//
//   score = Σ |patch(cx, cy) − template| / (255 · size²)      ∈ [0, 1]
//
// 0 is a perfect match, 1 is maximally different. Accumulation is done in
// integers, so results are exact and bit-identical across runs.
//
// Two passes bound the per-tracker cost at video rate:
//
//   coarse: offsets k·step for k ∈ [−r/step, r/step] on both axes around
//           the predicted center, ≈ (2r/step + 1)² evaluations
//   refine: every offset within ±refine_radius around the coarse winner,
//           (2·refine + 1)² evaluations
//
// The search center itself is always evaluated first and a candidate only
// replaces the incumbent with a strictly smaller sum, so a template
// searched at the location it was cut from returns that location with
// score 0. Candidates whose window leaves the frame are skipped.
//
// Each candidate's sum is abandoned as soon as it exceeds the incumbent
// (row-granular early exit); this never changes the result.

use crate::image::Image;
use crate::template::Template;

/// Best match found by a search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Integer pixel center of the best candidate.
    pub x: isize,
    pub y: isize,
    /// Normalized SAD in [0, 1].
    pub score: f32,
}

/// Parameters for a two-phase search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Coarse search half-width in pixels.
    pub radius: usize,
    /// Coarse step in pixels (≥ 1).
    pub step: usize,
    /// Refinement half-width in pixels (step 1).
    pub refine_radius: usize,
}

/// Normalized SAD of `template` against the frame window centered on
/// (cx, cy). `None` if the window leaves the frame.
pub fn sad_score(frame: &Image<u8>, template: &Template, cx: isize, cy: isize) -> Option<f32> {
    sad_sum(frame, template, cx, cy, u32::MAX).map(|sum| normalize(sum, template.size()))
}

#[inline]
fn normalize(sum: u32, size: usize) -> f32 {
    sum as f32 / (255.0 * (size * size) as f32)
}

/// Raw SAD sum, abandoning once the partial sum exceeds `limit`.
fn sad_sum(frame: &Image<u8>, template: &Template, cx: isize, cy: isize, limit: u32) -> Option<u32> {
    let half = template.half();
    if !frame.contains_window(cx, cy, half) {
        return None;
    }
    let size = template.size();
    let x0 = (cx - half as isize) as usize;
    let y0 = (cy - half as isize) as usize;
    let tpl = template.as_bytes();

    let mut sum = 0u32;
    for ty in 0..size {
        let frow = &frame.row(y0 + ty)[x0..x0 + size];
        let trow = &tpl[ty * size..(ty + 1) * size];
        sum += frow
            .iter()
            .zip(trow)
            .map(|(&a, &b)| a.abs_diff(b) as u32)
            .sum::<u32>();
        if sum > limit {
            return None;
        }
    }
    Some(sum)
}

/// Single-pass search over a square grid of offsets `k·step`,
/// |k·step| ≤ radius, around (cx, cy). The center is tried first.
pub fn search_grid(
    frame: &Image<u8>,
    template: &Template,
    cx: isize,
    cy: isize,
    radius: usize,
    step: usize,
) -> Option<MatchResult> {
    let best = sad_sum(frame, template, cx, cy, u32::MAX).map(|sum| (cx, cy, sum));
    search_grid_from(frame, template, cx, cy, radius, step, best)
        .map(|(x, y, sum)| MatchResult { x, y, score: normalize(sum, template.size()) })
}

fn search_grid_from(
    frame: &Image<u8>,
    template: &Template,
    cx: isize,
    cy: isize,
    radius: usize,
    step: usize,
    mut best: Option<(isize, isize, u32)>,
) -> Option<(isize, isize, u32)> {
    let step = step.max(1);
    let n = (radius / step) as isize;
    let s = step as isize;

    for ky in -n..=n {
        for kx in -n..=n {
            let (x, y) = (cx + kx * s, cy + ky * s);
            let limit = best.map_or(u32::MAX, |(_, _, b)| b);
            if let Some(sum) = sad_sum(frame, template, x, y, limit) {
                // Strictly better only: ties keep the earlier candidate.
                if best.map_or(true, |(_, _, b)| sum < b) {
                    best = Some((x, y, sum));
                }
            }
        }
    }
    best
}

/// Coarse-then-refine search around a sub-pixel center.
///
/// Returns `None` only if no candidate window fits inside the frame.
pub fn search(
    frame: &Image<u8>,
    template: &Template,
    center: (f32, f32),
    params: SearchParams,
) -> Option<MatchResult> {
    let cx = center.0.round() as isize;
    let cy = center.1.round() as isize;

    let seed = sad_sum(frame, template, cx, cy, u32::MAX).map(|sum| (cx, cy, sum));
    let coarse = search_grid_from(frame, template, cx, cy, params.radius, params.step, seed)?;
    if coarse.2 == 0 || params.refine_radius == 0 {
        return Some(MatchResult {
            x: coarse.0,
            y: coarse.1,
            score: normalize(coarse.2, template.size()),
        });
    }

    let (x, y, sum) = search_grid_from(
        frame,
        template,
        coarse.0,
        coarse.1,
        params.refine_radius,
        1,
        Some(coarse),
    )?;
    Some(MatchResult { x, y, score: normalize(sum, template.size()) })
}

/// Number of score evaluations a two-phase search performs at most.
pub fn evaluation_budget(params: SearchParams) -> usize {
    let coarse_side = 2 * (params.radius / params.step.max(1)) + 1;
    let refine_side = 2 * params.refine_radius + 1;
    coarse_side * coarse_side + refine_side * refine_side
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Textured frame with a unique intensity pattern everywhere.
    fn textured(w: usize, h: usize) -> Image<u8> {
        let mut img = Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let v = (x * 7 + y * 13 + (x * y) % 17 * 9) % 251;
                img.set(x, y, v as u8);
            }
        }
        img
    }

    #[test]
    fn test_self_match_scores_zero() {
        let frame = textured(80, 80);
        let t = Template::extract(&frame, 40.0, 40.0, 15).unwrap();
        assert_eq!(sad_score(&frame, &t, 40, 40), Some(0.0));

        let params = SearchParams { radius: 20, step: 3, refine_radius: 3 };
        let m = search(&frame, &t, (40.0, 40.0), params).unwrap();
        assert_eq!((m.x, m.y), (40, 40));
        assert_eq!(m.score, 0.0);
    }

    /// Smooth bump on a ramp: SAD grows with distance from the peak, so
    /// the coarse winner is a grid point near the true location.
    fn bump(w: usize, h: usize, px: f32, py: f32) -> Image<u8> {
        let mut img = Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let d2 = (x as f32 - px).powi(2) + (y as f32 - py).powi(2);
                let v = 40.0 + x as f32 * 0.5 + 180.0 * (-d2 / 200.0).exp();
                img.set(x, y, v.clamp(0.0, 255.0).round() as u8);
            }
        }
        img
    }

    #[test]
    fn test_finds_shifted_target_off_grid() {
        let frame = bump(100, 100, 55.0, 47.0);
        let t = Template::extract(&frame, 55.0, 47.0, 15).unwrap();
        // Coarse grid from (45, 40) with step 4 never lands on (55, 47);
        // the refine pass must close the gap.
        let params = SearchParams { radius: 16, step: 4, refine_radius: 3 };
        let m = search(&frame, &t, (45.0, 40.0), params).unwrap();
        assert_eq!((m.x, m.y), (55, 47), "score {}", m.score);
        assert_eq!(m.score, 0.0);
    }

    #[test]
    fn test_score_bounds_extremes() {
        let black = Image::filled(30, 30, 0u8);
        let white = Image::filled(30, 30, 255u8);
        let t = Template::extract(&black, 15.0, 15.0, 15).unwrap();
        assert_eq!(sad_score(&white, &t, 15, 15), Some(1.0));
        assert_eq!(sad_score(&black, &t, 15, 15), Some(0.0));
    }

    #[test]
    fn test_out_of_frame_candidates_skipped() {
        let frame = textured(30, 30);
        let t = Template::extract(&frame, 15.0, 15.0, 15).unwrap();
        assert_eq!(sad_score(&frame, &t, 3, 15), None);
        // Centered near the corner: only in-bounds candidates are scored.
        let m = search_grid(&frame, &t, 2, 2, 10, 1).unwrap();
        assert!(m.x >= 7 && m.y >= 7);
    }

    #[test]
    fn test_frame_smaller_than_template() {
        let frame = textured(10, 10);
        let t = Template::from_patch(Image::filled(15, 15, 9u8));
        let params = SearchParams { radius: 8, step: 2, refine_radius: 2 };
        assert!(search(&frame, &t, (5.0, 5.0), params).is_none());
    }

    #[test]
    fn test_deterministic() {
        let frame = textured(90, 90);
        let t = Template::extract(&frame, 30.0, 60.0, 21).unwrap();
        let params = SearchParams { radius: 24, step: 3, refine_radius: 2 };
        let a = search(&frame, &t, (41.3, 52.8), params);
        let b = search(&frame, &t, (41.3, 52.8), params);
        assert_eq!(a, b);
    }

    #[test]
    fn test_evaluation_budget() {
        let p = SearchParams { radius: 40, step: 4, refine_radius: 3 };
        assert_eq!(evaluation_budget(p), 21 * 21 + 7 * 7);
    }
}
