// harris.rs — Harris corners and edge ridges for anchor detection.
//
// Harris finds corners from the structure tensor of the image gradients:
//   1. Sobel gradients Ix, Iy
//   2. Products Ix², Iy², Ix·Iy
//   3. Gaussian-weighted window sums of each product
//   4. R = det(M) - k·trace(M)²   with M = [[Sxx, Sxy], [Sxy, Syy]]
//   5. Threshold R relative to its window maximum, keep 3×3 local maxima
//
// Edge ridges come from the same gradients: a pixel is a ridge if its
// gradient magnitude is a maximum across the edge (Canny-style, direction
// quantized to 0°/45°/90°/135°). Ridges are weaker anchors than corners —
// they only constrain motion in one direction — so the anchor detector
// ranks them below corners.

use crate::convolution::{convolve_separable, gaussian_kernel_1d};
use crate::gradient::{gradient_magnitude, sobel_xy};
use crate::image::{Image, Pixel};
use crate::nms::{Keypoint, KeypointKind};

/// Harris corner detector.
pub struct HarrisDetector {
    /// Harris parameter, typically 0.04–0.06. Lower values accept more
    /// edge-like corners.
    pub k: f32,
    /// Half-size of the Gaussian window (1 → 3×3, 2 → 5×5).
    pub block_size: usize,
}

impl HarrisDetector {
    pub fn new(k: f32, block_size: usize) -> Self {
        HarrisDetector { k, block_size }
    }

    /// Harris response image. Positive → corner, negative → edge,
    /// near zero → flat.
    pub fn corner_response<T: Pixel>(&self, image: &Image<T>) -> Image<f32> {
        let (w, h) = (image.width(), image.height());
        let (ix, iy) = sobel_xy(image);

        let mut ix2 = Image::<f32>::new(w, h);
        let mut iy2 = Image::<f32>::new(w, h);
        let mut ixiy = Image::<f32>::new(w, h);
        for (i, (&gx, &gy)) in ix.as_slice().iter().zip(iy.as_slice()).enumerate() {
            ix2.as_mut_slice()[i] = gx * gx;
            iy2.as_mut_slice()[i] = gy * gy;
            ixiy.as_mut_slice()[i] = gx * gy;
        }

        let sigma = self.block_size as f32 * 0.5 + 0.5;
        let kernel = gaussian_kernel_1d(self.block_size, sigma);
        let sxx = convolve_separable(&ix2, &kernel, &kernel);
        let syy = convolve_separable(&iy2, &kernel, &kernel);
        let sxy = convolve_separable(&ixiy, &kernel, &kernel);

        let data = sxx
            .as_slice()
            .iter()
            .zip(syy.as_slice())
            .zip(sxy.as_slice())
            .map(|((&a, &b), &c)| {
                let det = a * b - c * c;
                let trace = a + b;
                det - self.k * trace * trace
            })
            .collect();
        Image::from_vec(w, h, data)
    }

    /// Corners with response above `fraction` of the strongest response in
    /// the image, sorted by score (descending). Contrast-independent; used on small anchor windows where
    /// an absolute threshold is hard to pick. Returns nothing if the image
    /// has no positive response at all.
    pub fn detect_relative<T: Pixel>(&self, image: &Image<T>, fraction: f32) -> Vec<Keypoint> {
        let response = self.corner_response(image);
        let max = response
            .as_slice()
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if !(max > 0.0) {
            return Vec::new();
        }
        self.collect_maxima(&response, max * fraction)
    }

    fn collect_maxima(&self, response: &Image<f32>, threshold: f32) -> Vec<Keypoint> {
        let (w, h) = (response.width(), response.height());
        // Sobel + Gaussian smear the border; skip it.
        let border = self.block_size + 2;
        let mut corners = Vec::new();
        if w <= 2 * border || h <= 2 * border {
            return corners;
        }

        for y in border..(h - border) {
            for x in border..(w - border) {
                let r = response.get(x, y);
                if r > threshold && is_local_max(response, x, y) {
                    corners.push(Keypoint::new(x as f32, y as f32, r, KeypointKind::Corner));
                }
            }
        }
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        corners
    }
}

/// 3×3 local maximum test. Plateaus keep only their first pixel in raster
/// order so flat-topped peaks yield a single point.
fn is_local_max(img: &Image<f32>, x: usize, y: usize) -> bool {
    let v = img.get(x, y);
    for dy in -1isize..=1 {
        for dx in -1isize..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let n = img.get((x as isize + dx) as usize, (y as isize + dy) as usize);
            let before = dy < 0 || (dy == 0 && dx < 0);
            if n > v || (before && n == v) {
                return false;
            }
        }
    }
    true
}

/// Edge ridges: pixels whose gradient magnitude exceeds `min_fraction` of
/// the window maximum and is a local maximum across the edge direction.
/// Sorted by magnitude, descending.
pub fn detect_edge_ridges<T: Pixel>(image: &Image<T>, min_fraction: f32) -> Vec<Keypoint> {
    let (w, h) = (image.width(), image.height());
    let mut ridges = Vec::new();
    if w < 5 || h < 5 {
        return ridges;
    }

    let (ix, iy) = sobel_xy(image);
    let mag = gradient_magnitude(&ix, &iy);
    let max = mag.as_slice().iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return ridges;
    }
    let threshold = max * min_fraction;

    for y in 2..(h - 2) {
        for x in 2..(w - 2) {
            let m = mag.get(x, y);
            if m <= threshold {
                continue;
            }
            let (gx, gy) = (ix.get(x, y), iy.get(x, y));
            // Neighbors along the gradient (across the edge).
            let (dx, dy) = quantize_direction(gx, gy);
            let a = mag.get((x as isize + dx) as usize, (y as isize + dy) as usize);
            let b = mag.get((x as isize - dx) as usize, (y as isize - dy) as usize);
            if m >= a && m > b {
                ridges.push(Keypoint::new(x as f32, y as f32, m, KeypointKind::Edge));
            }
        }
    }
    ridges.sort_by(|a, b| b.score.total_cmp(&a.score));
    ridges
}

/// Map a gradient vector to the nearest of four pixel directions.
fn quantize_direction(gx: f32, gy: f32) -> (isize, isize) {
    // tan(22.5°) ≈ 0.4142, tan(67.5°) ≈ 2.4142
    let (ax, ay) = (gx.abs(), gy.abs());
    if ay <= ax * 0.4142 {
        (1, 0)
    } else if ay >= ax * 2.4142 {
        (0, 1)
    } else if (gx > 0.0) == (gy > 0.0) {
        (1, 1)
    } else {
        (1, -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Canonical Harris test pattern: junctions are corners.
    fn make_chessboard(img_size: usize, cell_size: usize, lo: u8, hi: u8) -> Image<u8> {
        let mut img = Image::new(img_size, img_size);
        for y in 0..img_size {
            for x in 0..img_size {
                let val = if (x / cell_size + y / cell_size) % 2 == 0 { lo } else { hi };
                img.set(x, y, val);
            }
        }
        img
    }

    #[test]
    fn test_chessboard_corners_near_junctions() {
        let cell = 10;
        let img = make_chessboard(60, cell, 20, 230);
        let det = HarrisDetector::new(0.04, 2);
        let corners = det.detect_relative(&img, 0.1);
        assert!(corners.len() >= 9, "expected junctions, got {}", corners.len());

        let tolerance = cell as f32 / 2.0;
        for c in &corners {
            let nx = (c.x / cell as f32).round() * cell as f32;
            let ny = (c.y / cell as f32).round() * cell as f32;
            let dist = ((c.x - nx).powi(2) + (c.y - ny).powi(2)).sqrt();
            assert!(dist <= tolerance, "corner at ({},{}) is {dist:.1}px off", c.x, c.y);
        }
    }

    #[test]
    fn test_flat_image_has_nothing() {
        let img = Image::filled(40, 40, 128u8);
        let det = HarrisDetector::new(0.04, 2);
        assert!(det.detect_relative(&img, 0.01).is_empty());
        assert!(detect_edge_ridges(&img, 0.2).is_empty());
    }

    #[test]
    fn test_relative_threshold_finds_square_corners() {
        let mut img = Image::filled(40, 40, 30u8);
        img.fill_rect(12, 12, 16, 16, 220);
        let det = HarrisDetector::new(0.04, 1);
        let corners = det.detect_relative(&img, 0.1);
        assert!(corners.len() >= 4, "square has four corners, got {}", corners.len());
        for c in corners.iter().take(4) {
            let near_x = (c.x - 12.0).abs() <= 2.0 || (c.x - 27.0).abs() <= 2.0;
            let near_y = (c.y - 12.0).abs() <= 2.0 || (c.y - 27.0).abs() <= 2.0;
            assert!(near_x && near_y, "corner ({}, {}) not at square corner", c.x, c.y);
        }
    }

    #[test]
    fn test_sorted_by_score() {
        let img = make_chessboard(60, 10, 20, 230);
        let det = HarrisDetector::new(0.04, 2);
        let corners = det.detect_relative(&img, 0.1);
        for pair in corners.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_edge_ridge_on_step() {
        let mut img = Image::filled(30, 20, 40u8);
        img.fill_rect(15, 0, 15, 20, 200);
        let ridges = detect_edge_ridges(&img, 0.3);
        assert!(!ridges.is_empty());
        for r in &ridges {
            assert!(r.x == 14.0 || r.x == 15.0, "ridge off the step at x={}", r.x);
            assert_eq!(r.kind, KeypointKind::Edge);
        }
    }

    #[test]
    fn test_image_too_small() {
        let img = Image::filled(6, 6, 128u8);
        let det = HarrisDetector::new(0.04, 2);
        assert!(det.detect_relative(&img, 0.1).is_empty());
    }
}
