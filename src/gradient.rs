// gradient.rs — Sobel gradients.
//
// Sobel kernels are separable:
//   Sobel_x: derivative [-1, 0, 1] along rows, smoothing [1, 2, 1] along columns
//   Sobel_y: smoothing along rows, derivative along columns
//
// Border handling is inherited from convolve_separable (clamp).

use crate::convolution::convolve_separable;
use crate::image::{Image, Pixel};

const SOBEL_DERIV: [f32; 3] = [-1.0, 0.0, 1.0];
const SOBEL_SMOOTH: [f32; 3] = [1.0, 2.0, 1.0];

/// Horizontal gradient Ix. Positive where intensity increases to the right.
/// Unnormalized: roughly [-1020, 1020] for u8 input.
pub fn sobel_x<T: Pixel>(src: &Image<T>) -> Image<f32> {
    convolve_separable(src, &SOBEL_DERIV, &SOBEL_SMOOTH)
}

/// Vertical gradient Iy. Positive where intensity increases downward.
pub fn sobel_y<T: Pixel>(src: &Image<T>) -> Image<f32> {
    convolve_separable(src, &SOBEL_SMOOTH, &SOBEL_DERIV)
}

/// Both gradients at once.
pub fn sobel_xy<T: Pixel>(src: &Image<T>) -> (Image<f32>, Image<f32>) {
    (sobel_x(src), sobel_y(src))
}

/// Per-pixel gradient magnitude `sqrt(Ix² + Iy²)`.
pub fn gradient_magnitude(ix: &Image<f32>, iy: &Image<f32>) -> Image<f32> {
    assert_eq!(
        (ix.width(), ix.height()),
        (iy.width(), iy.height()),
        "gradient images must have equal dimensions"
    );
    let data = ix
        .as_slice()
        .iter()
        .zip(iy.as_slice())
        .map(|(gx, gy)| (gx * gx + gy * gy).sqrt())
        .collect();
    Image::from_vec(ix.width(), ix.height(), data)
}
