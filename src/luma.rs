// luma.rs — RGBA frame to single-channel intensity.
//
// All template matching runs on luma. Weights are ITU-R BT.709:
//   Y = 0.2126·R + 0.7152·G + 0.0722·B
// Alpha is ignored.
//
// Input is the packed RGBA8 layout that browser canvases and most capture
// APIs hand out: 4 bytes per pixel, row-major, no padding.

use crate::error::{Result, TrackError};
use crate::image::Image;

const WEIGHT_R: f32 = 0.2126;
const WEIGHT_G: f32 = 0.7152;
const WEIGHT_B: f32 = 0.0722;

/// Luma of a single RGB triple, rounded to the nearest integer.
#[inline]
pub fn luma_bt709(r: u8, g: u8, b: u8) -> u8 {
    let y = WEIGHT_R * r as f32 + WEIGHT_G * g as f32 + WEIGHT_B * b as f32;
    // Weights sum to 1.0, so y is already within [0, 255]; clamp guards
    // against float rounding at the top end.
    y.round().clamp(0.0, 255.0) as u8
}

/// Convert a packed RGBA8 buffer to a luma image.
///
/// Returns `DimensionMismatch` if `rgba.len() != width * height * 4`.
pub fn rgba_to_luma(rgba: &[u8], width: usize, height: usize) -> Result<Image<u8>> {
    let expected = width * height * 4;
    if rgba.len() != expected {
        return Err(TrackError::DimensionMismatch {
            expected,
            actual: rgba.len(),
        });
    }

    let data = rgba
        .chunks_exact(4)
        .map(|px| luma_bt709(px[0], px[1], px[2]))
        .collect();
    Ok(Image::from_vec(width, height, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primaries() {
        assert_eq!(luma_bt709(255, 0, 0), 54); // 54.213
        assert_eq!(luma_bt709(0, 255, 0), 182); // 182.376
        assert_eq!(luma_bt709(0, 0, 255), 18); // 18.411
    }

    #[test]
    fn test_gray_is_identity() {
        for v in [0u8, 1, 77, 128, 200, 254, 255] {
            assert_eq!(luma_bt709(v, v, v), v, "gray {v} should map to itself");
        }
    }

    #[test]
    fn test_buffer_conversion_ignores_alpha() {
        let rgba = vec![
            255, 255, 255, 0, //
            0, 0, 0, 255, //
            255, 0, 0, 17, //
            10, 20, 30, 255,
        ];
        let img = rgba_to_luma(&rgba, 2, 2).unwrap();
        assert_eq!(img.get(0, 0), 255);
        assert_eq!(img.get(1, 0), 0);
        assert_eq!(img.get(0, 1), 54);
        // 2.126 + 14.304 + 2.166 = 18.596
        assert_eq!(img.get(1, 1), 19);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = rgba_to_luma(&[0u8; 15], 2, 2).unwrap_err();
        match err {
            TrackError::DimensionMismatch { expected, actual } => {
                assert_eq!(expected, 16);
                assert_eq!(actual, 15);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
