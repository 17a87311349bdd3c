// convolution.rs — Separable 1D convolution on Image<T>.
//
// Used by the anchor detector: Sobel gradients are a separable pair of
// 3-tap kernels, and the Harris structure tensor is smoothed with a
// separable Gaussian. Anchor windows are small (about 50×50), so the
// straightforward clamped loop is fast enough; there is no interior/border
// split here.
//
// BORDER HANDLING: clamp (replicate edge pixels).

use crate::image::{Image, Pixel};

#[inline]
fn clamp_index(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}

/// Convolve each row of `src` with `kernel` (horizontal pass).
///
/// The kernel is applied centered: tap `K/2` multiplies the pixel itself.
///
/// # Panics
/// Panics if the kernel is empty or has even length.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());

    let (w, h) = (src.width(), src.height());
    let half = (kernel.len() / 2) as isize;
    let mut dst = Image::<f32>::new(w, h);
    if w == 0 || h == 0 {
        return dst;
    }

    for y in 0..h {
        let row = src.row(y);
        let out = &mut dst.as_mut_slice()[y * w..(y + 1) * w];
        for (x, o) in out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = clamp_index(x as isize + ki as isize - half, w);
                acc += row[sx].to_f32() * kv;
            }
            *o = acc;
        }
    }
    dst
}

/// Convolve each column of `src` with `kernel` (vertical pass).
///
/// # Panics
/// Panics if the kernel is empty or has even length.
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());

    let (w, h) = (src.width(), src.height());
    let half = (kernel.len() / 2) as isize;
    let mut dst = Image::<f32>::new(w, h);
    if w == 0 || h == 0 {
        return dst;
    }

    let s = src.as_slice();
    let d = dst.as_mut_slice();
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = clamp_index(y as isize + ki as isize - half, h);
                acc += s[sy * w + x] * kv;
            }
            d[y * w + x] = acc;
        }
    }
    dst
}

/// Separable 2D convolution: rows with `kernel_row`, then columns with
/// `kernel_col`. Output is always f32.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// 1D Gaussian of length `2 * half_size + 1`, normalized to sum to 1.
///
/// # Examples
/// ```
/// let k = patchtrack::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * half_size)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}
