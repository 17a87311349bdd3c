// image.rs — Runtime-sized single-plane image container.
//
// Every matcher in this crate reads pixels through `Image<T>`:
//   Image<u8>  — luma frames, templates, anchor patches
//   Image<f32> — gradients, Harris response, convolution intermediates
//
// Layout is row-major and tightly packed (no stride padding): pixel (x, y)
// lives at `y * width + x`. Frames arrive from the host as packed buffers,
// so there is nothing to gain from padded rows on the CPU path.
//
// Coordinates are (x, y) = (column, row) throughout the crate.

use std::fmt;

/// Trait for types that can serve as pixel values in an `Image`.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Raw conversion to f32 (u8 42 → 42.0, not normalized).
    fn to_f32(self) -> f32;

    /// Construct a pixel from an f32, clamping and rounding where needed.
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        // `as u8` truncates, so clamp and round first.
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

/// A 2D image with runtime dimensions, generic over pixel type `T`.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Pixel> Image<T> {
    /// Create a zero-initialized image.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![T::default(); width * height],
            width,
            height,
        }
    }

    /// Create an image filled with a constant value.
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Wrap an existing row-major pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of pixels.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the pixel value at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// Set the pixel at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        self.data[idx] = value;
    }

    /// Borrow a single row as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Fill an axis-aligned rectangle, clipped to the image.
    pub fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, value: T) {
        let x_end = (x + w).min(self.width);
        let y_end = (y + h).min(self.height);
        for yy in y.min(self.height)..y_end {
            let start = yy * self.width;
            for v in &mut self.data[start + x.min(x_end)..start + x_end] {
                *v = value;
            }
        }
    }

    /// Iterate over all pixels as `(x, y, value)`.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.width + x]))
        })
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Whether a square window of half-size `half` centered on integer
    /// pixel (cx, cy) lies entirely inside the image.
    #[inline]
    pub fn contains_window(&self, cx: isize, cy: isize, half: usize) -> bool {
        let h = half as isize;
        cx - h >= 0
            && cy - h >= 0
            && cx + h < self.width as isize
            && cy + h < self.height as isize
    }

    /// Copy the square window of half-size `half` centered on (cx, cy) into
    /// a new `(2*half+1)²` image. Returns `None` when any part of the window
    /// falls outside the image.
    pub fn crop_centered(&self, cx: isize, cy: isize, half: usize) -> Option<Image<T>> {
        if !self.contains_window(cx, cy, half) {
            return None;
        }
        let side = 2 * half + 1;
        let x0 = (cx - half as isize) as usize;
        let y0 = (cy - half as isize) as usize;
        let mut data = Vec::with_capacity(side * side);
        for y in y0..y0 + side {
            let start = y * self.width + x0;
            data.extend_from_slice(&self.data[start..start + side]);
        }
        Some(Image::from_vec(side, side, data))
    }

    /// Copy an arbitrary rectangle, clipped to the image bounds.
    /// Returns the crop and the top-left corner it was taken from.
    pub fn crop_clipped(&self, x0: isize, y0: isize, w: usize, h: usize) -> (Image<T>, usize, usize) {
        let cx0 = x0.clamp(0, self.width as isize) as usize;
        let cy0 = y0.clamp(0, self.height as isize) as usize;
        let cx1 = (x0 + w as isize).clamp(0, self.width as isize) as usize;
        let cy1 = (y0 + h as isize).clamp(0, self.height as isize) as usize;
        let cw = cx1.saturating_sub(cx0);
        let ch = cy1.saturating_sub(cy0);
        let mut data = Vec::with_capacity(cw * ch);
        for y in cy0..cy0 + ch {
            let start = y * self.width + cx0;
            data.extend_from_slice(&self.data[start..start + cw]);
        }
        (Image::from_vec(cw, ch, data), cx0, cy0)
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

/// Clamp a sub-pixel center so that a square window of half-size `half`
/// stays inside a `width × height` frame. Frames smaller than the window
/// collapse to the frame center.
pub fn clamp_center(x: f32, y: f32, half: usize, width: usize, height: usize) -> (f32, f32) {
    let clamp_axis = |v: f32, extent: usize| {
        let lo = half as f32;
        let hi = extent as f32 - 1.0 - half as f32;
        if hi < lo {
            (extent as f32 - 1.0).max(0.0) * 0.5
        } else {
            v.clamp(lo, hi)
        }
    };
    (clamp_axis(x, width), clamp_axis(y, height))
}

// Debug output prints a corner of the buffer; full frames are too large.
impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Pixel> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.width + x]
    }
}

impl<T: Pixel> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }
}
