//! Frame buffers and pixel kernels.
//!
//! A [`Frame`] is an owned single-channel 8-bit raster: one decoded layer
//! image. The kernels in this module are the pixel-level primitives the
//! optimizer is built from:
//! - [`Frame::threshold`] - binarization for geometric comparison
//! - [`Frame::xor_diff`] - pairwise disagreement mask
//! - [`Frame::max_in_place`] - union fold / raw merge
//! - [`Frame::erode_once`] - one unit of 3x3 morphological erosion
//! - [`Frame::gaussian_blur_3x3`] - anti-aliasing reconstruction
//!
//! All kernels are pure elementwise (or fixed-neighborhood) functions, so
//! they parallelize over rows without changing their result.

use rayon::prelude::*;
use std::fmt;

/// Threshold separating "material" from "void" when binarizing a grayscale
/// layer image. Pixels strictly above become 255, the rest 0.
pub const BINARIZE_THRESHOLD: u8 = 127;

/// An owned single-channel 8-bit raster image.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("nonzero", &self.nonzero_count())
            .finish()
    }
}

impl Frame {
    /// Create a zero-filled frame.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    /// Create a frame from raw pixel data.
    ///
    /// Returns `None` if the data length does not match the dimensions.
    pub fn from_data(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Frame width in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Frame height in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Raw pixel data, row-major.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes occupied by the pixel data.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Pixel accessor used by tests and small fixtures.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Pixel mutator used by tests and small fixtures.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: u8) {
        self.data[y * self.width + x] = v;
    }

    /// Whether the two frames have identical dimensions.
    #[inline]
    pub fn same_shape(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Binarize at the given threshold: pixels strictly above `t` become
    /// 255, everything else 0.
    pub fn threshold(&self, t: u8) -> Frame {
        let mut out = self.clone();
        out.data
            .par_chunks_mut(self.width.max(1))
            .for_each(|row| {
                for p in row {
                    *p = if *p > t { 255 } else { 0 };
                }
            });
        out
    }

    /// Pixel-wise XOR difference: 255 where the frames disagree, 0 where
    /// they agree. Both frames are expected to be binarized.
    ///
    /// # Panics
    ///
    /// Panics if the frames have different dimensions; all layers of one
    /// model share a resolution, so a mismatch is a caller bug.
    pub fn xor_diff(&self, other: &Frame) -> Frame {
        assert!(self.same_shape(other), "frame dimensions differ");
        let mut out = Frame::new(self.width, self.height);
        out.data
            .par_chunks_mut(self.width.max(1))
            .zip(self.data.par_chunks(self.width.max(1)))
            .zip(other.data.par_chunks(self.width.max(1)))
            .for_each(|((dst, a), b)| {
                for i in 0..dst.len() {
                    dst[i] = a[i] ^ b[i];
                }
            });
        out
    }

    /// Pixel-wise maximum fold: `self = max(self, other)`.
    ///
    /// Used both to accumulate the union-difference mask (a pixel that ever
    /// differed stays marked) and to merge raw buffers when stacking.
    pub fn max_in_place(&mut self, other: &Frame) {
        assert!(self.same_shape(other), "frame dimensions differ");
        self.data
            .par_chunks_mut(self.width.max(1))
            .zip(other.data.par_chunks(self.width.max(1)))
            .for_each(|(dst, src)| {
                for i in 0..dst.len() {
                    dst[i] = dst[i].max(src[i]);
                }
            });
    }

    /// One unit of morphological erosion with a full 3x3 structuring
    /// element, reflecting at the borders: each output pixel is the minimum
    /// of its 3x3 neighborhood.
    pub fn erode_once(&self) -> Frame {
        let (w, h) = (self.width, self.height);
        let mut out = Frame::new(w, h);
        if w == 0 || h == 0 {
            return out;
        }
        out.data
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                let y0 = reflect(y as isize - 1, h);
                let y2 = reflect(y as isize + 1, h);
                let rows = [
                    &self.data[y0 * w..y0 * w + w],
                    &self.data[y * w..y * w + w],
                    &self.data[y2 * w..y2 * w + w],
                ];
                for x in 0..w {
                    let x0 = reflect(x as isize - 1, w);
                    let x2 = reflect(x as isize + 1, w);
                    let mut m = u8::MAX;
                    for r in &rows {
                        m = m.min(r[x0]).min(r[x]).min(r[x2]);
                    }
                    row[x] = m;
                }
            });
        out
    }

    /// Separable 3x3 Gaussian blur (1-2-1 kernel, reflect-at-border).
    ///
    /// Used to reconstruct soft anti-aliased edges on a merged buffer after
    /// the grayscale information was stripped for comparison.
    pub fn gaussian_blur_3x3(&self) -> Frame {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return self.clone();
        }
        // Horizontal pass
        let mut tmp = vec![0u16; w * h];
        tmp.par_chunks_mut(w)
            .zip(self.data.par_chunks(w))
            .for_each(|(dst, src)| {
                for x in 0..w {
                    let x0 = reflect(x as isize - 1, w);
                    let x2 = reflect(x as isize + 1, w);
                    dst[x] = src[x0] as u16 + 2 * src[x] as u16 + src[x2] as u16;
                }
            });
        // Vertical pass
        let mut out = Frame::new(w, h);
        out.data
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                let y0 = reflect(y as isize - 1, h);
                let y2 = reflect(y as isize + 1, h);
                for x in 0..w {
                    let sum = tmp[y0 * w + x] as u32 + 2 * tmp[y * w + x] as u32 + tmp[y2 * w + x] as u32;
                    row[x] = ((sum + 8) / 16) as u8;
                }
            });
        out
    }

    /// Whether every pixel is zero.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&p| p == 0)
    }

    /// Number of nonzero pixels.
    pub fn nonzero_count(&self) -> usize {
        self.data.iter().filter(|&&p| p != 0).count()
    }

    /// Replace every pixel with zero, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

/// Reflect an out-of-range coordinate back into `[0, len)`.
#[inline]
fn reflect(i: isize, len: usize) -> usize {
    if i < 0 {
        (-i) as usize % len
    } else if i as usize >= len {
        let over = i as usize - len + 1;
        len - 1 - (over % len)
    } else {
        i as usize
    }
}
