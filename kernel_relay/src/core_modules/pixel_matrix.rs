// THEORY:
// The `PixelMatrix` is the unit of work for every filter. It is a "dumb",
// row-major container of `Pixel`s with a fixed width and height, produced once
// by the codec and then only ever read. Every transform builds a fresh matrix;
// nothing writes into a matrix after it has been handed to another stage, which
// is what lets the convolution partitions share the input without a lock.

use crate::core_modules::pixel::pixel::{Byte, CHANNELS, Pixel};
use crate::error::FilterError;

/// A rectangular grid of RGBA samples, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelMatrix {
    width: usize,
    height: usize,
    pixels: Vec<Pixel>,
}

impl PixelMatrix {
    pub fn new(width: usize, height: usize, pixels: Vec<Pixel>) -> Result<Self, FilterError> {
        if pixels.len() != width * height {
            return Err(FilterError::InvalidMatrix(format!(
                "{width}x{height} matrix needs {} pixels, got {}",
                width * height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Wraps a buffer the caller sized from known dimensions.
    pub(crate) fn from_buffer(width: usize, height: usize, pixels: Vec<Pixel>) -> Self {
        debug_assert_eq!(pixels.len(), width * height);
        Self {
            width,
            height,
            pixels,
        }
    }

    /// A matrix where every sample is `fill`.
    pub fn filled(width: usize, height: usize, fill: Pixel) -> Self {
        Self {
            width,
            height,
            pixels: vec![fill; width * height],
        }
    }

    /// Builds a matrix from explicit rows. Every row must have the same width.
    pub fn from_rows(rows: Vec<Vec<Pixel>>) -> Result<Self, FilterError> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut pixels = Vec::with_capacity(width * height);
        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(FilterError::InvalidMatrix(format!(
                    "row {index} has width {}, expected {width}",
                    row.len()
                )));
            }
            pixels.extend(row);
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Reinterprets a packed RGBA8 buffer (as produced by the codec).
    pub fn from_rgba_bytes(width: usize, height: usize, bytes: &[Byte]) -> Result<Self, FilterError> {
        if bytes.len() != width * height * CHANNELS {
            return Err(FilterError::InvalidMatrix(format!(
                "{width}x{height} RGBA buffer needs {} bytes, got {}",
                width * height * CHANNELS,
                bytes.len()
            )));
        }
        let pixels = bytes
            .chunks_exact(CHANNELS)
            .map(|px| Pixel::new(px[0], px[1], px[2], px[3]))
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn to_rgba_bytes(&self) -> Vec<Byte> {
        self.pixels.iter().flat_map(|pixel| pixel.to_bytes()).collect()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    /// Pixel at column `x`, row `y`. Callers are expected to stay in bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Pixel {
        self.pixels[y * self.width + x]
    }

    /// Bounds-checked access for signed, kernel-relative coordinates.
    #[inline]
    pub fn get_signed(&self, x: isize, y: isize) -> Option<Pixel> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(self.pixels[y as usize * self.width + x as usize])
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Pixel]> {
        // chunks_exact(0) panics; a zero-width matrix has no pixels to chunk anyway.
        self.pixels.chunks_exact(self.width.max(1))
    }
}
