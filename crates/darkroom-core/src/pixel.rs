//! Decoded 8-bit pixel buffers handed to and returned from the pipeline.
//!
//! The pipeline works in RGBA internally. Callers may pass tightly packed
//! RGB or RGBA rows; [`PixelBuffer::to_rgba`] and [`PixelBuffer::from_rgba`]
//! convert at the boundary.

use std::borrow::Cow;
use std::fmt;

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Rec. 709 luma coefficient for red.
pub const REC709_LUMA_R: f32 = 0.2126;
/// Rec. 709 luma coefficient for green.
pub const REC709_LUMA_G: f32 = 0.7152;
/// Rec. 709 luma coefficient for blue.
pub const REC709_LUMA_B: f32 = 0.0722;

/// Rec. 709 luminance of a normalized RGB triple.
#[inline]
pub fn luminance_rec709(r: f32, g: f32, b: f32) -> f32 {
    REC709_LUMA_R * r + REC709_LUMA_G * g + REC709_LUMA_B * b
}

/// Byte layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// Three bytes per pixel, no alpha.
    Rgb,
    /// Four bytes per pixel, straight alpha.
    #[default]
    Rgba,
}

impl PixelFormat {
    /// Bytes (channels) per pixel.
    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rgb => write!(f, "RGB"),
            Self::Rgba => write!(f, "RGBA"),
        }
    }
}

/// A tightly packed 8-bit image.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl PixelBuffer {
    /// Wraps `data`, validating its length against the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = byte_len(width, height, format)?;
        if data.len() != expected {
            return Err(Error::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height, format })
    }

    /// Creates a buffer filled with one color. `value` is RGBA; the alpha
    /// byte is dropped for RGB buffers.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: [u8; 4]) -> Result<Self> {
        let len = byte_len(width, height, format)?;
        let c = format.channels();
        let mut data = vec![0u8; len];
        data.par_chunks_mut(c).for_each(|px| px.copy_from_slice(&value[..c]));
        Ok(Self { data, width, height, format })
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Number of pixels.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw bytes.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the buffer, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// RGBA value of the pixel at (x, y); alpha is 255 for RGB buffers.
    ///
    /// Returns `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let c = self.format.channels();
        let i = (y as usize * self.width as usize + x as usize) * c;
        let px = &self.data[i..i + c];
        Some(match self.format {
            PixelFormat::Rgb => [px[0], px[1], px[2], 255],
            PixelFormat::Rgba => [px[0], px[1], px[2], px[3]],
        })
    }

    /// RGBA view of the pixels: borrowed when already RGBA, expanded with
    /// opaque alpha otherwise.
    pub fn to_rgba(&self) -> Cow<'_, [u8]> {
        match self.format {
            PixelFormat::Rgba => Cow::Borrowed(&self.data),
            PixelFormat::Rgb => {
                let mut out = vec![0u8; self.pixel_count() * 4];
                out.par_chunks_mut(4)
                    .zip(self.data.par_chunks(3))
                    .for_each(|(dst, src)| {
                        dst[..3].copy_from_slice(src);
                        dst[3] = 255;
                    });
                Cow::Owned(out)
            }
        }
    }

    /// Builds a buffer of `format` from packed RGBA bytes, dropping alpha
    /// when `format` is RGB.
    pub fn from_rgba(rgba: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = byte_len(width, height, PixelFormat::Rgba)?;
        if rgba.len() != expected {
            return Err(Error::BufferSizeMismatch {
                expected,
                actual: rgba.len(),
            });
        }
        match format {
            PixelFormat::Rgba => Ok(Self { data: rgba, width, height, format }),
            PixelFormat::Rgb => {
                let mut out = vec![0u8; width as usize * height as usize * 3];
                out.par_chunks_mut(3)
                    .zip(rgba.par_chunks(4))
                    .for_each(|(dst, src)| dst.copy_from_slice(&src[..3]));
                Ok(Self { data: out, width, height, format })
            }
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Byte length of a `width x height` image, rejecting empty or overflowing sizes.
pub fn byte_len(width: u32, height: u32, format: PixelFormat) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(Error::invalid_dimensions(width, height, "width and height must be non-zero"));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(format.channels()))
        .ok_or_else(|| Error::invalid_dimensions(width, height, "byte size overflows"))
}
