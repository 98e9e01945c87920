//! Error types for darkroom-core values.
//!
//! Everything in this crate is a plain value, so the only failures are
//! construction-time validation errors: a pixel buffer whose byte length
//! does not match its dimensions, zero-sized images, or edit parameters
//! outside their documented range.
//!
//! # Usage
//!
//! ```rust
//! use darkroom_core::{Error, PixelBuffer, PixelFormat};
//!
//! let err = PixelBuffer::new(vec![0; 5], 2, 2, PixelFormat::Rgb).unwrap_err();
//! assert!(matches!(err, Error::BufferSizeMismatch { expected: 12, actual: 5 }));
//! ```
//!
//! # Used By
//!
//! - [`crate::PixelBuffer`] - length and dimension validation
//! - [`crate::EditParameters`] - range validation
//! - `darkroom-gpu` - wrapped as `GpuError::Core`

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Validation errors for core value types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Width or height is zero, or the byte size overflows `usize`.
    #[error("invalid dimensions: {width}x{height} ({reason})")]
    InvalidDimensions {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Reason why dimensions are invalid
        reason: String,
    },

    /// Pixel data length does not match `width * height * channels`.
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// An edit parameter is out of range or not finite.
    ///
    /// ```rust
    /// use darkroom_core::Error;
    ///
    /// let err = Error::invalid_parameter("targetResolutionScale", "must be in (0, 1]");
    /// assert!(err.to_string().contains("targetResolutionScale"));
    /// ```
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl Error {
    /// Creates an [`Error::InvalidDimensions`] error.
    pub fn invalid_dimensions(width: u32, height: u32, reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            width,
            height,
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::InvalidParameter`] error.
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = Error::invalid_dimensions(0, 10, "zero width");
        assert_eq!(err.to_string(), "invalid dimensions: 0x10 (zero width)");

        let err = Error::BufferSizeMismatch { expected: 12, actual: 5 };
        assert!(err.to_string().contains("12"));
        assert!(err.to_string().contains("5"));
    }

    #[test]
    fn parameter_helper() {
        let err = Error::invalid_parameter("exposure", "not finite");
        assert_eq!(
            err,
            Error::InvalidParameter {
                name: "exposure",
                reason: "not finite".into()
            }
        );
    }
}
