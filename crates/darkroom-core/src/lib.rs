//! # darkroom-core
//!
//! Value types for the darkroom photo-edit render pipeline.
//!
//! - [`PixelBuffer`], [`PixelFormat`] - decoded 8-bit images at the pipeline boundary
//! - [`EditParameters`], [`Adjustments`], [`ToneCurveLut`], [`Mask`] - what to render
//! - [`HistogramResult`], [`ClippingStats`] - analysis output
//! - [`Stage`], [`StageTimings`] - per-stage timing breakdown
//!
//! ## Crate Structure
//!
//! ```text
//! darkroom-core (this crate, no GPU dependency)
//!    ^
//!    |
//!    +-- darkroom-gpu (backends, passes, pipeline)
//!    +-- darkroom-bench
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod histogram;
pub mod params;
pub mod pixel;
pub mod timing;

pub use error::{Error, Result};
pub use histogram::{luminance_bin, ClippingStats, HistogramResult, BINS, COUNTER_WORDS};
pub use params::{Adjustments, EditParameters, Mask, MaskGeometry, Quality, ToneCurveLut};
pub use pixel::{
    byte_len, luminance_rec709, PixelBuffer, PixelFormat, REC709_LUMA_B, REC709_LUMA_G, REC709_LUMA_R,
};
pub use timing::{Stage, StageTimings};

/// Prelude module for convenient imports.
///
/// ```
/// use darkroom_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::histogram::{ClippingStats, HistogramResult};
    pub use crate::params::{Adjustments, EditParameters, Mask, MaskGeometry, Quality, ToneCurveLut};
    pub use crate::pixel::{PixelBuffer, PixelFormat};
    pub use crate::timing::{Stage, StageTimings};
}
