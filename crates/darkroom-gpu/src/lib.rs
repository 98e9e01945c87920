//! GPU render pipeline for non-destructive photo edits.
//!
//! Renders rotation, global adjustments, tone curves and local masks on the
//! GPU for interactive preview and export, with a draft/full progressive
//! refinement loop and per-stage timing.
//!
//! # Architecture
//!
//! ```text
//! EditSession (idle -> interacting -> refining -> complete)
//!     └── EditPipeline<G> (caller-owned context, init/destroy)
//!             ├── TexturePool / StagingBufferPool / TimingHelper
//!             ├── Downsample, Rotation, Adjustments, ToneCurve, Masks, Uber passes
//!             ├── HistogramEngine (standard + subgroup, sync + async)
//!             └── GpuPrimitives trait
//!                     ├── CpuPrimitives  (in-memory, rayon)
//!                     └── WgpuPrimitives (compute shaders)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use darkroom_gpu::{CapabilityService, EditPipeline, PipelineConfig, WgpuPrimitives, DeviceConfig};
//! use darkroom_core::{Adjustments, EditParameters};
//!
//! let service = CapabilityService::new(|| WgpuPrimitives::open(&DeviceConfig::from_env()));
//! if !service.probe().available {
//!     return fallback();
//! }
//! let mut pipeline = EditPipeline::init(service.device()?, PipelineConfig::from_env())?;
//! let params = EditParameters::new().with_adjustments(Adjustments { exposure: 0.7, ..Default::default() });
//! let result = pipeline.process(&pixels, &params)?;
//! println!("{}", result.timing);
//! pipeline.destroy();
//! ```

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod histogram;
pub mod passes;
pub mod pipeline;
pub mod pool;
pub mod session;
pub mod timing;
mod shaders;
mod uniforms;

pub use backend::{
    select_backend, AdapterSummary, Backend, CpuPrimitives, GpuPrimitives,
    HistogramStrategy, KernelId, PipelineVariant, UsageClass,
};
#[cfg(feature = "wgpu")]
pub use backend::WgpuPrimitives;
pub use capabilities::{Capabilities, CapabilityService, DeviceLimits, FeatureSet};
pub use config::{DeviceConfig, DownsampleMode, PipelineConfig, PipelineConfigBuilder, SessionConfig};
pub use histogram::{HistogramEngine, HistogramRequest};
pub use passes::{downsample_cpu, DispatchStats};
pub use pipeline::{EditPipeline, PipelineResult, PipelineStats};
pub use pool::{PooledTexture, ReadbackHandle, StagingBufferPool, StagingStats, TexturePool, TexturePoolStats};
pub use session::{EditSession, RenderRequest, RenderTicket, SessionState, SessionStats};
pub use timing::{GpuTimings, TimingHelper};

use thiserror::Error;

/// Render pipeline errors.
///
/// A full staging pool is not an error; it surfaces as `None`. Plain
/// unavailability ([`GpuError::Unavailable`]) and device loss
/// ([`GpuError::DeviceLost`]) are kept distinct so callers can choose
/// between retrying initialization and falling back for good.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("GPU unavailable: {0}")]
    Unavailable(String),

    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    #[error("GPU transfer failed: {0}")]
    TransferFailed(String),

    #[error("Failed to allocate {what}: {reason}")]
    AllocationFailed { what: String, reason: String },

    #[error("Failed to compile shader {kernel}: {reason}")]
    ShaderCompilation { kernel: String, reason: String },

    #[error("Image too large: {width}x{height} exceeds GPU limit {limit}")]
    ImageTooLarge { width: u32, height: u32, limit: u32 },

    #[error("Pipeline has been destroyed")]
    PipelineDestroyed,

    #[error(transparent)]
    Core(#[from] darkroom_core::Error),

    #[error("GPU operation failed: {0}")]
    OperationFailed(String),
}

impl GpuError {
    /// True when the device is gone and nothing short of re-initialization helps.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }

    /// True for conditions the pipeline cannot recover from locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost(_) | Self::Unavailable(_) | Self::PipelineDestroyed)
    }
}

pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_distinct_from_unavailable() {
        let lost = GpuError::DeviceLost("reset".into());
        let unavailable = GpuError::Unavailable("no adapter".into());
        assert!(lost.is_device_lost());
        assert!(!unavailable.is_device_lost());
        assert!(lost.is_fatal() && unavailable.is_fatal());
        assert!(!GpuError::TransferFailed("map".into()).is_fatal());
    }

    #[test]
    fn core_errors_convert() {
        let err: GpuError = darkroom_core::Error::invalid_parameter("exposure", "nan").into();
        assert!(err.to_string().contains("exposure"));
    }
}
