//! Device backends behind one trait.
//!
//! # Architecture
//!
//! ```text
//! GpuPrimitives (textures, buffers, kernels, encoders, readback)
//!     +-- CpuPrimitives  (in-memory, rayon; test fake and CPU fallback)
//!     +-- WgpuPrimitives (Vulkan/Metal/DX12 compute shaders)
//! ```
//!
//! Passes and pools only talk to [`GpuPrimitives`], so every pipeline
//! behavior can be exercised deterministically on the CPU backend.

mod cpu_backend;
mod cpu_kernels;
mod kernel;
mod primitives;

#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use cpu_backend::{CpuBuffer, CpuPrimitives, CpuTexture};
pub use kernel::{HistogramStrategy, KernelId, PipelineVariant};
pub use primitives::{
    BufferDesc, BufferKind, DispatchArgs, DispatchTarget, GpuBuffer, GpuPrimitives, GpuTexture, MapCallback,
    PollMode, TextureDesc, TimestampWrites, UsageClass, workgroups_1d, workgroups_2d,
};

#[cfg(feature = "wgpu")]
pub use wgpu_backend::{WgpuBuffer, WgpuPrimitives, WgpuTexture};

use tracing::debug;

pub(crate) use cpu_kernels::downsample_block;

/// Available device backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Auto-select best available (wgpu > CPU).
    #[default]
    Auto,
    /// In-memory CPU backend using rayon.
    Cpu,
    /// wgpu backend (Vulkan/Metal/DX12).
    Wgpu,
}

impl Backend {
    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Cpu => true,
            Self::Wgpu => probe_adapter().is_some(),
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        }
    }

    /// Parse a backend name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cpu" => Some(Self::Cpu),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            _ => None,
        }
    }

    /// Resolve `Auto` to a concrete backend.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => select_backend(probe_adapter().as_ref()),
            other => other,
        }
    }
}

/// Smallest texture edge that still fits a typical full-resolution photo.
pub const MIN_PHOTO_TEXTURE_SIZE: u32 = 4096;

/// What backend selection needs to know about a GPU adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSummary {
    /// Adapter name as reported by the driver.
    pub name: String,
    /// Software rasterizer such as llvmpipe or WARP.
    pub software: bool,
    /// Largest 2D texture edge.
    pub max_texture_size: u32,
}

impl AdapterSummary {
    /// Whether `Auto` picks this adapter over the CPU backend: hardware only,
    /// with room for [`MIN_PHOTO_TEXTURE_SIZE`] textures.
    pub fn beats_cpu(&self) -> bool {
        !self.software && self.max_texture_size >= MIN_PHOTO_TEXTURE_SIZE
    }
}

/// Backend `Auto` resolves to given the probed adapter, if any.
pub fn select_backend(adapter: Option<&AdapterSummary>) -> Backend {
    match adapter {
        Some(adapter) if adapter.beats_cpu() => Backend::Wgpu,
        Some(adapter) => {
            debug!(
                name = %adapter.name,
                software = adapter.software,
                max_texture = adapter.max_texture_size,
                "adapter passed over, using cpu"
            );
            Backend::Cpu
        }
        None => Backend::Cpu,
    }
}

#[cfg(feature = "wgpu")]
fn probe_adapter() -> Option<AdapterSummary> {
    WgpuPrimitives::probe_adapter()
}

#[cfg(not(feature = "wgpu"))]
fn probe_adapter() -> Option<AdapterSummary> {
    None
}
