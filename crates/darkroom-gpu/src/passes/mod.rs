//! Compute passes.
//!
//! Each pass owns its compiled kernels (compiled on first use, reused for
//! every later call) and records one dispatch per call into a shared
//! [`Frame`]. Passes recorded into the same frame execute in order, so a
//! pass may read what the previous one wrote.

mod adjustments;
mod downsample;
mod masks;
mod rotation;
mod tone_curve;
mod uber;

pub use adjustments::AdjustmentsPass;
pub use downsample::{downsample_cpu, downsample_size, DownsamplePass};
pub use masks::MasksPass;
pub use rotation::{rotated_size, RotationPass};
pub use tone_curve::ToneCurvePass;
pub use uber::UberPass;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use darkroom_core::PixelBuffer;
use tracing::trace;

use crate::backend::{DispatchArgs, DispatchTarget, GpuPrimitives, KernelId, UsageClass};
use crate::pool::{PooledTexture, TexturePool};
use crate::timing::TimingHelper;
use crate::GpuResult;

/// Workgroup edge for the 16x16 image kernels.
pub(crate) const TILE: u32 = 16;

/// Dispatch and compile counters shared by every pass of one pipeline.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatches: AtomicU64,
    compiles: AtomicU64,
}

impl DispatchStats {
    /// Compute dispatches recorded.
    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Kernels compiled.
    pub fn compiles(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }
}

/// Device handle and counters handed to every pass.
pub struct PassContext<G: GpuPrimitives> {
    device: Arc<G>,
    stats: Arc<DispatchStats>,
}

impl<G: GpuPrimitives> Clone for PassContext<G> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<G: GpuPrimitives> PassContext<G> {
    pub fn new(device: Arc<G>) -> Self {
        Self {
            device,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Device every pass dispatches on.
    pub fn device(&self) -> &Arc<G> {
        &self.device
    }

    /// Dispatch counters shared by every pass.
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Compile a kernel and count it.
    pub(crate) fn compile(&self, id: KernelId) -> GpuResult<G::Kernel> {
        let kernel = self.device.create_kernel(id)?;
        self.stats.compiles.fetch_add(1, Ordering::Relaxed);
        Ok(kernel)
    }

    /// The kernel cached in `slot`, compiling it on first use.
    pub(crate) fn kernel<'k>(&self, slot: &'k mut Option<G::Kernel>, id: KernelId) -> GpuResult<&'k G::Kernel> {
        let kernel = match slot.take() {
            Some(kernel) => kernel,
            None => self.compile(id)?,
        };
        Ok(slot.insert(kernel))
    }

    /// Record one dispatch into `frame`, with timestamps when the frame is
    /// timed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dispatch(
        &self,
        frame: &mut Frame<'_, G>,
        kernel: &G::Kernel,
        label: &'static str,
        input: &G::Texture,
        target: DispatchTarget<'_, G>,
        uniforms: &[u8],
        storage: Option<&[u8]>,
        workgroups: [u32; 3],
    ) -> GpuResult<()> {
        let timestamps = frame.timing.as_deref_mut().and_then(|t| t.next_writes(label));
        let args = DispatchArgs {
            input,
            target,
            uniforms,
            storage,
            workgroups,
            timestamps,
        };
        self.device.encode_dispatch(&mut frame.encoder, kernel, &args)?;
        self.stats.dispatches.fetch_add(1, Ordering::Relaxed);
        trace!(pass = label, ?workgroups, "dispatch");
        Ok(())
    }

    /// Upload `pixels` into a pooled source texture.
    pub(crate) fn upload(&self, pool: &mut TexturePool<G>, pixels: &PixelBuffer) -> GpuResult<PooledTexture<G>> {
        let texture = pool.acquire(pixels.width(), pixels.height(), UsageClass::Source, "source")?;
        if let Err(e) = self.device.write_texture(&texture, &pixels.to_rgba()) {
            pool.release(texture);
            return Err(e);
        }
        Ok(texture)
    }
}

/// One command encoder plus the optional timing helper for its passes.
pub struct Frame<'t, G: GpuPrimitives> {
    encoder: G::Encoder,
    timing: Option<&'t mut TimingHelper<G>>,
}

impl<'t, G: GpuPrimitives> Frame<'t, G> {
    /// Open an encoder, timestamping each pass when `timing` is given.
    pub fn new(device: &G, label: &str, timing: Option<&'t mut TimingHelper<G>>) -> Self {
        Self {
            encoder: device.begin_encoder(label),
            timing,
        }
    }

    /// Mutable access to the encoder for non-dispatch commands.
    pub fn encoder(&mut self) -> &mut G::Encoder {
        &mut self.encoder
    }

    /// Resolve timestamps (if timed) and submit.
    pub fn submit(mut self, device: &G) -> GpuResult<()> {
        if let Some(timing) = self.timing.as_deref() {
            timing.resolve(device, &mut self.encoder);
        }
        device.submit(self.encoder)
    }
}
