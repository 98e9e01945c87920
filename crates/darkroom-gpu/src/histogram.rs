//! Histogram engine.
//!
//! Accumulates red, green, blue and luminance histograms of a rendered
//! texture into a 1024-word counter buffer. Two reduction strategies exist;
//! both produce exactly the same counts:
//!
//! - [`HistogramStrategy::Standard`]: 16x16 workgroups with workgroup-local
//!   bins, flushed to the global counters once per workgroup.
//! - [`HistogramStrategy::Subgroup`]: 256-wide workgroups that merge equal
//!   bins across a subgroup before touching local memory.
//!
//! Results come back either synchronously (export) or through the staging
//! ring (interactive). When the ring is full the async path hands back the
//! last delivered result, marked stale, rather than inventing one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use darkroom_core::{HistogramResult, COUNTER_WORDS};
use tracing::{debug, trace, warn};

use crate::backend::{
    workgroups_1d, workgroups_2d, BufferDesc, BufferKind, DispatchTarget, GpuPrimitives, GpuTexture,
    HistogramStrategy, KernelId,
};
use crate::passes::{Frame, PassContext};
use crate::pool::{ReadbackHandle, StagingBufferPool};
use crate::timing::TimingHelper;
use crate::uniforms::SizeUniform;
use crate::{GpuError, GpuResult};

/// Bytes of the packed counter buffer.
pub const COUNTER_BYTES: u64 = COUNTER_WORDS as u64 * 4;

const SUBGROUP_WORKGROUP: u32 = 256;

/// Outcome of [`HistogramEngine::request_async`].
#[derive(Debug)]
pub enum HistogramRequest {
    /// Readback in flight. The result lands in [`HistogramEngine::latest`]
    /// once the staging pool is pumped; `seq` identifies it there.
    Scheduled { handle: ReadbackHandle, seq: u64 },
    /// Staging pool exhausted; nothing was dispatched. Carries the last
    /// delivered result, if any.
    Stale(Option<HistogramResult>),
}

impl HistogramRequest {
    /// Whether a readback was issued.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// Latest delivered result, tagged with the request it came from so a
/// late delivery never overwrites a newer one.
#[derive(Default)]
struct Latest {
    seq: u64,
    result: Option<HistogramResult>,
}

/// Histogram accumulation with a per-engine counter buffer.
pub struct HistogramEngine<G: GpuPrimitives> {
    strategy: HistogramStrategy,
    kernel: Option<G::Kernel>,
    counters: G::Buffer,
    next_seq: AtomicU64,
    latest: Arc<Mutex<Latest>>,
}

impl<G: GpuPrimitives> HistogramEngine<G> {
    /// Engine using the subgroup strategy when `allow_subgroups` is set and
    /// the device supports it.
    pub fn new(ctx: &PassContext<G>, allow_subgroups: bool) -> GpuResult<Self> {
        let device = ctx.device();
        let strategy = if allow_subgroups && device.capabilities().features.subgroups {
            HistogramStrategy::Subgroup
        } else {
            HistogramStrategy::Standard
        };
        Self::with_strategy(ctx, strategy)
    }

    /// Engine with a fixed strategy.
    pub fn with_strategy(ctx: &PassContext<G>, strategy: HistogramStrategy) -> GpuResult<Self> {
        let counters = ctx.device().create_buffer(&BufferDesc {
            label: "histogram_counters",
            size: COUNTER_BYTES,
            kind: BufferKind::Counters,
        })?;
        debug!(?strategy, "histogram engine created");
        Ok(Self {
            strategy,
            kernel: None,
            counters,
            next_seq: AtomicU64::new(0),
            latest: Arc::new(Mutex::new(Latest::default())),
        })
    }

    /// Active strategy. Changes to `Standard` if the subgroup kernel fails
    /// to compile.
    pub fn strategy(&self) -> HistogramStrategy {
        self.strategy
    }

    /// Compile the kernel on first use.
    fn ensure_kernel(&mut self, ctx: &PassContext<G>) -> GpuResult<()> {
        if self.kernel.is_some() {
            return Ok(());
        }
        let kernel = match ctx.compile(KernelId::Histogram(self.strategy)) {
            Ok(kernel) => kernel,
            Err(GpuError::ShaderCompilation { reason, .. }) if self.strategy == HistogramStrategy::Subgroup => {
                warn!(%reason, "subgroup histogram unavailable, using standard strategy");
                self.strategy = HistogramStrategy::Standard;
                ctx.compile(KernelId::Histogram(self.strategy))?
            }
            Err(e) => return Err(e),
        };
        self.kernel = Some(kernel);
        Ok(())
    }

    /// Record zeroing the counters and accumulating `texture` into them.
    pub fn encode(&mut self, ctx: &PassContext<G>, frame: &mut Frame<'_, G>, texture: &G::Texture) -> GpuResult<()> {
        let (width, height) = (texture.width(), texture.height());
        let max_per_dim = ctx.device().capabilities().limits.max_workgroups_per_dimension;
        // Compiling may downgrade the strategy.
        self.ensure_kernel(ctx)?;
        let workgroups = match self.strategy {
            HistogramStrategy::Standard => workgroups_2d(width, height, 16),
            HistogramStrategy::Subgroup => {
                workgroups_1d(width as u64 * height as u64, SUBGROUP_WORKGROUP, max_per_dim)
            }
        };
        let uniform = SizeUniform::new(width, height);

        ctx.device().encode_clear_buffer(frame.encoder(), &self.counters);
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| GpuError::OperationFailed("histogram kernel missing".into()))?;
        ctx.dispatch(
            frame,
            kernel,
            "histogram",
            texture,
            DispatchTarget::Counters(&self.counters),
            bytemuck::bytes_of(&uniform),
            None,
            workgroups,
        )
    }

    /// Read the counters of the last submitted [`encode`](Self::encode),
    /// blocking until the GPU finishes.
    pub fn read_sync(&self, device: &G) -> GpuResult<HistogramResult> {
        let bytes = device.read_buffer(&self.counters)?;
        let result = HistogramResult::from_counter_bytes(&bytes)
            .ok_or_else(|| GpuError::TransferFailed(format!("histogram readback returned {} bytes", bytes.len())))?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        store(&self.latest, seq, result.clone());
        Ok(result)
    }

    /// Histogram of `texture`, computed and read back before returning.
    pub fn compute_sync(
        &mut self,
        ctx: &PassContext<G>,
        texture: &G::Texture,
        timing: Option<&mut TimingHelper<G>>,
    ) -> GpuResult<HistogramResult> {
        let device = ctx.device().clone();
        let mut frame = Frame::new(&*device, "histogram", timing);
        self.encode(ctx, &mut frame, texture)?;
        frame.submit(&*device)?;
        self.read_sync(&device)
    }

    /// Dispatch the histogram of `texture` and read it back through
    /// `staging` without blocking.
    ///
    /// When no staging buffer is free nothing is dispatched and the last
    /// delivered result comes back as [`HistogramRequest::Stale`].
    pub fn request_async(
        &mut self,
        ctx: &PassContext<G>,
        staging: &mut StagingBufferPool<G>,
        texture: &G::Texture,
        timing: Option<&mut TimingHelper<G>>,
    ) -> GpuResult<HistogramRequest> {
        if staging.stats().free == 0 {
            trace!("staging exhausted, returning stale histogram");
            return Ok(HistogramRequest::Stale(self.latest()));
        }

        let device = ctx.device().clone();
        let mut frame = Frame::new(&*device, "histogram", timing);
        self.encode(ctx, &mut frame, texture)?;
        frame.submit(&*device)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let latest = self.latest.clone();
        let handle = staging.readback_async(&self.counters, COUNTER_BYTES, move |bytes| {
            match HistogramResult::from_counter_bytes(&bytes) {
                Some(result) => store(&latest, seq, result),
                None => warn!(len = bytes.len(), "short histogram readback dropped"),
            }
        })?;
        Ok(match handle {
            Some(handle) => HistogramRequest::Scheduled { handle, seq },
            None => HistogramRequest::Stale(self.latest()),
        })
    }

    /// Most recent delivered result.
    pub fn latest(&self) -> Option<HistogramResult> {
        self.latest.lock().ok().and_then(|l| l.result.clone())
    }

    /// Most recent delivered result, and whether it predates request `seq`.
    pub fn latest_since(&self, seq: u64) -> (Option<HistogramResult>, bool) {
        match self.latest.lock() {
            Ok(latest) => (latest.result.clone(), latest.seq < seq),
            Err(_) => (None, true),
        }
    }

    /// Free the counter buffer.
    pub fn destroy(&self, device: &G) {
        device.destroy_buffer(&self.counters);
    }
}

fn store(latest: &Mutex<Latest>, seq: u64, result: HistogramResult) {
    match latest.lock() {
        Ok(mut latest) if seq > latest.seq => {
            latest.seq = seq;
            latest.result = Some(result);
        }
        Ok(_) => trace!(seq, "older histogram delivery ignored"),
        Err(_) => warn!("histogram result lock poisoned"),
    }
}
