//! Edit pipeline orchestrator.
//!
//! [`EditPipeline`] is the caller-owned render context. It owns every pool,
//! pass and kernel cache for one device and runs a render in a fixed order:
//!
//! ```text
//! downsample -> upload -> rotation -> adjustments/tone curve -> masks
//!     -> (analysis) -> readback
//! ```
//!
//! Stages are timed back to back and skipped stages read 0, so the timing
//! map always carries the same keys and the stages add up to the total.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use darkroom_core::{
    ClippingStats, EditParameters, HistogramResult, Mask, PixelBuffer, Quality, Stage, StageTimings,
};
use tracing::{debug, info, trace, warn};

use crate::backend::{GpuPrimitives, GpuTexture, HistogramStrategy, PipelineVariant, UsageClass};
use crate::capabilities::Capabilities;
use crate::config::{DownsampleMode, PipelineConfig};
use crate::histogram::{HistogramEngine, HistogramRequest, COUNTER_BYTES};
use crate::passes::{
    downsample_cpu, downsample_size, rotated_size, AdjustmentsPass, DownsamplePass, Frame, MasksPass, PassContext,
    RotationPass, ToneCurvePass, UberPass,
};
use crate::pool::{PooledTexture, StagingBufferPool, StagingStats, TexturePool, TexturePoolStats};
use crate::timing::{GpuTimings, TimingHelper};
use crate::{GpuError, GpuResult};

/// Output of one render.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Rendered pixels, in the input's pixel format.
    pub pixels: PixelBuffer,
    /// Wall-clock milliseconds per stage plus the total.
    pub timing: StageTimings,
    /// Quality tier that was rendered.
    pub quality: Quality,
    /// Most recent histogram. Draft renders carry none.
    pub histogram: Option<HistogramResult>,
    /// True when `histogram` comes from an earlier render: the staging pool
    /// was exhausted or this render's readback had not landed yet.
    pub histogram_stale: bool,
    /// Clipping derived from `histogram`.
    pub clipping: Option<ClippingStats>,
    /// Uber variant used, if the fused pass ran.
    pub variant: Option<PipelineVariant>,
    /// GPU nanoseconds per pass, when timestamp queries are available.
    pub gpu_timings: Option<GpuTimings>,
}

/// Combined counters of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Compute dispatches recorded.
    pub dispatches: u64,
    /// Kernels compiled.
    pub compiles: u64,
    /// Texture pool counters.
    pub textures: TexturePoolStats,
    /// Staging pool counters.
    pub staging: StagingStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Analysis {
    Skip,
    Async,
    Sync,
}

enum Lifecycle {
    Ready,
    Lost(String),
    Destroyed,
}

struct Rendered {
    pixels: PixelBuffer,
    histogram: Option<HistogramResult>,
    histogram_stale: bool,
    variant: Option<PipelineVariant>,
}

/// Caller-owned render context for one device.
///
/// Create with [`init`](Self::init), release with [`destroy`](Self::destroy)
/// (or drop). After device loss every call fails with
/// [`GpuError::DeviceLost`]; the pipeline never recreates the device.
pub struct EditPipeline<G: GpuPrimitives> {
    ctx: PassContext<G>,
    config: PipelineConfig,
    half_precision: bool,
    textures: TexturePool<G>,
    staging: StagingBufferPool<G>,
    timing: Option<TimingHelper<G>>,
    downsample: DownsamplePass<G>,
    rotation: RotationPass<G>,
    adjustments: AdjustmentsPass<G>,
    tone_curve: ToneCurvePass<G>,
    masks: MasksPass<G>,
    uber: UberPass<G>,
    histogram: Option<HistogramEngine<G>>,
    lifecycle: Lifecycle,
}

impl<G: GpuPrimitives> EditPipeline<G> {
    /// Build a pipeline on `device`.
    ///
    /// Kernels compile lazily on first use; only pools, the histogram
    /// counters and the timestamp query set are allocated here.
    pub fn init(device: Arc<G>, config: PipelineConfig) -> GpuResult<Self> {
        let caps = device.capabilities().clone();
        if !caps.available {
            return Err(GpuError::Unavailable(
                caps.unavailable_reason.unwrap_or_else(|| "device unavailable".into()),
            ));
        }

        let ctx = PassContext::new(device.clone());
        let staging = StagingBufferPool::with_capacity(device.clone(), config.staging_pool_size, COUNTER_BYTES)?;
        let timing = if config.gpu_timing {
            TimingHelper::new(&*device)?
        } else {
            None
        };
        let histogram = if config.analysis {
            Some(HistogramEngine::new(&ctx, config.allow_subgroups)?)
        } else {
            None
        };
        let half_precision = config.allow_half_precision && caps.features.half_precision;

        info!(
            backend = device.name(),
            staging = config.staging_pool_size,
            f16 = half_precision,
            timing = timing.is_some(),
            "edit pipeline initialized"
        );

        Ok(Self {
            ctx,
            config,
            half_precision,
            textures: TexturePool::new(device),
            staging,
            timing,
            downsample: DownsamplePass::new(),
            rotation: RotationPass::new(),
            adjustments: AdjustmentsPass::new(),
            tone_curve: ToneCurvePass::new(),
            masks: MasksPass::new(),
            uber: UberPass::new(),
            histogram,
            lifecycle: Lifecycle::Ready,
        })
    }

    /// Device capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        self.ctx.device().capabilities()
    }

    /// Configuration the pipeline was built with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Counters.
    pub fn stats(&self) -> PipelineStats {
        let dispatch = self.ctx.stats();
        PipelineStats {
            dispatches: dispatch.dispatches(),
            compiles: dispatch.compiles(),
            textures: self.textures.stats(),
            staging: self.staging.stats(),
        }
    }

    /// Uber variants compiled so far.
    pub fn uber_variants(&self) -> Vec<PipelineVariant> {
        self.uber.cached_variants()
    }

    /// Histogram strategy, if analysis is enabled.
    pub fn histogram_strategy(&self) -> Option<HistogramStrategy> {
        self.histogram.as_ref().map(HistogramEngine::strategy)
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Destroyed)
    }

    /// Whether the device was lost during an earlier call.
    pub fn is_lost(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Lost(_))
    }

    /// Render `pixels` with `params`.
    ///
    /// Full-quality renders request the histogram asynchronously and
    /// report the most recent one; draft renders skip analysis.
    pub fn process(&mut self, pixels: &PixelBuffer, params: &EditParameters) -> GpuResult<PipelineResult> {
        let analysis = match params.quality {
            Quality::Full if self.histogram.is_some() => Analysis::Async,
            _ => Analysis::Skip,
        };
        self.run(pixels, params, analysis)
    }

    /// Full-quality, full-resolution render with a synchronous histogram.
    pub fn export(&mut self, pixels: &PixelBuffer, params: &EditParameters) -> GpuResult<PipelineResult> {
        let mut params = params.clone();
        params.quality = Quality::Full;
        params.target_resolution_scale = None;
        let analysis = if self.histogram.is_some() { Analysis::Sync } else { Analysis::Skip };
        self.run(pixels, &params, analysis)
    }

    /// Deliver finished async readbacks. Returns how many completed.
    pub fn pump(&mut self) -> GpuResult<usize> {
        self.check_ready()?;
        let delivered = self.staging.pump();
        self.note_loss(delivered)
    }

    /// Most recent histogram delivered by any render.
    pub fn latest_histogram(&self) -> Option<HistogramResult> {
        self.histogram.as_ref().and_then(HistogramEngine::latest)
    }

    /// Release every GPU resource. In-flight readbacks are cancelled and
    /// their callbacks never run. Idempotent.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        let device = self.ctx.device().clone();
        self.staging.destroy();
        if let Some(histogram) = &self.histogram {
            histogram.destroy(&device);
        }
        if let Some(timing) = &self.timing {
            timing.destroy(&device);
        }
        self.textures.clear();
        self.lifecycle = Lifecycle::Destroyed;
        debug!("edit pipeline destroyed");
    }

    fn check_ready(&self) -> GpuResult<()> {
        match &self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Lost(reason) => Err(GpuError::DeviceLost(reason.clone())),
            Lifecycle::Destroyed => Err(GpuError::PipelineDestroyed),
        }
    }

    fn note_loss<T>(&mut self, result: GpuResult<T>) -> GpuResult<T> {
        if let Err(GpuError::DeviceLost(reason)) = &result {
            warn!(%reason, "device lost, pipeline disabled");
            self.lifecycle = Lifecycle::Lost(reason.clone());
        }
        result
    }

    fn run(&mut self, pixels: &PixelBuffer, params: &EditParameters, analysis: Analysis) -> GpuResult<PipelineResult> {
        self.check_ready()?;
        params.validate()?;

        let mut clock = StageClock::start();
        let mut held = Vec::new();
        let rendered = self.render(pixels, params, analysis, &mut clock, &mut held);
        for texture in held {
            self.textures.release(texture);
        }
        let rendered = self.note_loss(rendered)?;

        let gpu_timings = match &self.timing {
            Some(helper) => helper.collect(self.ctx.device()).unwrap_or_else(|e| {
                warn!(error = %e, "gpu timestamps unavailable");
                None
            }),
            None => None,
        };
        // Pool returns and timestamp collection count as readback.
        clock.lap(Stage::Readback);
        let timing = clock.finish();
        trace!(%timing, "render finished");

        let clipping = rendered.histogram.as_ref().map(HistogramResult::clipping);
        Ok(PipelineResult {
            pixels: rendered.pixels,
            timing,
            quality: params.quality,
            histogram: rendered.histogram,
            histogram_stale: rendered.histogram_stale,
            clipping,
            variant: rendered.variant,
            gpu_timings,
        })
    }

    /// Record and submit one render. Every acquired texture is pushed to
    /// `held` so the caller can return it to the pool even on error.
    fn render(
        &mut self,
        pixels: &PixelBuffer,
        params: &EditParameters,
        analysis: Analysis,
        clock: &mut StageClock,
        held: &mut Vec<PooledTexture<G>>,
    ) -> GpuResult<Rendered> {
        let device = self.ctx.device().clone();
        let caps = device.capabilities().clone();
        let scale = params.scale();

        // Downsample (CPU mode runs before upload).
        let working: Cow<'_, PixelBuffer> = match self.config.downsample_mode {
            DownsampleMode::Cpu => downsample_cpu(pixels, scale),
            DownsampleMode::Gpu => Cow::Borrowed(pixels),
        };
        if matches!(working, Cow::Owned(_)) {
            clock.lap(Stage::Downsample);
        }

        // Upload
        caps.check_texture_size(working.width(), working.height())?;
        held.push(self.ctx.upload(&mut self.textures, &working)?);
        let mut current = held.len() - 1;
        clock.lap(Stage::Upload);

        if let Some(helper) = self.timing.as_mut() {
            helper.begin_frame();
        }
        let mut frame = Frame::new(&*device, "render", self.timing.as_mut());

        if self.config.downsample_mode == DownsampleMode::Gpu {
            if let Some((nw, nh)) = downsample_size(working.width(), working.height(), scale) {
                held.push(self.textures.acquire(nw, nh, UsageClass::RenderTarget, "downsample")?);
                let next = held.len() - 1;
                self.downsample.encode(&self.ctx, &mut frame, &held[current], &held[next])?;
                current = next;
                clock.lap(Stage::Downsample);
            }
        }

        // Rotation
        if let Some(degrees) = params.effective_rotation() {
            let (w, h) = (held[current].width(), held[current].height());
            let (nw, nh) = rotated_size(w, h, degrees);
            caps.check_texture_size(nw, nh)?;
            held.push(self.textures.acquire(nw, nh, UsageClass::RenderTarget, "rotation")?);
            let next = held.len() - 1;
            self.rotation.encode(&self.ctx, &mut frame, &held[current], &held[next], degrees)?;
            current = next;
            clock.lap(Stage::Rotation);
        }

        // Adjustments and tone curve, fused when both are active.
        let (w, h) = (held[current].width(), held[current].height());
        let adjustments = params.effective_adjustments();
        let tone_curve = params.effective_tone_curve();
        let mut variant = None;
        match (adjustments, tone_curve) {
            (Some(adj), Some(lut)) => {
                held.push(self.textures.acquire(w, h, UsageClass::RenderTarget, "uber")?);
                let next = held.len() - 1;
                variant = self.uber.encode(
                    &self.ctx,
                    &mut frame,
                    &held[current],
                    &held[next],
                    Some(adj),
                    Some(lut),
                    self.half_precision,
                )?;
                current = next;
                // Fused work is reported under adjustments; tone curve stays 0.
                clock.lap(Stage::Adjustments);
            }
            (adj, lut) => {
                if let Some(adj) = adj {
                    held.push(self.textures.acquire(w, h, UsageClass::RenderTarget, "adjustments")?);
                    let next = held.len() - 1;
                    self.adjustments.encode(&self.ctx, &mut frame, &held[current], &held[next], adj)?;
                    current = next;
                    clock.lap(Stage::Adjustments);
                }

                if let Some(lut) = lut {
                    held.push(self.textures.acquire(w, h, UsageClass::RenderTarget, "tone_curve")?);
                    let next = held.len() - 1;
                    self.tone_curve.encode(&self.ctx, &mut frame, &held[current], &held[next], lut)?;
                    current = next;
                    clock.lap(Stage::ToneCurve);
                }
            }
        }

        // Masks
        let masks: Vec<&Mask> = params.effective_masks().collect();
        if !masks.is_empty() {
            held.push(self.textures.acquire(w, h, UsageClass::RenderTarget, "masks")?);
            let next = held.len() - 1;
            self.masks.encode(&self.ctx, &mut frame, &held[current], &held[next], masks)?;
            current = next;
            clock.lap(Stage::Masks);
        }

        frame.submit(&*device)?;
        clock.lap(Stage::Readback);

        // Analysis
        let analysed = analysis != Analysis::Skip && self.histogram.is_some();
        let (histogram, histogram_stale) = match (analysis, self.histogram.as_mut()) {
            (Analysis::Sync, Some(engine)) => {
                let result = engine.compute_sync(&self.ctx, &held[current], self.timing.as_mut())?;
                (Some(result), false)
            }
            (Analysis::Async, Some(engine)) => {
                let request = engine.request_async(&self.ctx, &mut self.staging, &held[current], self.timing.as_mut())?;
                self.staging.pump()?;
                match request {
                    HistogramRequest::Scheduled { seq, .. } => {
                        let (latest, stale) = engine.latest_since(seq);
                        if stale {
                            debug!(seq, "histogram readback not delivered yet, previous result reused");
                        }
                        (latest, stale)
                    }
                    HistogramRequest::Stale(previous) => {
                        debug!("staging pool exhausted, histogram reused");
                        (previous, true)
                    }
                }
            }
            _ => (None, false),
        };
        if analysed {
            clock.lap(Stage::Analysis);
        }

        // Readback
        let target = &held[current];
        let rgba = device.read_texture(target)?;
        let out = PixelBuffer::from_rgba(rgba, target.width(), target.height(), pixels.format())?;
        clock.lap(Stage::Readback);

        Ok(Rendered {
            pixels: out,
            histogram,
            histogram_stale,
            variant,
        })
    }
}

impl<G: GpuPrimitives> Drop for EditPipeline<G> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Back-to-back stage timer. Each lap runs from the end of the previous one,
/// so the recorded stages cover the whole measured total. A skipped stage
/// takes no lap and stays 0; its bookkeeping rolls into the next lap.
struct StageClock {
    timings: StageTimings,
    started: Instant,
    last: Instant,
}

impl StageClock {
    fn start() -> Self {
        let now = Instant::now();
        Self {
            timings: StageTimings::new(),
            started: now,
            last: now,
        }
    }

    /// Charge the time since the previous lap to `stage`.
    fn lap(&mut self, stage: Stage) {
        let now = Instant::now();
        self.timings.record(stage, ms_between(self.last, now));
        self.last = now;
    }

    fn finish(mut self) -> StageTimings {
        self.timings.set_total(ms_between(self.started, self.last));
        self.timings
    }
}

fn ms_between(start: Instant, end: Instant) -> f64 {
    end.duration_since(start).as_secs_f64() * 1000.0
}
