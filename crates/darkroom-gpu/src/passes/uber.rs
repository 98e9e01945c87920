//! Fused adjustments + tone-curve pass.
//!
//! One dispatch replaces the two standalone passes when both are active.
//! Kernels are cached per [`PipelineVariant`]; parameter values live in
//! uniforms and never force a recompile.
//!
//! The half-precision variant only rounds the white-balance multipliers,
//! the exposure and contrast factors, the whites/blacks remap and the
//! saturation scale. Highlights, shadows, vibrance and the curve lookup
//! stay in `f32`.

use std::collections::HashMap;

use darkroom_core::{Adjustments, PixelBuffer, ToneCurveLut};
use tracing::{debug, warn};

use super::{Frame, PassContext, TILE};
use crate::backend::{workgroups_2d, DispatchTarget, GpuPrimitives, GpuTexture, KernelId, PipelineVariant, UsageClass};
use crate::pool::TexturePool;
use crate::uniforms::{lut_words, AdjustUniform};
use crate::{GpuError, GpuResult};

pub struct UberPass<G: GpuPrimitives> {
    variants: HashMap<PipelineVariant, G::Kernel>,
    half_unavailable: bool,
}

impl<G: GpuPrimitives> Default for UberPass<G> {
    fn default() -> Self {
        Self {
            variants: HashMap::new(),
            half_unavailable: false,
        }
    }
}

impl<G: GpuPrimitives> UberPass<G> {
    /// Pass with an empty variant cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Variants compiled so far.
    pub fn cached_variants(&self) -> Vec<PipelineVariant> {
        let mut variants: Vec<_> = self.variants.keys().copied().collect();
        variants.sort_by_key(|v| *v as u8);
        variants
    }

    /// Number of compiled variants.
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Pick the variant for the active operations.
    pub fn select(&self, adjustments: bool, tone_curve: bool, half_precision: bool) -> Option<PipelineVariant> {
        PipelineVariant::select(adjustments, tone_curve, half_precision && !self.half_unavailable)
    }

    /// Kernel for `variant`, compiling on first use. A half-precision
    /// variant that fails to compile is remembered and replaced by its
    /// full-precision equivalent for the rest of the pass's life.
    fn kernel(&mut self, ctx: &PassContext<G>, variant: PipelineVariant) -> GpuResult<(PipelineVariant, &G::Kernel)> {
        let mut variant = variant;
        if variant.is_half_precision() && self.half_unavailable {
            variant = variant.full_precision();
        }
        if !self.variants.contains_key(&variant) {
            match ctx.compile(KernelId::Uber(variant)) {
                Ok(kernel) => {
                    debug!(?variant, "uber variant compiled");
                    self.variants.insert(variant, kernel);
                }
                Err(GpuError::ShaderCompilation { reason, .. }) if variant.is_half_precision() => {
                    warn!(%reason, "half-precision uber variant unavailable, using full precision");
                    self.half_unavailable = true;
                    variant = variant.full_precision();
                    if !self.variants.contains_key(&variant) {
                        let kernel = ctx.compile(KernelId::Uber(variant))?;
                        debug!(?variant, "uber variant compiled");
                        self.variants.insert(variant, kernel);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        match self.variants.get(&variant) {
            Some(kernel) => Ok((variant, kernel)),
            None => Err(GpuError::OperationFailed(format!("uber variant {variant:?} missing"))),
        }
    }

    /// Record the fused pass for the non-identity inputs.
    ///
    /// Returns the variant that ran, or `None` (recording nothing) when
    /// both inputs are absent or identity.
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &mut self,
        ctx: &PassContext<G>,
        frame: &mut Frame<'_, G>,
        input: &G::Texture,
        output: &G::Texture,
        adjustments: Option<&Adjustments>,
        tone_curve: Option<&ToneCurveLut>,
        half_precision: bool,
    ) -> GpuResult<Option<PipelineVariant>> {
        let adjustments = adjustments.filter(|a| !a.is_identity());
        let tone_curve = tone_curve.filter(|l| !l.is_identity());
        let Some(variant) = self.select(adjustments.is_some(), tone_curve.is_some(), half_precision) else {
            return Ok(None);
        };

        let (variant, kernel) = self.kernel(ctx, variant)?;
        let uniform = AdjustUniform::new(input.width(), input.height(), adjustments);
        let table = match tone_curve {
            Some(lut) if variant.has_tone_curve() => Some(lut_words(lut.as_slice())),
            _ => None,
        };
        ctx.dispatch(
            frame,
            kernel,
            KernelId::Uber(variant).label(),
            input,
            DispatchTarget::Texture(output),
            bytemuck::bytes_of(&uniform),
            table.as_deref(),
            workgroups_2d(input.width(), input.height(), TILE),
        )?;
        Ok(Some(variant))
    }

    /// Standalone fused render of a caller buffer.
    ///
    /// With nothing to apply the result is a byte copy of the input and no
    /// GPU work is issued.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        ctx: &PassContext<G>,
        pool: &mut TexturePool<G>,
        pixels: &PixelBuffer,
        adjustments: Option<&Adjustments>,
        tone_curve: Option<&ToneCurveLut>,
        half_precision: bool,
    ) -> GpuResult<PixelBuffer> {
        let active = adjustments.is_some_and(|a| !a.is_identity()) || tone_curve.is_some_and(|l| !l.is_identity());
        if !active {
            return Ok(pixels.clone());
        }

        let device = ctx.device().clone();
        let source = ctx.upload(pool, pixels)?;
        let target = match pool.acquire(pixels.width(), pixels.height(), UsageClass::RenderTarget, "uber") {
            Ok(t) => t,
            Err(e) => {
                pool.release(source);
                return Err(e);
            }
        };

        let result = (|| -> GpuResult<Vec<u8>> {
            let mut frame = Frame::new(&*device, "uber", None);
            self.encode(ctx, &mut frame, &source, &target, adjustments, tone_curve, half_precision)?;
            frame.submit(&*device)?;
            device.read_texture(&target)
        })();
        pool.release(source);
        pool.release(target);

        Ok(PixelBuffer::from_rgba(result?, pixels.width(), pixels.height(), pixels.format())?)
    }
}
