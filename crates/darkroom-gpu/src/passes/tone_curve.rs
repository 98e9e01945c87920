//! Standalone tone-curve pass: `out = lut[in]` per color channel, alpha
//! untouched.

use darkroom_core::ToneCurveLut;

use super::{Frame, PassContext, TILE};
use crate::backend::{workgroups_2d, DispatchTarget, GpuPrimitives, GpuTexture, KernelId};
use crate::uniforms::{lut_words, SizeUniform};
use crate::GpuResult;

pub struct ToneCurvePass<G: GpuPrimitives> {
    kernel: Option<G::Kernel>,
}

impl<G: GpuPrimitives> Default for ToneCurvePass<G> {
    fn default() -> Self {
        Self { kernel: None }
    }
}

impl<G: GpuPrimitives> ToneCurvePass<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a per-channel LUT lookup from `input` into `output`.
    pub fn encode(
        &mut self,
        ctx: &PassContext<G>,
        frame: &mut Frame<'_, G>,
        input: &G::Texture,
        output: &G::Texture,
        lut: &ToneCurveLut,
    ) -> GpuResult<()> {
        let kernel = ctx.kernel(&mut self.kernel, KernelId::ToneCurve)?;
        let uniform = SizeUniform::new(input.width(), input.height());
        let table = lut_words(lut.as_slice());
        ctx.dispatch(
            frame,
            kernel,
            "tone_curve",
            input,
            DispatchTarget::Texture(output),
            bytemuck::bytes_of(&uniform),
            Some(&table),
            workgroups_2d(input.width(), input.height(), TILE),
        )
    }
}
