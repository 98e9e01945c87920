//! Standalone global adjustments pass.

use darkroom_core::Adjustments;

use super::{Frame, PassContext, TILE};
use crate::backend::{workgroups_2d, DispatchTarget, GpuPrimitives, GpuTexture, KernelId};
use crate::uniforms::AdjustUniform;
use crate::GpuResult;

/// Applies temperature, tint, exposure, contrast, highlights, shadows,
/// whites, blacks, vibrance and saturation, in that order.
pub struct AdjustmentsPass<G: GpuPrimitives> {
    kernel: Option<G::Kernel>,
}

impl<G: GpuPrimitives> Default for AdjustmentsPass<G> {
    fn default() -> Self {
        Self { kernel: None }
    }
}

impl<G: GpuPrimitives> AdjustmentsPass<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ten-step adjustment chain from `input` into `output`.
    pub fn encode(
        &mut self,
        ctx: &PassContext<G>,
        frame: &mut Frame<'_, G>,
        input: &G::Texture,
        output: &G::Texture,
        adjustments: &Adjustments,
    ) -> GpuResult<()> {
        let kernel = ctx.kernel(&mut self.kernel, KernelId::Adjustments)?;
        let uniform = AdjustUniform::new(input.width(), input.height(), Some(adjustments));
        ctx.dispatch(
            frame,
            kernel,
            "adjustments",
            input,
            DispatchTarget::Texture(output),
            bytemuck::bytes_of(&uniform),
            None,
            workgroups_2d(input.width(), input.height(), TILE),
        )
    }
}
