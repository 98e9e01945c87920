//! Local mask compositing.
//!
//! Masks apply in order. Each blends its own adjustment result into the
//! running color by its per-pixel weight; where the weight is zero the
//! pixel is left alone. All masks go to the kernel in one storage array.

use darkroom_core::Mask;

use super::{Frame, PassContext, TILE};
use crate::backend::{workgroups_2d, DispatchTarget, GpuPrimitives, GpuTexture, KernelId};
use crate::uniforms::{MaskRecord, MaskUniform};
use crate::GpuResult;

pub struct MasksPass<G: GpuPrimitives> {
    kernel: Option<G::Kernel>,
}

impl<G: GpuPrimitives> Default for MasksPass<G> {
    fn default() -> Self {
        Self { kernel: None }
    }
}

impl<G: GpuPrimitives> MasksPass<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record compositing of `masks`. Records nothing for an empty list.
    pub fn encode<'m>(
        &mut self,
        ctx: &PassContext<G>,
        frame: &mut Frame<'_, G>,
        input: &G::Texture,
        output: &G::Texture,
        masks: impl IntoIterator<Item = &'m Mask>,
    ) -> GpuResult<bool> {
        let records: Vec<MaskRecord> = masks.into_iter().map(MaskRecord::from).collect();
        if records.is_empty() {
            return Ok(false);
        }
        let kernel = ctx.kernel(&mut self.kernel, KernelId::Masks)?;
        let uniform = MaskUniform {
            size: [input.width(), input.height()],
            count: records.len() as u32,
            _pad: 0,
        };
        ctx.dispatch(
            frame,
            kernel,
            "masks",
            input,
            DispatchTarget::Texture(output),
            bytemuck::bytes_of(&uniform),
            Some(bytemuck::cast_slice(&records)),
            workgroups_2d(input.width(), input.height(), TILE),
        )?;
        Ok(true)
    }
}
