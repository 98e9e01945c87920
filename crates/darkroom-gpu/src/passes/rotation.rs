//! Rotation about the image center.
//!
//! Positive angles rotate clockwise. The output is the rotated bounding
//! box; pixels that map outside the source are transparent black.

use super::{Frame, PassContext, TILE};
use crate::backend::{workgroups_2d, DispatchTarget, GpuPrimitives, GpuTexture, KernelId};
use crate::uniforms::RotationUniform;
use crate::GpuResult;

/// Snap values within float noise of an integer, so right angles are exact.
fn snap(v: f64) -> f64 {
    if (v - v.round()).abs() < 1e-9 { v.round() } else { v }
}

fn cos_sin(degrees: f32) -> (f64, f64) {
    let radians = (degrees as f64).to_radians();
    (snap(radians.cos()), snap(radians.sin()))
}

/// Size of the bounding box of a `width x height` image rotated by
/// `degrees`, at least 1x1.
pub fn rotated_size(width: u32, height: u32, degrees: f32) -> (u32, u32) {
    let (c, s) = cos_sin(degrees);
    let (c, s) = (c.abs(), s.abs());
    let (w, h) = (width as f64, height as f64);
    let nw = (w * c + h * s).round().max(1.0);
    let nh = (w * s + h * c).round().max(1.0);
    (nw as u32, nh as u32)
}

/// Rotation pass.
pub struct RotationPass<G: GpuPrimitives> {
    kernel: Option<G::Kernel>,
}

impl<G: GpuPrimitives> Default for RotationPass<G> {
    fn default() -> Self {
        Self { kernel: None }
    }
}

impl<G: GpuPrimitives> RotationPass<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the rotation of `input` into `output`, which must be
    /// [`rotated_size`] of the input.
    pub fn encode(
        &mut self,
        ctx: &PassContext<G>,
        frame: &mut Frame<'_, G>,
        input: &G::Texture,
        output: &G::Texture,
        degrees: f32,
    ) -> GpuResult<()> {
        let kernel = ctx.kernel(&mut self.kernel, KernelId::Rotation)?;
        let (c, s) = cos_sin(degrees);
        let uniform = RotationUniform {
            src_size: [input.width(), input.height()],
            dst_size: [output.width(), output.height()],
            cos_sin: [c as f32, s as f32],
            _pad: [0.0; 2],
        };
        ctx.dispatch(
            frame,
            kernel,
            "rotation",
            input,
            DispatchTarget::Texture(output),
            bytemuck::bytes_of(&uniform),
            None,
            workgroups_2d(output.width(), output.height(), TILE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_right_angles_swap_dimensions() {
        assert_eq!(rotated_size(640, 480, 90.0), (480, 640));
        assert_eq!(rotated_size(640, 480, -90.0), (480, 640));
        assert_eq!(rotated_size(640, 480, 180.0), (640, 480));
    }

    #[test]
    fn test_diagonal_grows_box() {
        let (w, h) = rotated_size(100, 100, 45.0);
        assert_eq!((w, h), (141, 141));
    }

    #[test]
    fn test_minimum_size() {
        assert_eq!(rotated_size(1, 1, 30.0), (1, 1));
    }
}
