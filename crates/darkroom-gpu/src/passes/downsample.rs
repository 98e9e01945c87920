//! Box-filter downsample.
//!
//! Output pixel `(ox, oy)` averages source columns
//! `[floor(ox*w/nw), floor((ox+1)*w/nw))` and the matching rows, rounding
//! the mean to nearest per channel. The CPU and GPU paths share that
//! definition exactly, so either can stand in for the other.

use std::borrow::Cow;

use darkroom_core::PixelBuffer;
use tracing::debug;

use super::{Frame, PassContext, TILE};
use crate::backend::{downsample_block, workgroups_2d, DispatchTarget, GpuPrimitives, GpuTexture, KernelId, UsageClass};
use crate::pool::TexturePool;
use crate::uniforms::DownsampleUniform;
use crate::GpuResult;

/// Target size for `scale`, or `None` when the image would not shrink
/// (`scale >= 1`) or could not (either side below one pixel).
pub fn downsample_size(width: u32, height: u32, scale: f32) -> Option<(u32, u32)> {
    if scale.is_nan() || scale >= 1.0 {
        return None;
    }
    let nw = (width as f64 * scale as f64).floor();
    let nh = (height as f64 * scale as f64).floor();
    if !(nw >= 1.0 && nh >= 1.0) {
        return None;
    }
    Some((nw as u32, nh as u32))
}

/// Downsample on the CPU. Returns the input itself when nothing shrinks.
///
/// ```
/// use darkroom_core::{PixelBuffer, PixelFormat};
/// use darkroom_gpu::downsample_cpu;
///
/// let image = PixelBuffer::filled(8, 8, PixelFormat::Rgba, [10, 20, 30, 255]).unwrap();
/// let half = downsample_cpu(&image, 0.5);
/// assert_eq!((half.width(), half.height()), (4, 4));
/// assert!(std::ptr::eq(&*downsample_cpu(&image, 1.0), &image));
/// ```
pub fn downsample_cpu(pixels: &PixelBuffer, scale: f32) -> Cow<'_, PixelBuffer> {
    let Some((nw, nh)) = downsample_size(pixels.width(), pixels.height(), scale) else {
        return Cow::Borrowed(pixels);
    };
    let channels = pixels.format().channels();
    let data = downsample_block(pixels.as_bytes(), channels, pixels.width(), pixels.height(), nw, nh);
    match PixelBuffer::new(data, nw, nh, pixels.format()) {
        Ok(out) => Cow::Owned(out),
        // Length is nw*nh*channels by construction.
        Err(_) => Cow::Borrowed(pixels),
    }
}

/// GPU downsample pass.
pub struct DownsamplePass<G: GpuPrimitives> {
    kernel: Option<G::Kernel>,
}

impl<G: GpuPrimitives> Default for DownsamplePass<G> {
    fn default() -> Self {
        Self { kernel: None }
    }
}

impl<G: GpuPrimitives> DownsamplePass<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the box filter from `input` into `output`; sizes come from
    /// the textures.
    pub fn encode(
        &mut self,
        ctx: &PassContext<G>,
        frame: &mut Frame<'_, G>,
        input: &G::Texture,
        output: &G::Texture,
    ) -> GpuResult<()> {
        let kernel = ctx.kernel(&mut self.kernel, KernelId::Downsample)?;
        let uniform = DownsampleUniform {
            src_size: [input.width(), input.height()],
            dst_size: [output.width(), output.height()],
        };
        ctx.dispatch(
            frame,
            kernel,
            "downsample",
            input,
            DispatchTarget::Texture(output),
            bytemuck::bytes_of(&uniform),
            None,
            workgroups_2d(output.width(), output.height(), TILE),
        )
    }

    /// Standalone GPU downsample of a caller buffer. Returns the input
    /// itself when nothing shrinks; otherwise the result keeps the input's
    /// pixel format.
    pub fn apply<'a>(
        &mut self,
        ctx: &PassContext<G>,
        pool: &mut TexturePool<G>,
        pixels: &'a PixelBuffer,
        scale: f32,
    ) -> GpuResult<Cow<'a, PixelBuffer>> {
        let Some((nw, nh)) = downsample_size(pixels.width(), pixels.height(), scale) else {
            return Ok(Cow::Borrowed(pixels));
        };
        debug!(width = pixels.width(), height = pixels.height(), nw, nh, "gpu downsample");

        let device = ctx.device().clone();
        let source = ctx.upload(pool, pixels)?;
        let target = match pool.acquire(nw, nh, UsageClass::RenderTarget, "downsample") {
            Ok(t) => t,
            Err(e) => {
                pool.release(source);
                return Err(e);
            }
        };

        let result = (|| -> GpuResult<Vec<u8>> {
            let mut frame = Frame::new(&*device, "downsample", None);
            self.encode(ctx, &mut frame, &source, &target)?;
            frame.submit(&*device)?;
            device.read_texture(&target)
        })();
        pool.release(source);
        pool.release(target);

        Ok(Cow::Owned(PixelBuffer::from_rgba(result?, nw, nh, pixels.format())?))
    }
}
