//! Device abstraction shared by the wgpu backend and the in-memory backend.

use super::KernelId;
use crate::capabilities::Capabilities;
use crate::GpuResult;

/// Texture usage bucket. Pools never hand a texture to a different bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageClass {
    /// Upload target, sampled by the first pass.
    Source,
    /// Storage-write target of a compute pass, also sampled and copied.
    RenderTarget,
}

/// Texture creation parameters. All textures are RGBA8.
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub usage: UsageClass,
}

/// What a buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Atomic counters written by a kernel, copied out for readback.
    Counters,
    /// CPU-mappable readback buffer.
    Staging,
    /// Destination of timestamp query resolution.
    QueryResolve,
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub kind: BufferKind,
}

/// Texture handle as seen by passes and pools.
pub trait GpuTexture: Send + Sync + 'static {
    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;

    /// Usage bucket.
    fn usage(&self) -> UsageClass;

    /// Size in bytes of GPU memory used.
    fn size_bytes(&self) -> u64 {
        self.width() as u64 * self.height() as u64 * 4
    }
}

/// Buffer handle as seen by passes and pools.
pub trait GpuBuffer: Send + Sync + 'static {
    /// Size in bytes.
    fn size(&self) -> u64;

    /// Usage.
    fn kind(&self) -> BufferKind;
}

/// Where a dispatch writes (binding 1).
pub enum DispatchTarget<'a, G: GpuPrimitives + ?Sized> {
    Texture(&'a G::Texture),
    Counters(&'a G::Buffer),
}

/// Timestamp query slots written at the start and end of a compute pass.
pub struct TimestampWrites<'a, G: GpuPrimitives + ?Sized> {
    pub query_set: &'a G::QuerySet,
    pub begin: u32,
    pub end: u32,
}

/// One compute dispatch.
///
/// Binding layout shared by every kernel:
/// 0 = input texture, 1 = output texture or counter buffer,
/// 2 = uniform block, 3 = optional read-only storage (LUT, mask records).
pub struct DispatchArgs<'a, G: GpuPrimitives + ?Sized> {
    pub input: &'a G::Texture,
    pub target: DispatchTarget<'a, G>,
    pub uniforms: &'a [u8],
    pub storage: Option<&'a [u8]>,
    pub workgroups: [u32; 3],
    pub timestamps: Option<TimestampWrites<'a, G>>,
}

/// Blocking behavior of [`GpuPrimitives::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Process whatever has finished, never block.
    Poll,
    /// Block until all submitted work has finished.
    Wait,
}

/// Invoked once a map request resolves. The error string is the
/// backend's description of a failed map.
pub type MapCallback = Box<dyn FnOnce(Result<(), String>) + Send + 'static>;

/// Core device operations used by the pipeline.
///
/// Commands recorded into one encoder execute in recording order; encoders
/// execute in submission order on the single queue.
pub trait GpuPrimitives: Send + Sync + 'static {
    /// Backend-specific texture type.
    type Texture: GpuTexture;
    /// Backend-specific buffer type.
    type Buffer: GpuBuffer;
    /// Compiled compute pipeline.
    type Kernel: Send + Sync + 'static;
    /// Command recorder.
    type Encoder;
    /// Timestamp query set.
    type QuerySet: Send + Sync + 'static;

    // =========================================================================
    // Info
    // =========================================================================

    /// Device capabilities.
    fn capabilities(&self) -> &Capabilities;

    /// Backend name.
    fn name(&self) -> &'static str;

    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    // =========================================================================
    // Resources
    // =========================================================================

    /// Allocate an RGBA8 texture.
    fn create_texture(&self, desc: &TextureDesc<'_>) -> GpuResult<Self::Texture>;

    /// Upload tightly packed RGBA8 rows covering the whole texture.
    fn write_texture(&self, texture: &Self::Texture, rgba: &[u8]) -> GpuResult<()>;

    /// Free a texture's memory now. Later use of the handle is invalid.
    fn destroy_texture(&self, texture: &Self::Texture);

    /// Allocate a buffer.
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> GpuResult<Self::Buffer>;

    /// Free a buffer's memory now. Pending maps on it fail.
    fn destroy_buffer(&self, buffer: &Self::Buffer);

    /// Compile a kernel.
    fn create_kernel(&self, id: KernelId) -> GpuResult<Self::Kernel>;

    /// Create a timestamp query set with `count` slots.
    fn create_query_set(&self, count: u32) -> GpuResult<Self::QuerySet>;

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Start recording commands.
    fn begin_encoder(&self, label: &str) -> Self::Encoder;

    /// Record one compute dispatch.
    fn encode_dispatch(
        &self,
        encoder: &mut Self::Encoder,
        kernel: &Self::Kernel,
        args: &DispatchArgs<'_, Self>,
    ) -> GpuResult<()>;

    /// Record a buffer-to-buffer copy of `len` bytes.
    fn encode_copy_buffer(&self, encoder: &mut Self::Encoder, src: &Self::Buffer, dst: &Self::Buffer, len: u64);

    /// Record zeroing a whole buffer.
    fn encode_clear_buffer(&self, encoder: &mut Self::Encoder, buffer: &Self::Buffer);

    /// Record resolving `count` timestamp queries into `dst`.
    fn encode_resolve_queries(
        &self,
        encoder: &mut Self::Encoder,
        query_set: &Self::QuerySet,
        count: u32,
        dst: &Self::Buffer,
    );

    /// Submit recorded commands to the queue.
    fn submit(&self, encoder: Self::Encoder) -> GpuResult<()>;

    // =========================================================================
    // Readback
    // =========================================================================

    /// Copy a texture to CPU memory as tightly packed RGBA8, blocking until done.
    fn read_texture(&self, texture: &Self::Texture) -> GpuResult<Vec<u8>>;

    /// Copy a buffer to CPU memory, blocking until done.
    fn read_buffer(&self, buffer: &Self::Buffer) -> GpuResult<Vec<u8>>;

    /// Request a staging buffer be mapped for reading. `callback` fires
    /// from a later [`poll`](Self::poll).
    fn map_read(&self, buffer: &Self::Buffer, callback: MapCallback);

    /// Copy the first `len` bytes out of a mapped staging buffer.
    fn mapped_bytes(&self, buffer: &Self::Buffer, len: u64) -> GpuResult<Vec<u8>>;

    /// Unmap a staging buffer.
    fn unmap(&self, buffer: &Self::Buffer);

    /// Drive map callbacks. Fails with `DeviceLost` once the device is gone.
    fn poll(&self, mode: PollMode) -> GpuResult<()>;
}

/// Workgroup count covering `width x height` with `size x size` groups.
#[inline]
pub fn workgroups_2d(width: u32, height: u32, size: u32) -> [u32; 3] {
    [width.div_ceil(size), height.div_ceil(size), 1]
}

/// Workgroup grid covering `items` with 1-D groups of `size`, folded into
/// two dimensions to stay under the per-dimension dispatch limit.
#[inline]
pub fn workgroups_1d(items: u64, size: u32, max_per_dim: u32) -> [u32; 3] {
    let groups = items.div_ceil(size as u64).max(1);
    let x = groups.min(max_per_dim as u64) as u32;
    let y = groups.div_ceil(x as u64) as u32;
    [x, y, 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroups_2d() {
        assert_eq!(workgroups_2d(17, 16, 16), [2, 1, 1]);
        assert_eq!(workgroups_2d(1, 1, 16), [1, 1, 1]);
    }

    #[test]
    fn test_workgroups_1d_folds() {
        assert_eq!(workgroups_1d(4096, 256, 65535), [16, 1, 1]);
        let [x, y, _] = workgroups_1d(4096 * 4096, 256, 65535);
        assert!(x <= 65535);
        assert!(x as u64 * y as u64 * 256 >= 4096 * 4096);
    }
}
