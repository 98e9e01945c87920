//! In-memory backend.
//!
//! Textures and buffers are plain byte vectors and kernels are the rayon
//! mirrors in `cpu_kernels`. Commands run as they are recorded, so an
//! encoder is only a label; `submit` is where device loss surfaces, like
//! on a real queue.
//!
//! Besides serving as the CPU fallback, this backend is the test double for
//! every pool and pipeline behavior: map failures, device loss and kernel
//! compile failures can be injected.

use std::collections::HashSet;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use bytemuck::Pod;
use tracing::{debug, trace, warn};

use super::cpu_kernels;
use super::primitives::{
    BufferDesc, BufferKind, DispatchArgs, DispatchTarget, GpuBuffer, GpuPrimitives, GpuTexture, MapCallback,
    PollMode, TextureDesc, UsageClass,
};
use super::{HistogramStrategy, KernelId};
use crate::capabilities::{Capabilities, DeviceLimits, FeatureSet};
use crate::config::DeviceConfig;
use crate::uniforms::{AdjustUniform, DownsampleUniform, MaskRecord, MaskUniform, RotationUniform, SizeUniform};
use crate::{GpuError, GpuResult};

fn poisoned<T>(_: PoisonError<T>) -> GpuError {
    GpuError::OperationFailed("cpu backend lock poisoned".into())
}

fn uniform<T: Pod>(bytes: &[u8]) -> GpuResult<T> {
    let len = size_of::<T>();
    if bytes.len() < len {
        return Err(GpuError::OperationFailed(format!(
            "uniform block too small: {} < {len} bytes",
            bytes.len()
        )));
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..len]))
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned::<u32>).collect()
}

// =============================================================================
// Resources
// =============================================================================

/// RGBA8 texture in host memory.
pub struct CpuTexture {
    width: u32,
    height: u32,
    usage: UsageClass,
    data: RwLock<Vec<u8>>,
    destroyed: AtomicBool,
}

impl CpuTexture {
    fn check_alive(&self) -> GpuResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(GpuError::OperationFailed("texture used after destroy".into()));
        }
        Ok(())
    }
}

impl GpuTexture for CpuTexture {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn usage(&self) -> UsageClass {
        self.usage
    }
}

struct BufferState {
    data: RwLock<Vec<u8>>,
    map_pending: AtomicBool,
    mapped: AtomicBool,
    destroyed: AtomicBool,
}

/// Buffer in host memory.
pub struct CpuBuffer {
    size: u64,
    kind: BufferKind,
    state: Arc<BufferState>,
}

impl GpuBuffer for CpuBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn kind(&self) -> BufferKind {
        self.kind
    }
}

/// Compiled kernel: just its identity.
pub struct CpuKernel {
    id: KernelId,
}

/// Command recorder. Commands execute immediately.
pub struct CpuEncoder {
    label: String,
    commands: usize,
}

/// Timestamp slots in nanoseconds since device creation.
pub struct CpuQuerySet {
    values: Mutex<Vec<u64>>,
}

struct PendingMap {
    state: Arc<BufferState>,
    outcome: Result<(), String>,
    callback: MapCallback,
}

// =============================================================================
// Device
// =============================================================================

/// In-memory device.
pub struct CpuPrimitives {
    caps: Capabilities,
    epoch: Instant,
    lost: AtomicBool,
    failing_maps: AtomicUsize,
    failing_kernels: Mutex<HashSet<KernelId>>,
    pending_maps: Mutex<Vec<PendingMap>>,
}

impl Default for CpuPrimitives {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuPrimitives {
    /// Device with every optional feature enabled.
    pub fn new() -> Self {
        let caps = Capabilities {
            available: true,
            backend: "cpu".into(),
            adapter_name: format!("CPU ({} threads)", rayon::current_num_threads()),
            features: FeatureSet {
                half_precision: true,
                subgroups: true,
                timestamp_query: true,
            },
            limits: DeviceLimits::default(),
            unavailable_reason: None,
        };
        Self {
            caps,
            epoch: Instant::now(),
            lost: AtomicBool::new(false),
            failing_maps: AtomicUsize::new(0),
            failing_kernels: Mutex::new(HashSet::new()),
            pending_maps: Mutex::new(Vec::new()),
        }
    }

    /// Device advertising only the optional features `config` requests,
    /// the same negotiation the wgpu backend does with its adapter.
    pub fn open(config: &DeviceConfig) -> Self {
        Self::new().with_features(FeatureSet {
            half_precision: config.half_precision,
            subgroups: config.subgroups,
            timestamp_query: config.timestamps,
        })
    }

    /// Override the advertised features.
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.caps.features = features;
        self
    }

    /// Override the advertised limits.
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.caps.limits = limits;
        self
    }

    /// Make the next `count` map requests fail.
    pub fn fail_next_maps(&self, count: usize) {
        self.failing_maps.fetch_add(count, Ordering::SeqCst);
    }

    /// Make compilation of `id` fail from now on.
    pub fn fail_kernel(&self, id: KernelId) {
        if let Ok(mut set) = self.failing_kernels.lock() {
            set.insert(id);
        }
    }

    /// Simulate device loss. Pending maps fail; later work returns
    /// [`GpuError::DeviceLost`].
    pub fn lose_device(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("cpu device marked lost");
        let pending = self
            .pending_maps
            .lock()
            .map(|mut q| std::mem::take(&mut *q))
            .unwrap_or_default();
        for map in pending {
            map.state.map_pending.store(false, Ordering::Release);
            (map.callback)(Err("device lost".into()));
        }
    }

    /// Whether [`lose_device`](Self::lose_device) was called.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn check_device(&self) -> GpuResult<()> {
        if self.is_lost() {
            return Err(GpuError::DeviceLost("cpu device lost".into()));
        }
        Ok(())
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn write_timestamp(set: &CpuQuerySet, index: u32, value: u64) -> GpuResult<()> {
        let mut values = set.values.lock().map_err(poisoned)?;
        match values.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(GpuError::OperationFailed(format!("timestamp index {index} out of range"))),
        }
    }

    fn run_kernel(&self, id: KernelId, args: &DispatchArgs<'_, Self>) -> GpuResult<()> {
        let input = args.input;
        input.check_alive()?;

        if let DispatchTarget::Counters(counters) = args.target {
            let KernelId::Histogram(strategy) = id else {
                return Err(GpuError::OperationFailed(format!("{id} does not write counters")));
            };
            let u: SizeUniform = uniform(args.uniforms)?;
            let src = input.data.read().map_err(poisoned)?;
            let counts = match strategy {
                HistogramStrategy::Standard => cpu_kernels::histogram_standard(&src, u.size[0], u.size[1]),
                HistogramStrategy::Subgroup => cpu_kernels::histogram_subgroup(&src, u.size[0], u.size[1]),
            };
            let mut data = counters.state.data.write().map_err(poisoned)?;
            for (chunk, add) in data.chunks_exact_mut(4).zip(counts) {
                let current = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                chunk.copy_from_slice(&current.wrapping_add(add).to_le_bytes());
            }
            return Ok(());
        }

        let DispatchTarget::Texture(output) = args.target else {
            return Err(GpuError::OperationFailed("missing dispatch target".into()));
        };
        output.check_alive()?;
        if std::ptr::eq(input, output) {
            return Err(GpuError::OperationFailed(format!("{id}: input and output alias")));
        }
        let src = input.data.read().map_err(poisoned)?;
        let mut dst = output.data.write().map_err(poisoned)?;
        let same_size = || -> GpuResult<()> {
            if (input.width, input.height) != (output.width, output.height) {
                return Err(GpuError::OperationFailed(format!(
                    "{id}: size mismatch {}x{} -> {}x{}",
                    input.width, input.height, output.width, output.height
                )));
            }
            Ok(())
        };

        match id {
            KernelId::Downsample => {
                let u: DownsampleUniform = uniform(args.uniforms)?;
                let out = cpu_kernels::downsample_block(
                    &src,
                    4,
                    u.src_size[0],
                    u.src_size[1],
                    u.dst_size[0],
                    u.dst_size[1],
                );
                dst[..out.len()].copy_from_slice(&out);
            }
            KernelId::Rotation => {
                let u: RotationUniform = uniform(args.uniforms)?;
                let out = cpu_kernels::rotate(&src, &u);
                dst[..out.len()].copy_from_slice(&out);
            }
            KernelId::Adjustments => {
                same_size()?;
                let u: AdjustUniform = uniform(args.uniforms)?;
                cpu_kernels::adjust(&src, &mut dst, &u.adjust);
            }
            KernelId::ToneCurve => {
                same_size()?;
                let lut = words(args.storage.unwrap_or_default());
                if lut.len() < 256 {
                    return Err(GpuError::OperationFailed("tone curve table missing".into()));
                }
                cpu_kernels::tone_curve(&src, &mut dst, &lut);
            }
            KernelId::Masks => {
                same_size()?;
                let u: MaskUniform = uniform(args.uniforms)?;
                let records: Vec<MaskRecord> = args
                    .storage
                    .unwrap_or_default()
                    .chunks_exact(size_of::<MaskRecord>())
                    .take(u.count as usize)
                    .map(bytemuck::pod_read_unaligned)
                    .collect();
                cpu_kernels::masks(&src, &mut dst, u.size[0], u.size[1], &records);
            }
            KernelId::Uber(variant) => {
                same_size()?;
                let u: AdjustUniform = uniform(args.uniforms)?;
                let lut = args.storage.map(words);
                if variant.has_tone_curve() && lut.as_ref().is_none_or(|l| l.len() < 256) {
                    return Err(GpuError::OperationFailed("tone curve table missing".into()));
                }
                cpu_kernels::uber(&src, &mut dst, variant, &u.adjust, lut.as_deref());
            }
            KernelId::Histogram(_) => {
                return Err(GpuError::OperationFailed("histogram needs a counter target".into()));
            }
        }
        Ok(())
    }
}

impl GpuPrimitives for CpuPrimitives {
    type Texture = CpuTexture;
    type Buffer = CpuBuffer;
    type Kernel = CpuKernel;
    type Encoder = CpuEncoder;
    type QuerySet = CpuQuerySet;

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> GpuResult<CpuTexture> {
        self.check_device()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::AllocationFailed {
                what: desc.label.to_string(),
                reason: format!("empty texture {}x{}", desc.width, desc.height),
            });
        }
        self.caps.check_texture_size(desc.width, desc.height)?;
        trace!(label = desc.label, width = desc.width, height = desc.height, "create texture");
        Ok(CpuTexture {
            width: desc.width,
            height: desc.height,
            usage: desc.usage,
            data: RwLock::new(vec![0; desc.width as usize * desc.height as usize * 4]),
            destroyed: AtomicBool::new(false),
        })
    }

    fn write_texture(&self, texture: &CpuTexture, rgba: &[u8]) -> GpuResult<()> {
        self.check_device()?;
        texture.check_alive()?;
        let mut data = texture.data.write().map_err(poisoned)?;
        if rgba.len() != data.len() {
            return Err(GpuError::TransferFailed(format!(
                "upload of {} bytes into {}x{} texture",
                rgba.len(),
                texture.width,
                texture.height
            )));
        }
        data.copy_from_slice(rgba);
        Ok(())
    }

    fn destroy_texture(&self, texture: &CpuTexture) {
        texture.destroyed.store(true, Ordering::Release);
        if let Ok(mut data) = texture.data.write() {
            *data = Vec::new();
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> GpuResult<CpuBuffer> {
        self.check_device()?;
        if desc.size == 0 || desc.size > self.caps.limits.max_buffer_size {
            return Err(GpuError::AllocationFailed {
                what: desc.label.to_string(),
                reason: format!("invalid buffer size {}", desc.size),
            });
        }
        Ok(CpuBuffer {
            size: desc.size,
            kind: desc.kind,
            state: Arc::new(BufferState {
                data: RwLock::new(vec![0; desc.size as usize]),
                map_pending: AtomicBool::new(false),
                mapped: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    fn destroy_buffer(&self, buffer: &CpuBuffer) {
        buffer.state.destroyed.store(true, Ordering::Release);
        buffer.state.mapped.store(false, Ordering::Release);
    }

    fn create_kernel(&self, id: KernelId) -> GpuResult<CpuKernel> {
        self.check_device()?;
        let injected = self.failing_kernels.lock().map_err(poisoned)?.contains(&id);
        let features = self.caps.features;
        let reason = if injected {
            Some("injected compile failure")
        } else if matches!(id, KernelId::Uber(v) if v.is_half_precision()) && !features.half_precision {
            Some("shader-f16 not enabled on device")
        } else if id == KernelId::Histogram(HistogramStrategy::Subgroup) && !features.subgroups {
            Some("subgroups not enabled on device")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(GpuError::ShaderCompilation {
                kernel: id.label().to_string(),
                reason: reason.into(),
            });
        }
        debug!(kernel = %id, "compiled cpu kernel");
        Ok(CpuKernel { id })
    }

    fn create_query_set(&self, count: u32) -> GpuResult<CpuQuerySet> {
        self.check_device()?;
        Ok(CpuQuerySet {
            values: Mutex::new(vec![0; count as usize]),
        })
    }

    fn begin_encoder(&self, label: &str) -> CpuEncoder {
        CpuEncoder {
            label: label.to_string(),
            commands: 0,
        }
    }

    fn encode_dispatch(
        &self,
        encoder: &mut CpuEncoder,
        kernel: &CpuKernel,
        args: &DispatchArgs<'_, Self>,
    ) -> GpuResult<()> {
        self.check_device()?;
        if args.workgroups.contains(&0) {
            return Err(GpuError::OperationFailed(format!("{}: empty dispatch", kernel.id)));
        }
        if let Some(ts) = &args.timestamps {
            Self::write_timestamp(ts.query_set, ts.begin, self.now_ns())?;
        }
        self.run_kernel(kernel.id, args)?;
        if let Some(ts) = &args.timestamps {
            Self::write_timestamp(ts.query_set, ts.end, self.now_ns())?;
        }
        encoder.commands += 1;
        Ok(())
    }

    fn encode_copy_buffer(&self, encoder: &mut CpuEncoder, src: &CpuBuffer, dst: &CpuBuffer, len: u64) {
        let len = len.min(src.size).min(dst.size) as usize;
        let copied = src.state.data.read().ok().map(|data| data[..len].to_vec());
        if let (Some(bytes), Ok(mut out)) = (copied, dst.state.data.write()) {
            out[..len].copy_from_slice(&bytes);
        }
        encoder.commands += 1;
    }

    fn encode_clear_buffer(&self, encoder: &mut CpuEncoder, buffer: &CpuBuffer) {
        if let Ok(mut data) = buffer.state.data.write() {
            data.fill(0);
        }
        encoder.commands += 1;
    }

    fn encode_resolve_queries(&self, encoder: &mut CpuEncoder, query_set: &CpuQuerySet, count: u32, dst: &CpuBuffer) {
        let values = query_set.values.lock().map(|v| v.clone()).unwrap_or_default();
        if let Ok(mut out) = dst.state.data.write() {
            for (chunk, value) in out.chunks_exact_mut(8).zip(values.iter().take(count as usize)) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
        }
        encoder.commands += 1;
    }

    fn submit(&self, encoder: CpuEncoder) -> GpuResult<()> {
        self.check_device()?;
        trace!(label = %encoder.label, commands = encoder.commands, "submit");
        Ok(())
    }

    fn read_texture(&self, texture: &CpuTexture) -> GpuResult<Vec<u8>> {
        self.check_device()?;
        texture.check_alive()?;
        Ok(texture.data.read().map_err(poisoned)?.clone())
    }

    fn read_buffer(&self, buffer: &CpuBuffer) -> GpuResult<Vec<u8>> {
        self.check_device()?;
        if buffer.state.destroyed.load(Ordering::Acquire) {
            return Err(GpuError::TransferFailed("buffer destroyed".into()));
        }
        Ok(buffer.state.data.read().map_err(poisoned)?.clone())
    }

    fn map_read(&self, buffer: &CpuBuffer, callback: MapCallback) {
        let state = &buffer.state;
        let outcome = if self.is_lost() {
            Err("device lost".to_string())
        } else if state.destroyed.load(Ordering::Acquire) {
            Err("buffer destroyed".to_string())
        } else if state.mapped.load(Ordering::Acquire) || state.map_pending.swap(true, Ordering::AcqRel) {
            Err("buffer already mapped".to_string())
        } else if self
            .failing_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err("injected map failure".to_string())
        } else {
            Ok(())
        };

        let pending = PendingMap {
            state: state.clone(),
            outcome,
            callback,
        };
        match self.pending_maps.lock() {
            Ok(mut queue) => queue.push(pending),
            Err(_) => (pending.callback)(Err("cpu backend lock poisoned".into())),
        }
    }

    fn mapped_bytes(&self, buffer: &CpuBuffer, len: u64) -> GpuResult<Vec<u8>> {
        if !buffer.state.mapped.load(Ordering::Acquire) {
            return Err(GpuError::TransferFailed("buffer is not mapped".into()));
        }
        let data = buffer.state.data.read().map_err(poisoned)?;
        let len = (len as usize).min(data.len());
        Ok(data[..len].to_vec())
    }

    fn unmap(&self, buffer: &CpuBuffer) {
        buffer.state.mapped.store(false, Ordering::Release);
    }

    fn poll(&self, _mode: PollMode) -> GpuResult<()> {
        self.check_device()?;
        let ready = std::mem::take(&mut *self.pending_maps.lock().map_err(poisoned)?);
        for map in ready {
            map.state.map_pending.store(false, Ordering::Release);
            let ok = map.outcome.is_ok() && !map.state.destroyed.load(Ordering::Acquire);
            map.state.mapped.store(ok, Ordering::Release);
            let outcome = if ok {
                Ok(())
            } else {
                Err(map.outcome.err().unwrap_or_else(|| "buffer destroyed".into()))
            };
            (map.callback)(outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn staging(device: &CpuPrimitives) -> CpuBuffer {
        device
            .create_buffer(&BufferDesc {
                label: "staging",
                size: 16,
                kind: BufferKind::Staging,
            })
            .unwrap()
    }

    fn map(device: &CpuPrimitives, buffer: &CpuBuffer) -> mpsc::Receiver<Result<(), String>> {
        let (tx, rx) = mpsc::channel();
        device.map_read(
            buffer,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        rx
    }

    #[test]
    fn test_map_resolves_on_poll() {
        let device = CpuPrimitives::new();
        let buffer = staging(&device);
        let rx = map(&device, &buffer);
        assert!(rx.try_recv().is_err());
        device.poll(PollMode::Poll).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(device.mapped_bytes(&buffer, 4).unwrap(), vec![0; 4]);
        device.unmap(&buffer);
        assert!(device.mapped_bytes(&buffer, 4).is_err());
    }

    #[test]
    fn test_injected_map_failure() {
        let device = CpuPrimitives::new();
        device.fail_next_maps(1);
        let buffer = staging(&device);
        let rx = map(&device, &buffer);
        device.poll(PollMode::Wait).unwrap();
        assert!(rx.try_recv().unwrap().is_err());

        let rx = map(&device, &buffer);
        device.poll(PollMode::Wait).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_lost_device() {
        let device = CpuPrimitives::new();
        let buffer = staging(&device);
        let rx = map(&device, &buffer);
        device.lose_device();
        assert!(rx.try_recv().unwrap().is_err());
        assert!(matches!(device.poll(PollMode::Poll), Err(GpuError::DeviceLost(_))));
        assert!(device.submit(device.begin_encoder("x")).is_err());
    }

    #[test]
    fn test_half_kernel_requires_feature() {
        let device = CpuPrimitives::new().with_features(FeatureSet::default());
        let id = KernelId::Uber(crate::backend::PipelineVariant::CombinedF16);
        assert!(matches!(device.create_kernel(id), Err(GpuError::ShaderCompilation { .. })));
        assert!(device.create_kernel(KernelId::Downsample).is_ok());
    }

    #[test]
    fn test_write_texture_size_checked() {
        let device = CpuPrimitives::new();
        let texture = device
            .create_texture(&TextureDesc {
                label: "t",
                width: 2,
                height: 2,
                usage: UsageClass::Source,
            })
            .unwrap();
        assert!(device.write_texture(&texture, &[0; 16]).is_ok());
        assert!(device.write_texture(&texture, &[0; 12]).is_err());
    }
}
