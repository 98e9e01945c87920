//! wgpu backend implementation.
//!
//! Compute kernels over RGBA8 textures. Shader compilation and allocation
//! errors are caught with error scopes so a failed `f16` or subgroup variant
//! can fall back instead of aborting; device loss is recorded by the lost
//! callback and reported by every later call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};
use wgpu::util::DeviceExt;

use super::primitives::{
    BufferDesc, BufferKind, DispatchArgs, DispatchTarget, GpuBuffer, GpuPrimitives, GpuTexture, MapCallback,
    PollMode, TextureDesc, UsageClass,
};
use super::{AdapterSummary, HistogramStrategy, KernelId};
use crate::capabilities::{Capabilities, DeviceLimits, FeatureSet};
use crate::config::{DeviceConfig, PowerPreference};
use crate::shaders;
use crate::{GpuError, GpuResult};

// =============================================================================
// Handles
// =============================================================================

/// RGBA8 texture with its default view.
pub struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    usage: UsageClass,
}

impl GpuTexture for WgpuTexture {
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

/// GPU buffer plus its map state.
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    kind: BufferKind,
    mapped: Arc<AtomicBool>,
}

impl GpuBuffer for WgpuBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn kind(&self) -> BufferKind {
        self.kind
    }
}

/// Compiled compute pipeline.
pub struct WgpuKernel {
    pipeline: wgpu::ComputePipeline,
    id: KernelId,
}

// =============================================================================
// Device
// =============================================================================

/// wgpu device and queue.
pub struct WgpuPrimitives {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: Capabilities,
    timestamp_period: f32,
    lost: Arc<AtomicBool>,
    lost_reason: Arc<Mutex<Option<String>>>,
}

fn power_preference(power: PowerPreference) -> wgpu::PowerPreference {
    match power {
        PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
    }
}

impl WgpuPrimitives {
    /// Summary of the adapter [`open`](Self::open) would pick, if any.
    pub fn probe_adapter() -> Option<AdapterSummary> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await?;
            let info = adapter.get_info();
            Some(AdapterSummary {
                name: info.name,
                software: info.device_type == wgpu::DeviceType::Cpu,
                max_texture_size: adapter.limits().max_texture_dimension_2d,
            })
        })
    }

    /// Open a device, blocking.
    pub fn open(config: &DeviceConfig) -> GpuResult<Self> {
        pollster::block_on(Self::open_async(config))
    }

    /// Open a device.
    pub async fn open_async(config: &DeviceConfig) -> GpuResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power_preference(config.power),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GpuError::Unavailable("no compatible GPU adapter".into()))?;

        let available = adapter.features();
        let mut wanted = wgpu::Features::empty();
        if config.half_precision {
            wanted |= wgpu::Features::SHADER_F16;
        }
        if config.subgroups {
            wanted |= wgpu::Features::SUBGROUP;
        }
        if config.timestamps {
            wanted |= wgpu::Features::TIMESTAMP_QUERY;
        }
        let features = available & wanted;

        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("darkroom_device"),
                    required_features: features,
                    required_limits: adapter_limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GpuError::Unavailable(format!("device request failed: {e}")))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_reason = Arc::new(Mutex::new(None));
        {
            let lost = lost.clone();
            let lost_reason = lost_reason.clone();
            device.set_device_lost_callback(move |reason, message| {
                error!(?reason, %message, "GPU device lost");
                lost.store(true, Ordering::SeqCst);
                if let Ok(mut slot) = lost_reason.lock() {
                    *slot = Some(format!("{reason:?}: {message}"));
                }
            });
        }
        device.on_uncaptured_error(Box::new(|e| {
            warn!(error = %e, "uncaptured wgpu error");
        }));

        let info = adapter.get_info();
        let caps = Capabilities {
            available: true,
            backend: format!("{:?}", info.backend).to_lowercase(),
            adapter_name: info.name.clone(),
            features: FeatureSet {
                half_precision: features.contains(wgpu::Features::SHADER_F16),
                subgroups: features.contains(wgpu::Features::SUBGROUP),
                timestamp_query: features.contains(wgpu::Features::TIMESTAMP_QUERY),
            },
            limits: DeviceLimits {
                max_texture_size: adapter_limits.max_texture_dimension_2d,
                max_buffer_size: adapter_limits.max_buffer_size,
                max_workgroup_size: adapter_limits.max_compute_invocations_per_workgroup,
                max_workgroups_per_dimension: adapter_limits.max_compute_workgroups_per_dimension,
            },
            unavailable_reason: None,
        };
        info!(adapter = %caps.adapter_name, backend = %caps.backend, ?features, "wgpu device ready");

        let timestamp_period = queue.get_timestamp_period();
        Ok(Self {
            device,
            queue,
            caps,
            timestamp_period,
            lost,
            lost_reason,
        })
    }

    fn check_device(&self) -> GpuResult<()> {
        if self.lost.load(Ordering::SeqCst) {
            let reason = self
                .lost_reason
                .lock()
                .ok()
                .and_then(|r| r.clone())
                .unwrap_or_else(|| "device lost".into());
            return Err(GpuError::DeviceLost(reason));
        }
        Ok(())
    }

    fn texture_copy(texture: &wgpu::Texture) -> wgpu::TexelCopyTextureInfo<'_> {
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }

    /// Copy `len` bytes of `encoder` output into a fresh staging buffer,
    /// submit, and block until it is mapped.
    fn blocking_readback(&self, encoder: wgpu::CommandEncoder, staging: &wgpu::Buffer) -> GpuResult<Vec<u8>> {
        self.queue.submit(Some(encoder.finish()));
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        self.check_device()?;

        rx.recv()
            .map_err(|_| GpuError::TransferFailed("map channel closed".into()))?
            .map_err(|e| GpuError::TransferFailed(format!("map failed: {e}")))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn staging_buffer(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        })
    }
}

impl GpuPrimitives for WgpuPrimitives {
    type Texture = WgpuTexture;
    type Buffer = WgpuBuffer;
    type Kernel = WgpuKernel;
    type Encoder = wgpu::CommandEncoder;
    type QuerySet = wgpu::QuerySet;

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> GpuResult<WgpuTexture> {
        self.check_device()?;
        self.caps.check_texture_size(desc.width, desc.height)?;
        let usage = match desc.usage {
            UsageClass::Source => {
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC
            }
            UsageClass::RenderTarget => {
                wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage,
            view_formats: &[],
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::AllocationFailed {
                what: desc.label.to_string(),
                reason: e.to_string(),
            });
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(WgpuTexture {
            texture,
            view,
            width: desc.width,
            height: desc.height,
            usage: desc.usage,
        })
    }

    fn write_texture(&self, texture: &WgpuTexture, rgba: &[u8]) -> GpuResult<()> {
        self.check_device()?;
        let expected = texture.width as usize * texture.height as usize * 4;
        if rgba.len() != expected {
            return Err(GpuError::TransferFailed(format!(
                "upload of {} bytes, expected {expected}",
                rgba.len()
            )));
        }
        self.queue.write_texture(
            Self::texture_copy(&texture.texture),
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(texture.width * 4),
                rows_per_image: Some(texture.height),
            },
            wgpu::Extent3d {
                width: texture.width,
                height: texture.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&self, texture: &WgpuTexture) {
        texture.texture.destroy();
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> GpuResult<WgpuBuffer> {
        self.check_device()?;
        let usage = match desc.kind {
            BufferKind::Counters => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
            }
            BufferKind::Staging => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            BufferKind::QueryResolve => wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::AllocationFailed {
                what: desc.label.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(WgpuBuffer {
            buffer,
            size: desc.size,
            kind: desc.kind,
            mapped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn destroy_buffer(&self, buffer: &WgpuBuffer) {
        buffer.mapped.store(false, Ordering::Release);
        buffer.buffer.destroy();
    }

    fn create_kernel(&self, id: KernelId) -> GpuResult<WgpuKernel> {
        self.check_device()?;
        let features = self.caps.features;
        let unsupported = match id {
            KernelId::Uber(v) if v.is_half_precision() && !features.half_precision => Some("shader-f16"),
            KernelId::Histogram(HistogramStrategy::Subgroup) if !features.subgroups => Some("subgroups"),
            _ => None,
        };
        if let Some(feature) = unsupported {
            return Err(GpuError::ShaderCompilation {
                kernel: id.label().to_string(),
                reason: format!("{feature} not enabled on device"),
            });
        }

        let label = id.label();
        let source = shaders::source(id);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: None, // Auto layout
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::ShaderCompilation {
                kernel: label.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(kernel = label, "compiled compute pipeline");
        Ok(WgpuKernel { pipeline, id })
    }

    fn create_query_set(&self, count: u32) -> GpuResult<wgpu::QuerySet> {
        self.check_device()?;
        if !self.caps.features.timestamp_query {
            return Err(GpuError::OperationFailed("timestamp queries not enabled".into()));
        }
        Ok(self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("pass_timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count,
        }))
    }

    fn begin_encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        kernel: &WgpuKernel,
        args: &DispatchArgs<'_, Self>,
    ) -> GpuResult<()> {
        self.check_device()?;
        let label = kernel.id.label();

        let uniforms = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params_uniform"),
            contents: args.uniforms,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let storage = args.storage.map(|bytes| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params_storage"),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE,
            })
        });

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&args.input.view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: match args.target {
                    DispatchTarget::Texture(t) => wgpu::BindingResource::TextureView(&t.view),
                    DispatchTarget::Counters(b) => b.buffer.as_entire_binding(),
                },
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: uniforms.as_entire_binding(),
            },
        ];
        if let Some(storage) = &storage {
            entries.push(wgpu::BindGroupEntry {
                binding: 3,
                resource: storage.as_entire_binding(),
            });
        }

        let layout = kernel.pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        });

        let timestamp_writes = args.timestamps.as_ref().map(|ts| wgpu::ComputePassTimestampWrites {
            query_set: ts.query_set,
            beginning_of_pass_write_index: Some(ts.begin),
            end_of_pass_write_index: Some(ts.end),
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let [x, y, z] = args.workgroups;
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn encode_copy_buffer(&self, encoder: &mut wgpu::CommandEncoder, src: &WgpuBuffer, dst: &WgpuBuffer, len: u64) {
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, len);
    }

    fn encode_clear_buffer(&self, encoder: &mut wgpu::CommandEncoder, buffer: &WgpuBuffer) {
        encoder.clear_buffer(&buffer.buffer, 0, None);
    }

    fn encode_resolve_queries(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        query_set: &wgpu::QuerySet,
        count: u32,
        dst: &WgpuBuffer,
    ) {
        encoder.resolve_query_set(query_set, 0..count, &dst.buffer, 0);
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) -> GpuResult<()> {
        self.check_device()?;
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_texture(&self, texture: &WgpuTexture) -> GpuResult<Vec<u8>> {
        self.check_device()?;
        let (width, height) = (texture.width, texture.height);
        let row = width * 4;
        let padded = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.staging_buffer("texture_readback", padded as u64 * height as u64);

        let mut encoder = self.begin_encoder("texture_readback");
        encoder.copy_texture_to_buffer(
            Self::texture_copy(&texture.texture),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        let bytes = self.blocking_readback(encoder, &staging)?;
        staging.destroy();

        if padded == row {
            return Ok(bytes);
        }
        let mut out = Vec::with_capacity(row as usize * height as usize);
        for line in bytes.chunks_exact(padded as usize) {
            out.extend_from_slice(&line[..row as usize]);
        }
        Ok(out)
    }

    fn read_buffer(&self, buffer: &WgpuBuffer) -> GpuResult<Vec<u8>> {
        self.check_device()?;
        let staging = self.staging_buffer("buffer_readback", buffer.size);
        let mut encoder = self.begin_encoder("buffer_readback");
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, buffer.size);
        let bytes = self.blocking_readback(encoder, &staging)?;
        staging.destroy();
        Ok(bytes)
    }

    fn map_read(&self, buffer: &WgpuBuffer, callback: MapCallback) {
        let mapped = buffer.mapped.clone();
        buffer.buffer.slice(..).map_async(wgpu::MapMode::Read, move |r| {
            mapped.store(r.is_ok(), Ordering::Release);
            callback(r.map_err(|e| e.to_string()));
        });
    }

    fn mapped_bytes(&self, buffer: &WgpuBuffer, len: u64) -> GpuResult<Vec<u8>> {
        if !buffer.mapped.load(Ordering::Acquire) {
            return Err(GpuError::TransferFailed("buffer is not mapped".into()));
        }
        let len = len.min(buffer.size);
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(buffer.buffer.slice(..len).get_mapped_range().to_vec())
    }

    fn unmap(&self, buffer: &WgpuBuffer) {
        if buffer.mapped.swap(false, Ordering::AcqRel) {
            buffer.buffer.unmap();
        }
    }

    fn poll(&self, mode: PollMode) -> GpuResult<()> {
        let maintain = match mode {
            PollMode::Poll => wgpu::Maintain::Poll,
            PollMode::Wait => wgpu::Maintain::Wait,
        };
        self.device.poll(maintain);
        self.check_device()
    }
}
