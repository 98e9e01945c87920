//! Capability probing.
//!
//! [`CapabilityService`] opens the session's one device at most once and
//! reports what it can do. Probing never fails: any error (or panic inside
//! the driver stack) becomes `available = false`, and the caller decides
//! whether to fall back to a non-GPU path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::backend::GpuPrimitives;
use crate::{GpuError, GpuResult};

/// Optional device features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureSet {
    /// `f16` arithmetic in shaders.
    pub half_precision: bool,
    /// Subgroup reduction operations.
    pub subgroups: bool,
    /// Timestamp queries on compute passes.
    pub timestamp_query: bool,
}

/// Device limits relevant to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum 2-D texture dimension.
    pub max_texture_size: u32,
    /// Maximum buffer size in bytes.
    pub max_buffer_size: u64,
    /// Maximum invocations per workgroup.
    pub max_workgroup_size: u32,
    /// Maximum workgroups per dispatch dimension.
    pub max_workgroups_per_dimension: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_texture_size: 8192,
            max_buffer_size: 256 * 1024 * 1024,
            max_workgroup_size: 256,
            max_workgroups_per_dimension: 65535,
        }
    }
}

/// Immutable snapshot of what the session's device can do.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Whether a device could be opened at all.
    pub available: bool,
    /// Backend identifier ("vulkan", "metal", "cpu", ...).
    pub backend: String,
    /// Adapter name.
    pub adapter_name: String,
    /// Optional features.
    pub features: FeatureSet,
    /// Limits.
    pub limits: DeviceLimits,
    /// Why the device is unavailable.
    pub unavailable_reason: Option<String>,
}

impl Capabilities {
    /// Snapshot for a device that could not be opened.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            backend: "none".into(),
            adapter_name: String::new(),
            features: FeatureSet::default(),
            limits: DeviceLimits::default(),
            unavailable_reason: Some(reason.into()),
        }
    }

    /// Whether GPU pass timing can be enabled.
    pub fn supports_timing(&self) -> bool {
        self.available && self.features.timestamp_query
    }

    /// Reject textures larger than the device allows.
    pub fn check_texture_size(&self, width: u32, height: u32) -> GpuResult<()> {
        let limit = self.limits.max_texture_size;
        if width > limit || height > limit {
            return Err(GpuError::ImageTooLarge { width, height, limit });
        }
        Ok(())
    }
}

type Opener<G> = Box<dyn Fn() -> GpuResult<G> + Send + Sync>;

/// Opens and caches the session device.
///
/// ```
/// use darkroom_gpu::{CapabilityService, CpuPrimitives, GpuError};
///
/// let service = CapabilityService::new(|| Ok(CpuPrimitives::new()));
/// assert!(service.probe().available);
///
/// let broken: CapabilityService<CpuPrimitives> =
///     CapabilityService::new(|| Err(GpuError::Unavailable("no adapter".into())));
/// assert!(!broken.probe().available);
/// ```
pub struct CapabilityService<G: GpuPrimitives> {
    opener: Opener<G>,
    probed: OnceLock<(Capabilities, Option<Arc<G>>)>,
}

impl<G: GpuPrimitives> CapabilityService<G> {
    /// Service that will open its device with `opener` on first probe.
    pub fn new(opener: impl Fn() -> GpuResult<G> + Send + Sync + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            probed: OnceLock::new(),
        }
    }

    /// Service around an already-open device.
    pub fn from_device(device: Arc<G>) -> Self {
        let service = Self::new(|| Err(GpuError::Unavailable("device supplied externally".into())));
        let caps = device.capabilities().clone();
        let _ = service.probed.set((caps, Some(device)));
        service
    }

    /// Probe once; later calls return the cached snapshot.
    pub fn probe(&self) -> Capabilities {
        self.probed.get_or_init(|| self.open()).0.clone()
    }

    /// The session device, if the probe succeeded.
    pub fn device(&self) -> GpuResult<Arc<G>> {
        let (caps, device) = self.probed.get_or_init(|| self.open());
        device.clone().ok_or_else(|| {
            GpuError::Unavailable(caps.unavailable_reason.clone().unwrap_or_else(|| "not probed".into()))
        })
    }

    fn open(&self) -> (Capabilities, Option<Arc<G>>) {
        match catch_unwind(AssertUnwindSafe(|| (self.opener)())) {
            Ok(Ok(device)) => {
                let caps = device.capabilities().clone();
                info!(
                    backend = %caps.backend,
                    adapter = %caps.adapter_name,
                    f16 = caps.features.half_precision,
                    subgroups = caps.features.subgroups,
                    timestamps = caps.features.timestamp_query,
                    "GPU device opened"
                );
                (caps, Some(Arc::new(device)))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "GPU probe failed");
                (Capabilities::unavailable(e.to_string()), None)
            }
            Err(_) => {
                warn!("GPU probe panicked");
                (Capabilities::unavailable("device initialization panicked"), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuPrimitives;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_probe_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let service = CapabilityService::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CpuPrimitives::new())
        });
        let a = service.probe();
        let b = service.probe();
        assert_eq!(a, b);
        assert!(a.available);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(service.device().is_ok());
    }

    #[test]
    fn test_failure_reports_unavailable() {
        let service: CapabilityService<CpuPrimitives> =
            CapabilityService::new(|| Err(GpuError::Unavailable("no adapter".into())));
        let caps = service.probe();
        assert!(!caps.available);
        assert!(!caps.supports_timing());
        assert!(caps.unavailable_reason.as_deref().unwrap_or("").contains("no adapter"));
        assert!(matches!(service.device(), Err(GpuError::Unavailable(_))));
    }

    #[test]
    fn test_panic_reports_unavailable() {
        let service: CapabilityService<CpuPrimitives> = CapabilityService::new(|| panic!("driver crashed"));
        assert!(!service.probe().available);
    }

    #[test]
    fn test_texture_size_check() {
        let caps = CpuPrimitives::new().capabilities().clone();
        let limit = caps.limits.max_texture_size;
        assert!(caps.check_texture_size(limit, 1).is_ok());
        assert!(matches!(
            caps.check_texture_size(limit + 1, 1),
            Err(GpuError::ImageTooLarge { .. })
        ));
    }
}
