//! Pipeline, session and device configuration.
//!
//! Every struct has sensible defaults, a `from_env()` constructor that
//! applies environment overrides on top of them, and (for the pipeline)
//! a builder.
//!
//! # Environment Variables
//!
//! - `DARKROOM_BACKEND` - `cpu`, `wgpu` or `auto`
//! - `DARKROOM_STAGING_POOL_SIZE` - staging ring size (1-16)
//! - `DARKROOM_DOWNSAMPLE` - `gpu` or `cpu`
//! - `DARKROOM_DISABLE_F16` - never use the half-precision uber variant ("1" or "true")
//! - `DARKROOM_DISABLE_SUBGROUPS` - never use the subgroup histogram ("1" or "true")
//! - `DARKROOM_DISABLE_TIMING` - never record GPU timestamps ("1" or "true")
//! - `DARKROOM_DRAFT_SCALE` - draft resolution scale in (0, 1]
//! - `DARKROOM_DRAFT_INTERVAL_MS` - draft throttle interval
//! - `DARKROOM_QUIET_MS` - quiet period before the full render

use std::env;
use std::time::Duration;

use crate::backend::Backend;

/// Default staging ring size (triple buffering).
pub const DEFAULT_STAGING_POOL_SIZE: usize = 3;

/// Where the draft downsample runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownsampleMode {
    /// Upload full resolution, box-filter in a compute pass.
    #[default]
    Gpu,
    /// Box-filter the CPU buffer before upload.
    Cpu,
}

/// GPU adapter preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    /// Discrete GPU when present.
    #[default]
    HighPerformance,
    /// Integrated GPU when present.
    LowPower,
}

// =============================================================================
// Device
// =============================================================================

/// Options applied when a backend device is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Requested backend.
    pub backend: Backend,
    /// Adapter preference.
    pub power: PowerPreference,
    /// Request half-precision shader support if the adapter has it.
    pub half_precision: bool,
    /// Request subgroup operations if the adapter has them.
    pub subgroups: bool,
    /// Request timestamp queries if the adapter has them.
    pub timestamps: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            power: PowerPreference::HighPerformance,
            half_precision: true,
            subgroups: true,
            timestamps: true,
        }
    }
}

impl DeviceConfig {
    /// Defaults with environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(backend) = lookup("DARKROOM_BACKEND").and_then(|v| Backend::parse(&v)) {
            config.backend = backend;
        }
        if flag(&lookup, "DARKROOM_DISABLE_F16") {
            config.half_precision = false;
        }
        if flag(&lookup, "DARKROOM_DISABLE_SUBGROUPS") {
            config.subgroups = false;
        }
        if flag(&lookup, "DARKROOM_DISABLE_TIMING") {
            config.timestamps = false;
        }
        config
    }

    /// Concrete backend, with `Auto` resolved by detection.
    pub fn resolved_backend(&self) -> Backend {
        self.backend.resolve()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Options for one [`EditPipeline`](crate::EditPipeline).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Number of staging buffers in the readback ring.
    pub staging_pool_size: usize,
    /// Where draft downsampling runs.
    pub downsample_mode: DownsampleMode,
    /// Use the half-precision uber variant when the device supports it.
    pub allow_half_precision: bool,
    /// Use the subgroup histogram when the device supports it.
    pub allow_subgroups: bool,
    /// Record per-pass GPU timestamps when the device supports them.
    pub gpu_timing: bool,
    /// Run histogram/clipping analysis in full-quality renders.
    pub analysis: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staging_pool_size: DEFAULT_STAGING_POOL_SIZE,
            downsample_mode: DownsampleMode::Gpu,
            allow_half_precision: true,
            allow_subgroups: true,
            gpu_timing: true,
            analysis: true,
        }
    }
}

impl PipelineConfig {
    /// Start a builder from defaults.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Defaults with environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(size) = lookup("DARKROOM_STAGING_POOL_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|s| (1..=16).contains(s))
        {
            config.staging_pool_size = size;
        }
        match lookup("DARKROOM_DOWNSAMPLE").as_deref() {
            Some(v) if v.eq_ignore_ascii_case("cpu") => config.downsample_mode = DownsampleMode::Cpu,
            Some(v) if v.eq_ignore_ascii_case("gpu") => config.downsample_mode = DownsampleMode::Gpu,
            _ => {}
        }
        if flag(&lookup, "DARKROOM_DISABLE_F16") {
            config.allow_half_precision = false;
        }
        if flag(&lookup, "DARKROOM_DISABLE_SUBGROUPS") {
            config.allow_subgroups = false;
        }
        if flag(&lookup, "DARKROOM_DISABLE_TIMING") {
            config.gpu_timing = false;
        }
        config
    }
}

/// Builder for [`PipelineConfig`].
///
/// ```
/// use darkroom_gpu::{DownsampleMode, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .staging_pool_size(1)
///     .downsample_mode(DownsampleMode::Cpu)
///     .half_precision(false)
///     .build();
/// assert_eq!(config.staging_pool_size, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Staging ring size (clamped to at least 1).
    pub fn staging_pool_size(mut self, size: usize) -> Self {
        self.config.staging_pool_size = size.max(1);
        self
    }

    /// Where draft downsampling runs.
    pub fn downsample_mode(mut self, mode: DownsampleMode) -> Self {
        self.config.downsample_mode = mode;
        self
    }

    /// Allow the half-precision uber variant.
    pub fn half_precision(mut self, enabled: bool) -> Self {
        self.config.allow_half_precision = enabled;
        self
    }

    /// Allow the subgroup histogram.
    pub fn subgroups(mut self, enabled: bool) -> Self {
        self.config.allow_subgroups = enabled;
        self
    }

    /// Record GPU timestamps.
    pub fn gpu_timing(mut self, enabled: bool) -> Self {
        self.config.gpu_timing = enabled;
        self
    }

    /// Run analysis in full renders.
    pub fn analysis(mut self, enabled: bool) -> Self {
        self.config.analysis = enabled;
        self
    }

    /// Finish.
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

// =============================================================================
// Session
// =============================================================================

/// Timing of the interactive draft/full loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Minimum spacing between draft renders.
    pub draft_interval: Duration,
    /// Input silence required before the full render.
    pub quiet_period: Duration,
    /// Resolution scale of draft renders.
    pub draft_scale: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            draft_interval: Duration::from_millis(33),
            quiet_period: Duration::from_millis(250),
            draft_scale: 0.5,
        }
    }
}

impl SessionConfig {
    /// Defaults with environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(scale) = lookup("DARKROOM_DRAFT_SCALE")
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|s| *s > 0.0 && *s <= 1.0)
        {
            config.draft_scale = scale;
        }
        if let Some(ms) = lookup("DARKROOM_DRAFT_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.draft_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("DARKROOM_QUIET_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.quiet_period = Duration::from_millis(ms);
        }
        config
    }
}

// =============================================================================
// Environment Variable Helpers
// =============================================================================

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.staging_pool_size, 3);
        assert_eq!(config.downsample_mode, DownsampleMode::Gpu);
        assert!(config.allow_half_precision && config.allow_subgroups);
    }

    #[test]
    fn test_pipeline_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DARKROOM_STAGING_POOL_SIZE", "5"),
            ("DARKROOM_DOWNSAMPLE", "CPU"),
            ("DARKROOM_DISABLE_F16", "true"),
            ("DARKROOM_DISABLE_TIMING", "0"),
        ]));
        assert_eq!(config.staging_pool_size, 5);
        assert_eq!(config.downsample_mode, DownsampleMode::Cpu);
        assert!(!config.allow_half_precision);
        assert!(config.gpu_timing);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let config = PipelineConfig::from_lookup(lookup(&[("DARKROOM_STAGING_POOL_SIZE", "0")]));
        assert_eq!(config.staging_pool_size, DEFAULT_STAGING_POOL_SIZE);
        let session = SessionConfig::from_lookup(lookup(&[("DARKROOM_DRAFT_SCALE", "2.0")]));
        assert_eq!(session.draft_scale, 0.5);
    }

    #[test]
    fn test_device_overrides() {
        let config = DeviceConfig::from_lookup(lookup(&[
            ("DARKROOM_BACKEND", "cpu"),
            ("DARKROOM_DISABLE_SUBGROUPS", "1"),
        ]));
        assert_eq!(config.backend, Backend::Cpu);
        assert!(!config.subgroups);
        assert!(config.half_precision);
    }

    #[test]
    fn test_builder_clamps_pool() {
        let config = PipelineConfig::builder().staging_pool_size(0).build();
        assert_eq!(config.staging_pool_size, 1);
    }

    #[test]
    fn test_session_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("DARKROOM_DRAFT_INTERVAL_MS", "16"),
            ("DARKROOM_QUIET_MS", "500"),
        ]));
        assert_eq!(config.draft_interval, Duration::from_millis(16));
        assert_eq!(config.quiet_period, Duration::from_millis(500));
    }
}
