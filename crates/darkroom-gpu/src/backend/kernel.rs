//! Kernel identities: the cache keys for compiled compute pipelines.

use std::fmt;

/// Feature combination of the uber pass.
///
/// One compiled pipeline exists per variant, never per parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineVariant {
    /// Adjustments chain only.
    Adjustments,
    /// Tone-curve lookup only.
    ToneCurve,
    /// Adjustments followed by the tone curve, full precision.
    Combined,
    /// Fused, with precision-tolerant steps in f16.
    CombinedF16,
}

impl PipelineVariant {
    /// Variant for a set of requested operations.
    ///
    /// Returns `None` when neither operation is requested.
    pub fn select(adjustments: bool, tone_curve: bool, half_precision: bool) -> Option<Self> {
        match (adjustments, tone_curve) {
            (true, true) if half_precision => Some(Self::CombinedF16),
            (true, true) => Some(Self::Combined),
            (true, false) => Some(Self::Adjustments),
            (false, true) => Some(Self::ToneCurve),
            (false, false) => None,
        }
    }

    /// Whether the variant runs the adjustments chain.
    pub fn has_adjustments(self) -> bool {
        !matches!(self, Self::ToneCurve)
    }

    /// Whether the variant samples the tone curve.
    pub fn has_tone_curve(self) -> bool {
        !matches!(self, Self::Adjustments)
    }

    /// Whether the variant needs `SHADER_F16`.
    pub fn is_half_precision(self) -> bool {
        matches!(self, Self::CombinedF16)
    }

    /// Full-precision equivalent.
    pub fn full_precision(self) -> Self {
        match self {
            Self::CombinedF16 => Self::Combined,
            other => other,
        }
    }
}

/// Histogram reduction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HistogramStrategy {
    /// 16x16 workgroups, workgroup-local bins, one global flush per workgroup.
    #[default]
    Standard,
    /// 256x1 workgroups, subgroup reduction before the local flush.
    Subgroup,
}

/// Every compute kernel the pipeline compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Box-filter downsample.
    Downsample,
    /// Bilinear rotation into the rotated bounding box.
    Rotation,
    /// Standalone adjustments pass.
    Adjustments,
    /// Standalone tone-curve pass.
    ToneCurve,
    /// Local mask compositing.
    Masks,
    /// Fused uber pass.
    Uber(PipelineVariant),
    /// Histogram accumulation.
    Histogram(HistogramStrategy),
}

impl KernelId {
    /// Debug label used for pipelines and passes.
    pub fn label(self) -> &'static str {
        match self {
            Self::Downsample => "downsample",
            Self::Rotation => "rotation",
            Self::Adjustments => "adjustments",
            Self::ToneCurve => "tone_curve",
            Self::Masks => "masks",
            Self::Uber(PipelineVariant::Adjustments) => "uber_adjustments",
            Self::Uber(PipelineVariant::ToneCurve) => "uber_tone_curve",
            Self::Uber(PipelineVariant::Combined) => "uber_combined",
            Self::Uber(PipelineVariant::CombinedF16) => "uber_combined_f16",
            Self::Histogram(HistogramStrategy::Standard) => "histogram",
            Self::Histogram(HistogramStrategy::Subgroup) => "histogram_subgroup",
        }
    }

    /// Whether the kernel writes the counter buffer instead of a texture.
    pub fn writes_counters(self) -> bool {
        matches!(self, Self::Histogram(_))
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_selection() {
        assert_eq!(PipelineVariant::select(false, false, true), None);
        assert_eq!(PipelineVariant::select(true, false, true), Some(PipelineVariant::Adjustments));
        assert_eq!(PipelineVariant::select(false, true, true), Some(PipelineVariant::ToneCurve));
        assert_eq!(PipelineVariant::select(true, true, false), Some(PipelineVariant::Combined));
        assert_eq!(PipelineVariant::select(true, true, true), Some(PipelineVariant::CombinedF16));
    }

    #[test]
    fn test_variant_capabilities() {
        assert!(PipelineVariant::CombinedF16.has_adjustments());
        assert!(PipelineVariant::CombinedF16.has_tone_curve());
        assert!(!PipelineVariant::ToneCurve.has_adjustments());
        assert_eq!(PipelineVariant::CombinedF16.full_precision(), PipelineVariant::Combined);
    }
}
