//! Edit parameters: the structured, immutable description of one render.
//!
//! [`EditParameters`] is a value object. Every optional field that is
//! absent (or identity) causes the corresponding pipeline stage to be
//! skipped.

use crate::error::{Error, Result};

/// Ten global tonal and color sliders.
///
/// `exposure` is in stops (-5..=5); every other field is a percentage in
/// -100..=100. All zeros is the identity.
///
/// The pipeline applies the fields in declaration order:
/// temperature, tint, exposure, contrast, highlights, shadows, whites,
/// blacks, vibrance, saturation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Adjustments {
    /// Warm (+) / cool (-) white balance shift.
    pub temperature: f32,
    /// Magenta (+) / green (-) white balance shift.
    pub tint: f32,
    /// Exposure in stops.
    pub exposure: f32,
    /// Contrast around mid gray.
    pub contrast: f32,
    /// Highlight recovery (-) or boost (+).
    pub highlights: f32,
    /// Shadow lift (+) or crush (-).
    pub shadows: f32,
    /// White point.
    pub whites: f32,
    /// Black point.
    pub blacks: f32,
    /// Saturation weighted toward muted colors.
    pub vibrance: f32,
    /// Uniform saturation.
    pub saturation: f32,
}

impl Adjustments {
    /// Exposure range in stops.
    pub const EXPOSURE_RANGE: f32 = 5.0;
    /// Range of the percentage sliders.
    pub const PERCENT_RANGE: f32 = 100.0;

    /// True when applying these adjustments cannot change any pixel.
    pub fn is_identity(&self) -> bool {
        self.as_array().iter().all(|v| *v == 0.0)
    }

    /// Fields in application order.
    pub fn as_array(&self) -> [f32; 10] {
        [
            self.temperature,
            self.tint,
            self.exposure,
            self.contrast,
            self.highlights,
            self.shadows,
            self.whites,
            self.blacks,
            self.vibrance,
            self.saturation,
        ]
    }

    /// Checks that every field is finite and within its range.
    pub fn validate(&self) -> Result<()> {
        const NAMES: [&str; 10] = [
            "temperature",
            "tint",
            "exposure",
            "contrast",
            "highlights",
            "shadows",
            "whites",
            "blacks",
            "vibrance",
            "saturation",
        ];
        for (i, (name, value)) in NAMES.iter().zip(self.as_array()).enumerate() {
            let range = if i == 2 { Self::EXPOSURE_RANGE } else { Self::PERCENT_RANGE };
            if !value.is_finite() || value.abs() > range {
                return Err(Error::invalid_parameter(
                    name,
                    format!("{value} outside [-{range}, {range}]"),
                ));
            }
        }
        Ok(())
    }
}

/// A 256-entry per-channel tone curve.
#[derive(Clone, PartialEq, Eq)]
pub struct ToneCurveLut([u8; 256]);

impl ToneCurveLut {
    /// The identity curve (`lut[i] == i`).
    pub fn identity() -> Self {
        Self::from_fn(|i| i)
    }

    /// Wraps a raw table.
    pub fn new(table: [u8; 256]) -> Self {
        Self(table)
    }

    /// Builds a table by evaluating `f` for every input level.
    pub fn from_fn(mut f: impl FnMut(u8) -> u8) -> Self {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = f(i as u8);
        }
        Self(table)
    }

    /// Builds a table from a slice that must hold exactly 256 entries.
    pub fn from_slice(values: &[u8]) -> Result<Self> {
        let table: [u8; 256] = values.try_into().map_err(|_| {
            Error::invalid_parameter("toneCurveLut", format!("expected 256 entries, got {}", values.len()))
        })?;
        Ok(Self(table))
    }

    /// True when every entry maps to itself.
    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, v)| *v as usize == i)
    }

    /// Looks up one level.
    #[inline]
    pub fn apply(&self, level: u8) -> u8 {
        self.0[level as usize]
    }

    /// The raw table.
    pub fn as_slice(&self) -> &[u8; 256] {
        &self.0
    }
}

impl Default for ToneCurveLut {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Debug for ToneCurveLut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneCurveLut")
            .field("identity", &self.is_identity())
            .field("black", &self.0[0])
            .field("mid", &self.0[128])
            .field("white", &self.0[255])
            .finish()
    }
}

/// Shape of a local adjustment, in normalized image coordinates
/// (0,0 top-left, 1,1 bottom-right).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskGeometry {
    /// Elliptical mask: full weight inside `radius * (1 - feather)`,
    /// falling smoothly to zero at `radius`.
    Radial {
        /// Ellipse center.
        center: [f32; 2],
        /// Ellipse radii.
        radius: [f32; 2],
        /// Soft edge fraction in 0..=1.
        feather: f32,
    },
    /// Linear gradient: full weight at `start`, zero at `end`.
    Linear {
        /// Point of full weight.
        start: [f32; 2],
        /// Point of zero weight.
        end: [f32; 2],
    },
}

/// A local adjustment: geometry plus the adjustments blended in under it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    /// Where the mask applies.
    pub geometry: MaskGeometry,
    /// What it applies.
    pub adjustments: Adjustments,
    /// Swap inside and outside.
    pub invert: bool,
    /// Overall strength in 0..=1.
    pub opacity: f32,
}

impl Mask {
    /// A fully opaque, non-inverted mask.
    pub fn new(geometry: MaskGeometry, adjustments: Adjustments) -> Self {
        Self {
            geometry,
            adjustments,
            invert: false,
            opacity: 1.0,
        }
    }

    /// Whether the mask can change any pixel.
    pub fn is_effective(&self) -> bool {
        self.opacity > 0.0 && !self.adjustments.is_identity()
    }

    fn validate(&self) -> Result<()> {
        self.adjustments.validate()?;
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(Error::invalid_parameter("mask.opacity", format!("{} outside [0, 1]", self.opacity)));
        }
        match self.geometry {
            MaskGeometry::Radial { radius, feather, .. } => {
                if !(radius[0] > 0.0 && radius[1] > 0.0) {
                    return Err(Error::invalid_parameter("mask.radius", "radii must be positive"));
                }
                if !(0.0..=1.0).contains(&feather) {
                    return Err(Error::invalid_parameter("mask.feather", format!("{feather} outside [0, 1]")));
                }
            }
            MaskGeometry::Linear { start, end } => {
                if start == end {
                    return Err(Error::invalid_parameter("mask.linear", "start and end coincide"));
                }
            }
        }
        Ok(())
    }
}

/// Render quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quality {
    /// Reduced resolution, analyses skipped.
    Draft,
    /// Full resolution with histogram and clipping analysis.
    #[default]
    Full,
}

/// Everything one render needs to know about the edit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EditParameters {
    /// Clockwise rotation in degrees.
    pub rotation_degrees: Option<f32>,
    /// Global adjustments.
    pub adjustments: Option<Adjustments>,
    /// Tone curve applied after the adjustments.
    pub tone_curve: Option<ToneCurveLut>,
    /// Local adjustments, composited in order.
    pub masks: Vec<Mask>,
    /// Quality tier.
    pub quality: Quality,
    /// Working resolution scale in (0, 1]; `None` means 1.0.
    pub target_resolution_scale: Option<f32>,
}

impl EditParameters {
    /// Parameters that change nothing, at full quality.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rotation angle.
    pub fn with_rotation(mut self, degrees: f32) -> Self {
        self.rotation_degrees = Some(degrees);
        self
    }

    /// Sets the global adjustments.
    pub fn with_adjustments(mut self, adjustments: Adjustments) -> Self {
        self.adjustments = Some(adjustments);
        self
    }

    /// Sets the tone curve.
    pub fn with_tone_curve(mut self, lut: ToneCurveLut) -> Self {
        self.tone_curve = Some(lut);
        self
    }

    /// Appends a mask.
    pub fn with_mask(mut self, mask: Mask) -> Self {
        self.masks.push(mask);
        self
    }

    /// Sets the quality tier.
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Sets the working resolution scale.
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.target_resolution_scale = Some(scale);
        self
    }

    /// Resolution scale, defaulting to 1.0.
    pub fn scale(&self) -> f32 {
        self.target_resolution_scale.unwrap_or(1.0)
    }

    /// Rotation normalized to (-180, 180], or `None` when it is a no-op.
    pub fn effective_rotation(&self) -> Option<f32> {
        let degrees = self.rotation_degrees?;
        let mut d = degrees % 360.0;
        if d > 180.0 {
            d -= 360.0;
        } else if d <= -180.0 {
            d += 360.0;
        }
        (d != 0.0).then_some(d)
    }

    /// Global adjustments if present and not identity.
    pub fn effective_adjustments(&self) -> Option<&Adjustments> {
        self.adjustments.as_ref().filter(|a| !a.is_identity())
    }

    /// Tone curve if present and not identity.
    pub fn effective_tone_curve(&self) -> Option<&ToneCurveLut> {
        self.tone_curve.as_ref().filter(|l| !l.is_identity())
    }

    /// Masks that can change a pixel.
    pub fn effective_masks(&self) -> impl Iterator<Item = &Mask> {
        self.masks.iter().filter(|m| m.is_effective())
    }

    /// Validates every field.
    pub fn validate(&self) -> Result<()> {
        if let Some(scale) = self.target_resolution_scale {
            if !(scale > 0.0 && scale <= 1.0) {
                return Err(Error::invalid_parameter(
                    "targetResolutionScale",
                    format!("{scale} outside (0, 1]"),
                ));
            }
        }
        if let Some(deg) = self.rotation_degrees {
            if !deg.is_finite() {
                return Err(Error::invalid_parameter("rotationAngleDegrees", "not finite"));
            }
        }
        if let Some(adj) = &self.adjustments {
            adj.validate()?;
        }
        self.masks.iter().try_for_each(Mask::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_adjustments_are_identity() {
        assert!(Adjustments::default().is_identity());
        let adj = Adjustments { vibrance: 1.0, ..Default::default() };
        assert!(!adj.is_identity());
    }

    #[test]
    fn adjustments_range_checked() {
        let adj = Adjustments { exposure: 6.0, ..Default::default() };
        assert!(matches!(adj.validate(), Err(Error::InvalidParameter { name: "exposure", .. })));
        let adj = Adjustments { contrast: f32::NAN, ..Default::default() };
        assert!(adj.validate().is_err());
        let adj = Adjustments { contrast: -100.0, exposure: -5.0, ..Default::default() };
        assert!(adj.validate().is_ok());
    }

    #[test]
    fn lut_identity_detection() {
        assert!(ToneCurveLut::identity().is_identity());
        let inverted = ToneCurveLut::from_fn(|i| 255 - i);
        assert!(!inverted.is_identity());
        assert_eq!(inverted.apply(0), 255);
        assert!(ToneCurveLut::from_slice(&[0; 10]).is_err());
    }

    #[test]
    fn rotation_normalization() {
        let p = EditParameters::new().with_rotation(360.0);
        assert_eq!(p.effective_rotation(), None);
        let p = EditParameters::new().with_rotation(270.0);
        assert_eq!(p.effective_rotation(), Some(-90.0));
        let p = EditParameters::new().with_rotation(-180.0);
        assert_eq!(p.effective_rotation(), Some(180.0));
    }

    #[test]
    fn scale_validation() {
        assert!(EditParameters::new().with_scale(1.0).validate().is_ok());
        assert!(EditParameters::new().with_scale(0.0).validate().is_err());
        assert!(EditParameters::new().with_scale(1.5).validate().is_err());
        assert_eq!(EditParameters::new().scale(), 1.0);
    }

    #[test]
    fn ineffective_masks_are_filtered() {
        let geometry = MaskGeometry::Linear { start: [0.0, 0.0], end: [1.0, 0.0] };
        let noop = Mask::new(geometry, Adjustments::default());
        let real = Mask::new(geometry, Adjustments { exposure: 1.0, ..Default::default() });
        let p = EditParameters::new().with_mask(noop).with_mask(real.clone());
        let masks: Vec<_> = p.effective_masks().collect();
        assert_eq!(masks, vec![&real]);
    }

    #[test]
    fn degenerate_mask_rejected() {
        let geometry = MaskGeometry::Linear { start: [0.5, 0.5], end: [0.5, 0.5] };
        let p = EditParameters::new().with_mask(Mask::new(geometry, Adjustments::default()));
        assert!(p.validate().is_err());
    }
}
