//! Uniform blocks and storage records shared by the WGSL kernels and the
//! CPU backend. Layouts match the WGSL structs in `shaders`.

use bytemuck::{Pod, Zeroable};
use darkroom_core::{Adjustments, Mask, MaskGeometry};

/// Image size plus padding to 16 bytes. Used by tone curve and histogram.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SizeUniform {
    pub size: [u32; 2],
    pub _pad: [u32; 2],
}

impl SizeUniform {
    pub fn new(width: u32, height: u32) -> Self {
        Self { size: [width, height], _pad: [0; 2] }
    }
}

/// Source and destination sizes of the downsample kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DownsampleUniform {
    pub src_size: [u32; 2],
    pub dst_size: [u32; 2],
}

/// Rotation: sizes plus cosine/sine of the clockwise angle.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RotationUniform {
    pub src_size: [u32; 2],
    pub dst_size: [u32; 2],
    pub cos_sin: [f32; 2],
    pub _pad: [f32; 2],
}

/// The ten adjustment sliders packed in application order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AdjustBlock {
    /// temperature, tint, exposure, contrast
    pub wb: [f32; 4],
    /// highlights, shadows, whites, blacks
    pub tone: [f32; 4],
    /// vibrance, saturation, unused, unused
    pub color: [f32; 4],
}

impl From<&Adjustments> for AdjustBlock {
    fn from(a: &Adjustments) -> Self {
        Self {
            wb: [a.temperature, a.tint, a.exposure, a.contrast],
            tone: [a.highlights, a.shadows, a.whites, a.blacks],
            color: [a.vibrance, a.saturation, 0.0, 0.0],
        }
    }
}

/// Adjustments and uber kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AdjustUniform {
    pub size: [u32; 2],
    pub _pad: [u32; 2],
    pub adjust: AdjustBlock,
}

impl AdjustUniform {
    pub fn new(width: u32, height: u32, adjustments: Option<&Adjustments>) -> Self {
        Self {
            size: [width, height],
            _pad: [0; 2],
            adjust: adjustments.map(AdjustBlock::from).unwrap_or_default(),
        }
    }
}

/// Mask kernel header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaskUniform {
    pub size: [u32; 2],
    pub count: u32,
    pub _pad: u32,
}

/// Radial mask shape tag.
pub const MASK_RADIAL: f32 = 0.0;
/// Linear mask shape tag.
pub const MASK_LINEAR: f32 = 1.0;

/// One mask in the storage array.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaskRecord {
    /// Radial: center.xy, radius.xy. Linear: start.xy, end.xy.
    pub geometry: [f32; 4],
    /// kind, feather, opacity, invert
    pub shape: [f32; 4],
    pub adjust: AdjustBlock,
}

impl From<&Mask> for MaskRecord {
    fn from(mask: &Mask) -> Self {
        let (kind, geometry, feather) = match mask.geometry {
            MaskGeometry::Radial { center, radius, feather } => {
                (MASK_RADIAL, [center[0], center[1], radius[0], radius[1]], feather)
            }
            MaskGeometry::Linear { start, end } => (MASK_LINEAR, [start[0], start[1], end[0], end[1]], 0.0),
        };
        Self {
            geometry,
            shape: [kind, feather, mask.opacity, if mask.invert { 1.0 } else { 0.0 }],
            adjust: AdjustBlock::from(&mask.adjustments),
        }
    }
}

/// Tone-curve table widened to one `u32` per entry for WGSL storage arrays.
pub fn lut_words(table: &[u8; 256]) -> Vec<u8> {
    let words: Vec<u32> = table.iter().map(|v| *v as u32).collect();
    bytemuck::cast_slice(&words).to_vec()
}
