//! WGSL shader sources for the compute kernels.
//!
//! Every kernel uses the same binding layout: 0 = input texture,
//! 1 = output storage texture (or counter buffer), 2 = uniform block,
//! 3 = read-only storage when the kernel needs it. Auto layouts drop unused
//! bindings, so each shader declares exactly the bindings it reads.

#![cfg_attr(not(feature = "wgpu"), allow(dead_code))]

use crate::backend::{HistogramStrategy, KernelId, PipelineVariant};

/// Box-filter downsample, exact integer mean per output pixel.
pub const DOWNSAMPLE: &str = r#"
struct Params {
    src_size: vec2<u32>,
    dst_size: vec2<u32>,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= params.dst_size.x || id.y >= params.dst_size.y { return; }

    let x0 = id.x * params.src_size.x / params.dst_size.x;
    let x1 = max((id.x + 1u) * params.src_size.x / params.dst_size.x, x0 + 1u);
    let y0 = id.y * params.src_size.y / params.dst_size.y;
    let y1 = max((id.y + 1u) * params.src_size.y / params.dst_size.y, y0 + 1u);

    var sum = vec4<u32>(0u);
    for (var y = y0; y < y1; y++) {
        for (var x = x0; x < x1; x++) {
            sum += vec4<u32>(round(textureLoad(src, vec2<u32>(x, y), 0) * 255.0));
        }
    }
    let count = (x1 - x0) * (y1 - y0);
    let mean = (sum + vec4<u32>(count / 2u)) / vec4<u32>(count);
    textureStore(dst, id.xy, vec4<f32>(mean) / 255.0);
}
"#;

/// Bilinear rotation about the image center into the rotated bounding box.
pub const ROTATION: &str = r#"
struct Params {
    src_size: vec2<u32>,
    dst_size: vec2<u32>,
    cos_sin: vec2<f32>,
    _pad: vec2<f32>,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: Params;

fn fetch(p: vec2<i32>) -> vec4<f32> {
    let hi = vec2<i32>(params.src_size) - vec2<i32>(1);
    return textureLoad(src, clamp(p, vec2<i32>(0), hi), 0);
}

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= params.dst_size.x || id.y >= params.dst_size.y { return; }

    let src_size = vec2<f32>(params.src_size);
    let d = vec2<f32>(id.xy) + 0.5 - vec2<f32>(params.dst_size) * 0.5;
    let c = params.cos_sin.x;
    let s = params.cos_sin.y;
    let p = vec2<f32>(c * d.x + s * d.y, -s * d.x + c * d.y) + src_size * 0.5;

    if p.x < 0.0 || p.y < 0.0 || p.x > src_size.x || p.y > src_size.y {
        textureStore(dst, id.xy, vec4<f32>(0.0));
        return;
    }

    let q = p - 0.5;
    let base = floor(q);
    let f = q - base;
    let i = vec2<i32>(base);
    let top = mix(fetch(i), fetch(i + vec2<i32>(1, 0)), f.x);
    let bottom = mix(fetch(i + vec2<i32>(0, 1)), fetch(i + vec2<i32>(1, 1)), f.x);
    textureStore(dst, id.xy, mix(top, bottom, f.y));
}
"#;

/// Adjustment block layout and the luminance helper.
const ADJUST_COMMON: &str = r#"
struct Adjust {
    wb: vec4<f32>,    // temperature, tint, exposure, contrast
    tone: vec4<f32>,  // highlights, shadows, whites, blacks
    color: vec4<f32>, // vibrance, saturation
}

fn luma(c: vec3<f32>) -> f32 {
    return dot(c, vec3<f32>(0.2126, 0.7152, 0.0722));
}
"#;

/// Full-precision adjustments chain.
const ADJUST_F32: &str = r#"
fn adjust(rgb: vec3<f32>, a: Adjust) -> vec3<f32> {
    var c = rgb;
    let t = a.wb.x / 100.0;
    c = c * vec3<f32>(1.0 + 0.2 * t, 1.0 - 0.2 * (a.wb.y / 100.0), 1.0 - 0.2 * t);
    c = (c * exp2(a.wb.z) - 0.5) * (1.0 + a.wb.w / 100.0) + 0.5;

    c = c + 0.25 * (a.tone.x / 100.0) * smoothstep(0.5, 1.0, luma(c));
    c = c + 0.25 * (a.tone.y / 100.0) * (1.0 - smoothstep(0.0, 0.5, luma(c)));

    let black = -0.25 * (a.tone.w / 100.0);
    c = (c / (1.0 - 0.25 * (a.tone.z / 100.0)) - black) / (1.0 - black);

    var l = luma(c);
    let sat = clamp(max(c.r, max(c.g, c.b)) - min(c.r, min(c.g, c.b)), 0.0, 1.0);
    c = l + (c - l) * (1.0 + (a.color.x / 100.0) * (1.0 - sat));

    l = luma(c);
    c = l + (c - l) * (1.0 + a.color.y / 100.0);
    return clamp(c, vec3<f32>(0.0), vec3<f32>(1.0));
}
"#;

/// Mixed-precision chain. Highlight/shadow recovery, vibrance and luminance
/// stay in f32.
const ADJUST_F16: &str = r#"
fn adjust(rgb: vec3<f32>, a: Adjust) -> vec3<f32> {
    var h = vec3<f16>(rgb);
    let t = f16(a.wb.x / 100.0);
    h = h * vec3<f16>(1.0h + 0.2h * t, 1.0h - 0.2h * f16(a.wb.y / 100.0), 1.0h - 0.2h * t);
    h = (h * f16(exp2(a.wb.z)) - 0.5h) * f16(1.0 + a.wb.w / 100.0) + 0.5h;

    var c = vec3<f32>(h);
    c = c + 0.25 * (a.tone.x / 100.0) * smoothstep(0.5, 1.0, luma(c));
    c = c + 0.25 * (a.tone.y / 100.0) * (1.0 - smoothstep(0.0, 0.5, luma(c)));

    let black = f16(-0.25 * (a.tone.w / 100.0));
    h = (vec3<f16>(c) / f16(1.0 - 0.25 * (a.tone.z / 100.0)) - black) / (1.0h - black);
    c = vec3<f32>(h);

    var l = luma(c);
    let sat = clamp(max(c.r, max(c.g, c.b)) - min(c.r, min(c.g, c.b)), 0.0, 1.0);
    c = l + (c - l) * (1.0 + (a.color.x / 100.0) * (1.0 - sat));

    l = luma(c);
    c = l + vec3<f32>(vec3<f16>(c - l) * f16(1.0 + a.color.y / 100.0));
    return clamp(c, vec3<f32>(0.0), vec3<f32>(1.0));
}
"#;

const ADJUST_BINDINGS: &str = r#"
struct Params {
    size: vec2<u32>,
    _pad: vec2<u32>,
    adjust: Adjust,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: Params;
"#;

const LUT_BINDING: &str = r#"
@group(0) @binding(3) var<storage, read> lut: array<u32>;

fn apply_lut(rgb: vec3<f32>) -> vec3<f32> {
    let q = vec3<u32>(round(clamp(rgb, vec3<f32>(0.0), vec3<f32>(1.0)) * 255.0));
    return vec3<f32>(f32(lut[q.x]), f32(lut[q.y]), f32(lut[q.z])) / 255.0;
}
"#;

/// Standalone tone-curve lookup.
pub const TONE_CURVE: &str = r#"
struct Params {
    size: vec2<u32>,
    _pad: vec2<u32>,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(3) var<storage, read> lut: array<u32>;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= params.size.x || id.y >= params.size.y { return; }
    let px = textureLoad(src, id.xy, 0);
    let q = vec3<u32>(round(px.rgb * 255.0));
    let rgb = vec3<f32>(f32(lut[q.x]), f32(lut[q.y]), f32(lut[q.z])) / 255.0;
    textureStore(dst, id.xy, vec4<f32>(rgb, px.a));
}
"#;

const MASKS_MAIN: &str = r#"
struct Params {
    size: vec2<u32>,
    count: u32,
    _pad: u32,
}

struct MaskRecord {
    geometry: vec4<f32>, // radial: center, radius; linear: start, end
    shape: vec4<f32>,    // kind, feather, opacity, invert
    adjust: Adjust,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(3) var<storage, read> masks: array<MaskRecord>;

fn weight(m: MaskRecord, p: vec2<f32>) -> f32 {
    var w = 0.0;
    if m.shape.x == 0.0 {
        let r = length((p - m.geometry.xy) / m.geometry.zw);
        if m.shape.y <= 0.0 {
            w = select(0.0, 1.0, r <= 1.0);
        } else {
            w = 1.0 - smoothstep(1.0 - m.shape.y, 1.0, r);
        }
    } else {
        let dir = m.geometry.zw - m.geometry.xy;
        let t = dot(p - m.geometry.xy, dir) / dot(dir, dir);
        w = clamp(1.0 - t, 0.0, 1.0);
    }
    if m.shape.w > 0.5 {
        w = 1.0 - w;
    }
    return w * m.shape.z;
}

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= params.size.x || id.y >= params.size.y { return; }
    let px = textureLoad(src, id.xy, 0);
    let p = (vec2<f32>(id.xy) + 0.5) / vec2<f32>(params.size);
    var c = px.rgb;
    for (var i = 0u; i < params.count; i++) {
        let m = masks[i];
        let w = weight(m, p);
        if w > 0.0 {
            c = mix(c, adjust(c, m.adjust), w);
        }
    }
    textureStore(dst, id.xy, vec4<f32>(clamp(c, vec3<f32>(0.0), vec3<f32>(1.0)), px.a));
}
"#;

const HISTOGRAM_COMMON: &str = r#"
struct Params {
    size: vec2<u32>,
    _pad: vec2<u32>,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var<storage, read_write> counters: array<atomic<u32>>;
@group(0) @binding(2) var<uniform> params: Params;

var<workgroup> local_bins: array<atomic<u32>, 1024>;

fn bins_of(px: vec4<f32>) -> vec4<u32> {
    let q = vec3<u32>(round(clamp(px.rgb, vec3<f32>(0.0), vec3<f32>(1.0)) * 255.0));
    let l = (54u * q.x + 183u * q.y + 19u * q.z + 128u) >> 8u;
    return vec4<u32>(q.x, 256u + q.y, 512u + q.z, 768u + l);
}

fn clear_local(li: u32) {
    for (var i = li; i < 1024u; i += 256u) {
        atomicStore(&local_bins[i], 0u);
    }
}

fn flush_local(li: u32) {
    for (var i = li; i < 1024u; i += 256u) {
        let v = atomicLoad(&local_bins[i]);
        if v > 0u {
            atomicAdd(&counters[i], v);
        }
    }
}
"#;

const HISTOGRAM_STANDARD_MAIN: &str = r#"
@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(local_invocation_index) li: u32) {
    clear_local(li);
    workgroupBarrier();

    if id.x < params.size.x && id.y < params.size.y {
        let b = bins_of(textureLoad(src, id.xy, 0));
        atomicAdd(&local_bins[b.x], 1u);
        atomicAdd(&local_bins[b.y], 1u);
        atomicAdd(&local_bins[b.z], 1u);
        atomicAdd(&local_bins[b.w], 1u);
    }

    workgroupBarrier();
    flush_local(li);
}
"#;

const HISTOGRAM_SUBGROUP_MAIN: &str = r#"
const NONE: u32 = 0xffffffffu;

@compute @workgroup_size(256)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
    @builtin(local_invocation_index) li: u32,
) {
    clear_local(li);
    workgroupBarrier();

    let index = (wg.y * groups.x + wg.x) * 256u + li;
    let active = index < params.size.x * params.size.y;
    var bins = vec4<u32>(NONE);
    if active {
        let coord = vec2<u32>(index % params.size.x, index / params.size.x);
        bins = bins_of(textureLoad(src, coord, 0));
    }

    // Peel off the lowest pending bin per iteration: one local atomic per
    // distinct bin in the subgroup instead of one per lane.
    for (var ch = 0u; ch < 4u; ch++) {
        let mine = bins[ch];
        var pending = active;
        loop {
            let lowest = subgroupMin(select(NONE, mine, pending));
            if lowest == NONE { break; }
            let hit = pending && mine == lowest;
            let count = subgroupAdd(select(0u, 1u, hit));
            if hit { pending = false; }
            if subgroupElect() {
                atomicAdd(&local_bins[lowest], count);
            }
        }
    }

    workgroupBarrier();
    flush_local(li);
}
"#;

fn uber_main(variant: PipelineVariant) -> String {
    let adjust = if variant.has_adjustments() { "rgb = adjust(rgb, params.adjust);" } else { "" };
    let lut = if variant.has_tone_curve() { "rgb = apply_lut(rgb);" } else { "" };
    format!(
        r#"
@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {{
    if id.x >= params.size.x || id.y >= params.size.y {{ return; }}
    let px = textureLoad(src, id.xy, 0);
    var rgb = px.rgb;
    {adjust}
    {lut}
    textureStore(dst, id.xy, vec4<f32>(rgb, px.a));
}}
"#
    )
}

fn uber(variant: PipelineVariant) -> String {
    let mut src = String::new();
    if variant.is_half_precision() {
        src.push_str("enable f16;\n");
    }
    src.push_str(ADJUST_COMMON);
    if variant.has_adjustments() {
        src.push_str(if variant.is_half_precision() { ADJUST_F16 } else { ADJUST_F32 });
    }
    src.push_str(ADJUST_BINDINGS);
    if variant.has_tone_curve() {
        src.push_str(LUT_BINDING);
    }
    src.push_str(&uber_main(variant));
    src
}

/// WGSL source for a kernel.
pub fn source(id: KernelId) -> String {
    match id {
        KernelId::Downsample => DOWNSAMPLE.to_string(),
        KernelId::Rotation => ROTATION.to_string(),
        KernelId::Adjustments => uber(PipelineVariant::Adjustments),
        KernelId::ToneCurve => TONE_CURVE.to_string(),
        KernelId::Masks => [ADJUST_COMMON, ADJUST_F32, MASKS_MAIN].concat(),
        KernelId::Uber(variant) => uber(variant),
        KernelId::Histogram(HistogramStrategy::Standard) => [HISTOGRAM_COMMON, HISTOGRAM_STANDARD_MAIN].concat(),
        KernelId::Histogram(HistogramStrategy::Subgroup) => [HISTOGRAM_COMMON, HISTOGRAM_SUBGROUP_MAIN].concat(),
    }
}
