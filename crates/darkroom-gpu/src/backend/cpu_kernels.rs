//! Rust mirrors of the WGSL kernels, run by the CPU backend.
//!
//! Each function follows its shader line for line so both backends agree;
//! the box filter and the histograms are exact integer math on both.

use darkroom_core::{luminance_bin, luminance_rec709, BINS, COUNTER_WORDS};
use half::f16;
use rayon::prelude::*;

use super::PipelineVariant;
use crate::uniforms::{AdjustBlock, MaskRecord, RotationUniform, MASK_RADIAL};

/// Subgroup width emulated by the subgroup histogram.
pub(crate) const SUBGROUP_SIZE: usize = 32;

#[inline]
fn unorm(v: u8) -> f32 {
    v as f32 / 255.0
}

#[inline]
fn to_unorm8(x: f32) -> u8 {
    (x.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[inline]
fn smoothstep(e0: f32, e1: f32, x: f32) -> f32 {
    let t = ((x - e0) / (e1 - e0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[inline]
fn luma(c: [f32; 3]) -> f32 {
    luminance_rec709(c[0], c[1], c[2])
}

// =============================================================================
// Downsample
// =============================================================================

/// Box filter `w x h` to `nw x nh`. Output pixel (ox, oy) is the rounded
/// integer mean of source columns `[ox*w/nw, (ox+1)*w/nw)` and the matching
/// rows, per channel.
pub(crate) fn downsample_block(src: &[u8], channels: usize, w: u32, h: u32, nw: u32, nh: u32) -> Vec<u8> {
    let (w, h, nw, nh) = (w as u64, h as u64, nw as u64, nh as u64);
    let row_len = nw as usize * channels;
    let mut out = vec![0u8; row_len * nh as usize];
    out.par_chunks_mut(row_len).enumerate().for_each(|(oy, row)| {
        let oy = oy as u64;
        let y0 = oy * h / nh;
        let y1 = ((oy + 1) * h / nh).max(y0 + 1);
        for ox in 0..nw {
            let x0 = ox * w / nw;
            let x1 = ((ox + 1) * w / nw).max(x0 + 1);
            let mut sums = [0u64; 4];
            for y in y0..y1 {
                let line = (y * w) as usize * channels;
                for x in x0..x1 {
                    let px = line + x as usize * channels;
                    for (ch, sum) in sums.iter_mut().enumerate().take(channels) {
                        *sum += src[px + ch] as u64;
                    }
                }
            }
            let count = (x1 - x0) * (y1 - y0);
            let dst = ox as usize * channels;
            for ch in 0..channels {
                row[dst + ch] = ((sums[ch] + count / 2) / count).min(255) as u8;
            }
        }
    });
    out
}

// =============================================================================
// Rotation
// =============================================================================

pub(crate) fn rotate(src: &[u8], u: &RotationUniform) -> Vec<u8> {
    let [sw, sh] = u.src_size;
    let [dw, dh] = u.dst_size;
    let [c, s] = u.cos_sin;
    let (swf, shf) = (sw as f32, sh as f32);
    let max = [sw as i64 - 1, sh as i64 - 1];
    let fetch = |x: i64, y: i64| -> [f32; 4] {
        let i = (y.clamp(0, max[1]) as usize * sw as usize + x.clamp(0, max[0]) as usize) * 4;
        [unorm(src[i]), unorm(src[i + 1]), unorm(src[i + 2]), unorm(src[i + 3])]
    };

    let mut out = vec![0u8; dw as usize * dh as usize * 4];
    out.par_chunks_mut(dw as usize * 4).enumerate().for_each(|(y, row)| {
        for x in 0..dw as usize {
            let dx = x as f32 + 0.5 - dw as f32 * 0.5;
            let dy = y as f32 + 0.5 - dh as f32 * 0.5;
            let px = c * dx + s * dy + swf * 0.5;
            let py = -s * dx + c * dy + shf * 0.5;
            let dst = &mut row[x * 4..x * 4 + 4];
            if px < 0.0 || py < 0.0 || px > swf || py > shf {
                dst.fill(0);
                continue;
            }
            let (qx, qy) = (px - 0.5, py - 0.5);
            let (bx, by) = (qx.floor(), qy.floor());
            let (fx, fy) = (qx - bx, qy - by);
            let (ix, iy) = (bx as i64, by as i64);
            let a = fetch(ix, iy);
            let b = fetch(ix + 1, iy);
            let cc = fetch(ix, iy + 1);
            let d = fetch(ix + 1, iy + 1);
            for ch in 0..4 {
                let top = a[ch] + (b[ch] - a[ch]) * fx;
                let bottom = cc[ch] + (d[ch] - cc[ch]) * fx;
                dst[ch] = to_unorm8(top + (bottom - top) * fy);
            }
        }
    });
    out
}

// =============================================================================
// Adjustments
// =============================================================================

/// Full-precision adjustments chain on a normalized RGB triple.
pub(crate) fn adjust_pixel(rgb: [f32; 3], a: &AdjustBlock) -> [f32; 3] {
    let mut c = rgb;

    // temperature, tint
    let t = a.wb[0] / 100.0;
    c[0] *= 1.0 + 0.2 * t;
    c[2] *= 1.0 - 0.2 * t;
    c[1] *= 1.0 - 0.2 * (a.wb[1] / 100.0);

    // exposure, contrast
    let gain = a.wb[2].exp2();
    let k = 1.0 + a.wb[3] / 100.0;
    c = c.map(|v| (v * gain - 0.5) * k + 0.5);

    // highlights, shadows
    let lift = 0.25 * (a.tone[0] / 100.0) * smoothstep(0.5, 1.0, luma(c));
    c = c.map(|v| v + lift);
    let lift = 0.25 * (a.tone[1] / 100.0) * (1.0 - smoothstep(0.0, 0.5, luma(c)));
    c = c.map(|v| v + lift);

    // whites, blacks
    let white = 1.0 - 0.25 * (a.tone[2] / 100.0);
    let black = -0.25 * (a.tone[3] / 100.0);
    c = c.map(|v| (v / white - black) / (1.0 - black));

    // vibrance
    let l = luma(c);
    let sat = (c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])).clamp(0.0, 1.0);
    let vib = 1.0 + (a.color[0] / 100.0) * (1.0 - sat);
    c = c.map(|v| l + (v - l) * vib);

    // saturation
    let l = luma(c);
    let s = 1.0 + a.color[1] / 100.0;
    c.map(|v| (l + (v - l) * s).clamp(0.0, 1.0))
}

#[inline]
fn h(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}

/// Mixed-precision chain: white balance, exposure, contrast, white/black
/// points and the saturation scale round through f16; highlight/shadow
/// recovery, vibrance and every luminance stay f32.
pub(crate) fn adjust_pixel_f16(rgb: [f32; 3], a: &AdjustBlock) -> [f32; 3] {
    let mut c = rgb.map(h);

    let t = h(a.wb[0] / 100.0);
    c[0] = h(c[0] * h(1.0 + h(0.2 * t)));
    c[2] = h(c[2] * h(1.0 - h(0.2 * t)));
    c[1] = h(c[1] * h(1.0 - h(0.2 * h(a.wb[1] / 100.0))));

    let gain = h(a.wb[2].exp2());
    let k = h(1.0 + a.wb[3] / 100.0);
    c = c.map(|v| h(h(h(h(v * gain) - 0.5) * k) + 0.5));

    let lift = 0.25 * (a.tone[0] / 100.0) * smoothstep(0.5, 1.0, luma(c));
    c = c.map(|v| v + lift);
    let lift = 0.25 * (a.tone[1] / 100.0) * (1.0 - smoothstep(0.0, 0.5, luma(c)));
    c = c.map(|v| v + lift);

    let white = h(1.0 - 0.25 * (a.tone[2] / 100.0));
    let black = h(-0.25 * (a.tone[3] / 100.0));
    let range = h(1.0 - black);
    c = c.map(|v| h(h(h(h(v) / white) - black) / range));

    let l = luma(c);
    let sat = (c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])).clamp(0.0, 1.0);
    let vib = 1.0 + (a.color[0] / 100.0) * (1.0 - sat);
    c = c.map(|v| l + (v - l) * vib);

    let l = luma(c);
    let s = h(1.0 + a.color[1] / 100.0);
    c.map(|v| (l + h(h(v - l) * s)).clamp(0.0, 1.0))
}

fn map_pixels(src: &[u8], dst: &mut [u8], f: impl Fn(&[u8], &mut [u8]) + Sync) {
    dst.par_chunks_mut(4).zip(src.par_chunks(4)).for_each(|(out, px)| f(px, out));
}

fn apply_adjust(px: &[u8], a: &AdjustBlock, half: bool) -> [u8; 3] {
    let rgb = [unorm(px[0]), unorm(px[1]), unorm(px[2])];
    let c = if half { adjust_pixel_f16(rgb, a) } else { adjust_pixel(rgb, a) };
    c.map(to_unorm8)
}

pub(crate) fn adjust(src: &[u8], dst: &mut [u8], a: &AdjustBlock) {
    map_pixels(src, dst, |px, out| {
        out[..3].copy_from_slice(&apply_adjust(px, a, false));
        out[3] = px[3];
    });
}

pub(crate) fn tone_curve(src: &[u8], dst: &mut [u8], lut: &[u32]) {
    map_pixels(src, dst, |px, out| {
        for ch in 0..3 {
            out[ch] = lut[px[ch] as usize].min(255) as u8;
        }
        out[3] = px[3];
    });
}

/// Fused adjustments + tone curve. The adjusted value is quantized to
/// 8 bits before the lookup, so the result equals the two separate passes.
pub(crate) fn uber(src: &[u8], dst: &mut [u8], variant: PipelineVariant, a: &AdjustBlock, lut: Option<&[u32]>) {
    let half = variant.is_half_precision();
    map_pixels(src, dst, |px, out| {
        let mut rgb = [px[0], px[1], px[2]];
        if variant.has_adjustments() {
            rgb = apply_adjust(px, a, half);
        }
        if let Some(lut) = lut.filter(|_| variant.has_tone_curve()) {
            rgb = rgb.map(|v| lut[v as usize].min(255) as u8);
        }
        out[..3].copy_from_slice(&rgb);
        out[3] = px[3];
    });
}

// =============================================================================
// Masks
// =============================================================================

pub(crate) fn mask_weight(record: &MaskRecord, p: [f32; 2]) -> f32 {
    let g = record.geometry;
    let [kind, feather, opacity, invert] = record.shape;
    let mut w = if kind == MASK_RADIAL {
        let d = [(p[0] - g[0]) / g[2], (p[1] - g[1]) / g[3]];
        let r = (d[0] * d[0] + d[1] * d[1]).sqrt();
        if feather <= 0.0 {
            if r <= 1.0 { 1.0 } else { 0.0 }
        } else {
            1.0 - smoothstep(1.0 - feather, 1.0, r)
        }
    } else {
        let dir = [g[2] - g[0], g[3] - g[1]];
        let t = ((p[0] - g[0]) * dir[0] + (p[1] - g[1]) * dir[1]) / (dir[0] * dir[0] + dir[1] * dir[1]);
        (1.0 - t).clamp(0.0, 1.0)
    };
    if invert > 0.5 {
        w = 1.0 - w;
    }
    w * opacity
}

pub(crate) fn masks(src: &[u8], dst: &mut [u8], width: u32, height: u32, records: &[MaskRecord]) {
    let (wf, hf) = (width as f32, height as f32);
    dst.par_chunks_mut(width as usize * 4)
        .zip(src.par_chunks(width as usize * 4))
        .enumerate()
        .for_each(|(y, (out_row, in_row))| {
            for x in 0..width as usize {
                let p = [(x as f32 + 0.5) / wf, (y as f32 + 0.5) / hf];
                let px = &in_row[x * 4..x * 4 + 4];
                let mut acc = [unorm(px[0]), unorm(px[1]), unorm(px[2])];
                for record in records {
                    let w = mask_weight(record, p);
                    if w > 0.0 {
                        let adjusted = adjust_pixel(acc, &record.adjust);
                        for ch in 0..3 {
                            acc[ch] += (adjusted[ch] - acc[ch]) * w;
                        }
                    }
                }
                let out = &mut out_row[x * 4..x * 4 + 4];
                for ch in 0..3 {
                    out[ch] = to_unorm8(acc[ch]);
                }
                out[3] = px[3];
            }
        });
}

// =============================================================================
// Histogram
// =============================================================================

type Counters = Vec<u32>;

#[inline]
fn bins_of(px: &[u8]) -> [usize; 4] {
    [
        px[0] as usize,
        BINS + px[1] as usize,
        2 * BINS + px[2] as usize,
        3 * BINS + luminance_bin(px[0], px[1], px[2]) as usize,
    ]
}

fn sum_counters(parts: impl ParallelIterator<Item = Counters>) -> Counters {
    parts.reduce(
        || vec![0u32; COUNTER_WORDS],
        |mut a, b| {
            a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
            a
        },
    )
}

/// 16x16 tiles, each accumulating workgroup-local bins before one flush.
pub(crate) fn histogram_standard(src: &[u8], width: u32, height: u32) -> Counters {
    let tiles_x = width.div_ceil(16) as usize;
    let tiles_y = height.div_ceil(16) as usize;
    sum_counters((0..tiles_x * tiles_y).into_par_iter().map(|tile| {
        let mut local = vec![0u32; COUNTER_WORDS];
        let (tx, ty) = ((tile % tiles_x) * 16, (tile / tiles_x) * 16);
        for y in ty..(ty + 16).min(height as usize) {
            for x in tx..(tx + 16).min(width as usize) {
                let i = (y * width as usize + x) * 4;
                for bin in bins_of(&src[i..i + 4]) {
                    local[bin] += 1;
                }
            }
        }
        local
    }))
}

/// 256-pixel linear workgroups. Within each subgroup of 32 lanes the
/// lowest pending bin is peeled off and counted in one local add per
/// distinct bin, as the subgroup kernel does.
pub(crate) fn histogram_subgroup(src: &[u8], width: u32, height: u32) -> Counters {
    let pixels = width as usize * height as usize;
    let bytes = &src[..pixels * 4];
    sum_counters(bytes.par_chunks(256 * 4).map(|group| {
        let mut local = vec![0u32; COUNTER_WORDS];
        for lanes in group.chunks(SUBGROUP_SIZE * 4) {
            let bins: Vec<[usize; 4]> = lanes.chunks_exact(4).map(bins_of).collect();
            for channel in 0..4 {
                let mut pending: Vec<usize> = bins.iter().map(|b| b[channel]).collect();
                while let Some(&target) = pending.iter().min() {
                    let before = pending.len();
                    pending.retain(|b| *b != target);
                    local[target] += (before - pending.len()) as u32;
                }
            }
        }
        local
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use darkroom_core::HistogramResult;

    fn gradient(w: u32, h: u32) -> Vec<u8> {
        (0..w * h)
            .flat_map(|i| {
                let v = (i * 7 % 256) as u8;
                [v, v.wrapping_mul(3), 255 - v, 255]
            })
            .collect()
    }

    #[test]
    fn test_downsample_block_mean() {
        let src = [
            100, 50, 25, 200, 100, 75, //
            50, 150, 125, 150, 100, 175,
        ];
        assert_eq!(downsample_block(&src, 3, 2, 2, 1, 1), vec![125, 100, 100]);
    }

    #[test]
    fn test_downsample_rounds_half_up() {
        // (1 + 2) / 2 = 1.5 -> 2
        assert_eq!(downsample_block(&[1, 2], 1, 2, 1, 1, 1), vec![2]);
    }

    #[test]
    fn test_identity_adjust() {
        let block = AdjustBlock::default();
        for v in [0u8, 1, 77, 128, 254, 255] {
            let out = adjust_pixel([unorm(v); 3], &block).map(to_unorm8);
            assert_eq!(out, [v; 3]);
        }
    }

    #[test]
    fn test_exposure_doubles() {
        let block = AdjustBlock { wb: [0.0, 0.0, 1.0, 0.0], ..Default::default() };
        let out = adjust_pixel([0.25; 3], &block);
        assert!(out.iter().all(|v| (v - 0.5).abs() < 1e-5));
    }

    #[test]
    fn test_half_precision_close() {
        let block = AdjustBlock {
            wb: [20.0, -10.0, 0.5, 15.0],
            tone: [-30.0, 25.0, 10.0, -5.0],
            color: [20.0, 10.0, 0.0, 0.0],
        };
        for v in (0..=255u8).step_by(17) {
            let rgb = [unorm(v), unorm(v / 2), unorm(255 - v)];
            let full = adjust_pixel(rgb, &block).map(to_unorm8);
            let half = adjust_pixel_f16(rgb, &block).map(to_unorm8);
            for ch in 0..3 {
                assert!((full[ch] as i32 - half[ch] as i32).abs() <= 2, "{full:?} vs {half:?}");
            }
        }
    }

    #[test]
    fn test_histogram_strategies_agree() {
        let (w, h) = (37, 29);
        let src = gradient(w, h);
        let standard = histogram_standard(&src, w, h);
        let subgroup = histogram_subgroup(&src, w, h);
        assert_eq!(standard, subgroup);
        let reference = HistogramResult::from_rgba(&src);
        assert_eq!(HistogramResult::from_counters(&standard), Some(reference));
    }

    #[test]
    fn test_rotate_180_is_exact_flip() {
        let (w, h) = (4u32, 3u32);
        let src = gradient(w, h);
        let u = RotationUniform {
            src_size: [w, h],
            dst_size: [w, h],
            cos_sin: [-1.0, 0.0],
            _pad: [0.0; 2],
        };
        let out = rotate(&src, &u);
        for y in 0..h as usize {
            for x in 0..w as usize {
                let a = (y * w as usize + x) * 4;
                let b = ((h as usize - 1 - y) * w as usize + (w as usize - 1 - x)) * 4;
                assert_eq!(&out[a..a + 4], &src[b..b + 4]);
            }
        }
    }

    #[test]
    fn test_mask_weight_zero_outside_radial() {
        let record = MaskRecord {
            geometry: [0.5, 0.5, 0.1, 0.1],
            shape: [MASK_RADIAL, 0.0, 1.0, 0.0],
            adjust: AdjustBlock::default(),
        };
        assert_eq!(mask_weight(&record, [0.5, 0.5]), 1.0);
        assert_eq!(mask_weight(&record, [0.9, 0.9]), 0.0);
        let inverted = MaskRecord { shape: [MASK_RADIAL, 0.0, 1.0, 1.0], ..record };
        assert_eq!(mask_weight(&inverted, [0.9, 0.9]), 1.0);
    }
}
