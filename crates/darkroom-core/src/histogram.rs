//! Four-channel 256-bin histograms and the clipping analysis derived from them.

use rayon::prelude::*;

/// Number of bins per channel.
pub const BINS: usize = 256;

/// Counter words in a packed histogram (R, G, B, luminance).
pub const COUNTER_WORDS: usize = BINS * 4;

/// Integer Rec. 709 luminance weights, summing to 256.
pub const LUMA_WEIGHTS: [u32; 3] = [54, 183, 19];

/// Luminance bin of an 8-bit RGB pixel.
///
/// Uses integer weights so that every backend lands in the same bin.
#[inline]
pub fn luminance_bin(r: u8, g: u8, b: u8) -> u8 {
    let sum = LUMA_WEIGHTS[0] * r as u32 + LUMA_WEIGHTS[1] * g as u32 + LUMA_WEIGHTS[2] * b as u32;
    ((sum + 128) >> 8).min(255) as u8
}

/// Per-channel histograms of one image.
///
/// Each pixel contributes one count to the red, green, blue and luminance
/// histograms, so every channel sums to the pixel count.
#[derive(Clone, PartialEq, Eq)]
pub struct HistogramResult {
    /// Red channel bins.
    pub red: [u32; BINS],
    /// Green channel bins.
    pub green: [u32; BINS],
    /// Blue channel bins.
    pub blue: [u32; BINS],
    /// Luminance bins.
    pub luminance: [u32; BINS],
}

impl HistogramResult {
    /// All-zero histogram.
    pub fn empty() -> Self {
        Self {
            red: [0; BINS],
            green: [0; BINS],
            blue: [0; BINS],
            luminance: [0; BINS],
        }
    }

    /// Unpacks the counter layout written by the histogram kernels:
    /// red bins, then green, blue and luminance.
    ///
    /// Returns `None` if `words` is shorter than [`COUNTER_WORDS`].
    pub fn from_counters(words: &[u32]) -> Option<Self> {
        if words.len() < COUNTER_WORDS {
            return None;
        }
        let mut out = Self::empty();
        out.red.copy_from_slice(&words[0..BINS]);
        out.green.copy_from_slice(&words[BINS..2 * BINS]);
        out.blue.copy_from_slice(&words[2 * BINS..3 * BINS]);
        out.luminance.copy_from_slice(&words[3 * BINS..4 * BINS]);
        Some(out)
    }

    /// Decodes little-endian counter bytes as read back from the GPU.
    pub fn from_counter_bytes(bytes: &[u8]) -> Option<Self> {
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::from_counters(&words)
    }

    /// Reference computation over packed RGBA bytes.
    pub fn from_rgba(rgba: &[u8]) -> Self {
        rgba.par_chunks_exact(4)
            .fold(Self::empty, |mut acc, px| {
                acc.record(px[0], px[1], px[2]);
                acc
            })
            .reduce(Self::empty, |mut a, b| {
                a.merge(&b);
                a
            })
    }

    /// Counts one pixel.
    #[inline]
    pub fn record(&mut self, r: u8, g: u8, b: u8) {
        self.red[r as usize] += 1;
        self.green[g as usize] += 1;
        self.blue[b as usize] += 1;
        self.luminance[luminance_bin(r, g, b) as usize] += 1;
    }

    /// Adds another histogram's counts into this one.
    pub fn merge(&mut self, other: &Self) {
        for (dst, src) in self.channels_mut().into_iter().zip(other.channels()) {
            dst.iter_mut().zip(src.iter()).for_each(|(d, s)| *d += s);
        }
    }

    /// Channels in counter order.
    pub fn channels(&self) -> [&[u32; BINS]; 4] {
        [&self.red, &self.green, &self.blue, &self.luminance]
    }

    fn channels_mut(&mut self) -> [&mut [u32; BINS]; 4] {
        [&mut self.red, &mut self.green, &mut self.blue, &mut self.luminance]
    }

    /// Per-channel totals (R, G, B, luminance).
    pub fn totals(&self) -> [u64; 4] {
        self.channels().map(|c| c.iter().map(|v| *v as u64).sum())
    }

    /// Number of pixels counted, or `None` if the channels disagree.
    pub fn pixel_count(&self) -> Option<u64> {
        let [r, g, b, l] = self.totals();
        (r == g && g == b && b == l).then_some(r)
    }

    /// Shadow and highlight clipping derived from the extreme bins.
    pub fn clipping(&self) -> ClippingStats {
        let total = self.totals()[3].max(1) as f64;
        let shadows = [self.red[0], self.green[0], self.blue[0]];
        let highlights = [self.red[BINS - 1], self.green[BINS - 1], self.blue[BINS - 1]];
        ClippingStats {
            shadows: shadows.map(|c| (c as f64 / total) as f32),
            highlights: highlights.map(|c| (c as f64 / total) as f32),
            luminance_shadows: (self.luminance[0] as f64 / total) as f32,
            luminance_highlights: (self.luminance[BINS - 1] as f64 / total) as f32,
        }
    }
}

impl Default for HistogramResult {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for HistogramResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramResult")
            .field("totals", &self.totals())
            .finish()
    }
}

/// Fraction of pixels sitting in the extreme bins.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClippingStats {
    /// Fraction at level 0 per R, G, B.
    pub shadows: [f32; 3],
    /// Fraction at level 255 per R, G, B.
    pub highlights: [f32; 3],
    /// Fraction of pixels whose luminance is 0.
    pub luminance_shadows: f32,
    /// Fraction of pixels whose luminance is 255.
    pub luminance_highlights: f32,
}

impl ClippingStats {
    /// True when any channel has pixels at 255.
    pub fn any_highlights(&self) -> bool {
        self.highlights.iter().any(|v| *v > 0.0)
    }

    /// True when any channel has pixels at 0.
    pub fn any_shadows(&self) -> bool {
        self.shadows.iter().any(|v| *v > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gray_luminance_is_exact() {
        for v in [0u8, 1, 64, 128, 200, 255] {
            assert_eq!(luminance_bin(v, v, v), v);
        }
    }

    #[test]
    fn uniform_gray_image() {
        let rgba: Vec<u8> = [128, 128, 128, 255].repeat(64 * 64);
        let h = HistogramResult::from_rgba(&rgba);
        for channel in h.channels() {
            assert_eq!(channel[128], 4096);
            assert_eq!(channel.iter().sum::<u32>(), 4096);
        }
        assert_eq!(h.pixel_count(), Some(4096));
    }

    #[test]
    fn counters_roundtrip_layout() {
        let mut words = vec![0u32; COUNTER_WORDS];
        words[3] = 7;
        words[BINS + 4] = 8;
        words[3 * BINS + 255] = 9;
        let h = HistogramResult::from_counters(&words).unwrap();
        assert_eq!(h.red[3], 7);
        assert_eq!(h.green[4], 8);
        assert_eq!(h.luminance[255], 9);
        assert!(HistogramResult::from_counters(&words[..10]).is_none());
    }

    #[test]
    fn clipping_fractions() {
        let mut h = HistogramResult::empty();
        h.record(255, 255, 255);
        h.record(0, 0, 0);
        h.record(128, 128, 128);
        h.record(255, 10, 10);
        let clip = h.clipping();
        assert_relative_eq!(clip.highlights[0], 0.5);
        assert_relative_eq!(clip.shadows[1], 0.25);
        assert_relative_eq!(clip.luminance_highlights, 0.25);
        assert!(clip.any_highlights() && clip.any_shadows());
    }
}
