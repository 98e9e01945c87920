//! GPU pass timing from timestamp queries.
//!
//! Each timed pass gets a begin/end query pair written by the device. The
//! helper is only constructed when the device supports timestamp queries.

use tracing::trace;

use crate::backend::{BufferDesc, BufferKind, GpuPrimitives, TimestampWrites};
use crate::GpuResult;

/// Maximum timed passes per frame.
pub const MAX_TIMED_PASSES: u32 = 16;

/// GPU execution time of each pass in one frame, in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuTimings {
    passes: Vec<(&'static str, u64)>,
}

impl GpuTimings {
    /// Nanoseconds for a pass label, summed if the label repeats.
    pub fn get(&self, label: &str) -> Option<u64> {
        let mut hits = self.passes.iter().filter(|(l, _)| *l == label).peekable();
        hits.peek()?;
        Some(hits.map(|(_, ns)| ns).sum())
    }

    /// Sum over all passes.
    pub fn total_ns(&self) -> u64 {
        self.passes.iter().map(|(_, ns)| ns).sum()
    }

    /// Passes in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.passes.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// Query set plus resolve buffer for one frame of timed passes.
pub struct TimingHelper<G: GpuPrimitives> {
    query_set: G::QuerySet,
    resolve: G::Buffer,
    labels: Vec<&'static str>,
    period_ns: f64,
}

impl<G: GpuPrimitives> TimingHelper<G> {
    /// Helper for `device`, or `None` without timestamp support.
    pub fn new(device: &G) -> GpuResult<Option<Self>> {
        if !device.capabilities().supports_timing() {
            return Ok(None);
        }
        let slots = MAX_TIMED_PASSES * 2;
        let query_set = device.create_query_set(slots)?;
        let resolve = device.create_buffer(&BufferDesc {
            label: "timestamp_resolve",
            size: slots as u64 * 8,
            kind: BufferKind::QueryResolve,
        })?;
        Ok(Some(Self {
            query_set,
            resolve,
            labels: Vec::with_capacity(MAX_TIMED_PASSES as usize),
            period_ns: device.timestamp_period() as f64,
        }))
    }

    /// Forget the previous frame's passes.
    pub fn begin_frame(&mut self) {
        self.labels.clear();
    }

    /// Query slots for the next pass; `None` once the frame is full.
    pub fn next_writes(&mut self, label: &'static str) -> Option<TimestampWrites<'_, G>> {
        let index = self.labels.len() as u32;
        if index >= MAX_TIMED_PASSES {
            return None;
        }
        self.labels.push(label);
        Some(TimestampWrites {
            query_set: &self.query_set,
            begin: index * 2,
            end: index * 2 + 1,
        })
    }

    /// Record resolving this frame's queries.
    pub fn resolve(&self, device: &G, encoder: &mut G::Encoder) {
        if !self.labels.is_empty() {
            device.encode_resolve_queries(encoder, &self.query_set, self.labels.len() as u32 * 2, &self.resolve);
        }
    }

    /// Read the resolved timestamps. Blocks until the frame finishes.
    pub fn collect(&self, device: &G) -> GpuResult<Option<GpuTimings>> {
        if self.labels.is_empty() {
            return Ok(None);
        }
        let bytes = device.read_buffer(&self.resolve)?;
        let ticks: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        let passes = self
            .labels
            .iter()
            .zip(ticks.chunks_exact(2))
            .map(|(label, pair)| {
                let ns = (pair[1].saturating_sub(pair[0]) as f64 * self.period_ns).round() as u64;
                trace!(pass = label, ns, "gpu pass time");
                (*label, ns)
            })
            .collect();
        Ok(Some(GpuTimings { passes }))
    }

    /// Free the resolve buffer.
    pub fn destroy(&self, device: &G) {
        device.destroy_buffer(&self.resolve);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuPrimitives;
    use crate::capabilities::FeatureSet;

    #[test]
    fn test_absent_without_timestamp_feature() {
        let device = CpuPrimitives::new().with_features(FeatureSet {
            timestamp_query: false,
            ..FeatureSet::default()
        });
        assert!(TimingHelper::new(&device).unwrap().is_none());
    }

    #[test]
    fn test_frame_capacity() {
        let device = CpuPrimitives::new();
        let mut helper = TimingHelper::new(&device).unwrap().unwrap();
        for _ in 0..MAX_TIMED_PASSES {
            assert!(helper.next_writes("pass").is_some());
        }
        assert!(helper.next_writes("overflow").is_none());
        helper.begin_frame();
        assert!(helper.next_writes("pass").is_some());
    }

    #[test]
    fn test_get_sums_repeats() {
        let timings = GpuTimings {
            passes: vec![("a", 5), ("b", 7), ("a", 3)],
        };
        assert_eq!(timings.get("a"), Some(8));
        assert_eq!(timings.get("c"), None);
        assert_eq!(timings.total_ns(), 15);
    }
}
