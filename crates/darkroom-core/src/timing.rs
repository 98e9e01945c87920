//! Per-stage wall-clock timings reported with every render.

use std::collections::BTreeMap;
use std::fmt;

/// A named pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Box-filter downsample for draft renders.
    Downsample,
    /// CPU to GPU transfer.
    Upload,
    /// Rotation pass.
    Rotation,
    /// Adjustments pass (or the fused uber pass).
    Adjustments,
    /// Tone-curve pass.
    ToneCurve,
    /// Mask compositing pass.
    Masks,
    /// Histogram and clipping analysis.
    Analysis,
    /// GPU to CPU transfer.
    Readback,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 8] = [
        Stage::Downsample,
        Stage::Upload,
        Stage::Rotation,
        Stage::Adjustments,
        Stage::ToneCurve,
        Stage::Masks,
        Stage::Analysis,
        Stage::Readback,
    ];

    /// Timing-map key.
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Downsample => "downsample",
            Stage::Upload => "upload",
            Stage::Rotation => "rotation",
            Stage::Adjustments => "adjustments",
            Stage::ToneCurve => "toneCurve",
            Stage::Masks => "masks",
            Stage::Analysis => "analysis",
            Stage::Readback => "readback",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Milliseconds spent per stage plus the end-to-end total.
///
/// Every stage always has an entry; skipped stages read 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StageTimings {
    stages: [f64; Stage::ALL.len()],
    total: f64,
}

impl StageTimings {
    /// Key of the end-to-end entry in [`Self::as_map`].
    pub const TOTAL: &'static str = "total";

    /// All zeros.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `ms` to a stage.
    pub fn record(&mut self, stage: Stage, ms: f64) {
        self.stages[stage.index()] += ms.max(0.0);
    }

    /// Milliseconds recorded for a stage.
    pub fn get(&self, stage: Stage) -> f64 {
        self.stages[stage.index()]
    }

    /// End-to-end milliseconds.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Sets the measured end-to-end time.
    pub fn set_total(&mut self, ms: f64) {
        self.total = ms.max(0.0);
    }

    /// Sum of every stage entry.
    pub fn sum_of_stages(&self) -> f64 {
        self.stages.iter().sum()
    }

    /// `(stage, ms)` pairs in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (Stage, f64)> + '_ {
        Stage::ALL.iter().map(|s| (*s, self.get(*s)))
    }

    /// Name-keyed map including `total`.
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        let mut map: BTreeMap<_, _> = self.iter().map(|(s, ms)| (s.name(), ms)).collect();
        map.insert(Self::TOTAL, self.total);
        map
    }
}

impl fmt::Display for StageTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (stage, ms) in self.iter() {
            write!(f, "{stage}={ms:.2}ms ")?;
        }
        write!(f, "total={:.2}ms", self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_has_every_key() {
        let t = StageTimings::new();
        let map = t.as_map();
        for key in [
            "downsample",
            "upload",
            "rotation",
            "adjustments",
            "toneCurve",
            "masks",
            "readback",
            "total",
        ] {
            assert_eq!(map.get(key), Some(&0.0), "missing {key}");
        }
    }

    #[test]
    fn total_is_stored_as_measured() {
        let mut t = StageTimings::new();
        t.record(Stage::Upload, 2.0);
        t.record(Stage::Readback, 3.0);
        t.set_total(1.0);
        assert_eq!(t.total(), 1.0);
        assert_eq!(t.sum_of_stages(), 5.0);
        t.set_total(10.0);
        assert_eq!(t.total(), 10.0);
    }

    #[test]
    fn negative_durations_clamped() {
        let mut t = StageTimings::new();
        t.record(Stage::Masks, -1.0);
        assert_eq!(t.get(Stage::Masks), 0.0);
    }
}
