use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scan,
    CacheRead,
    JandexRead,
    ExternalRead,
    CacheWrite,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Scan,
        Phase::CacheRead,
        Phase::JandexRead,
        Phase::ExternalRead,
        Phase::CacheWrite,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    pub sources: u64,
    pub elapsed_ms: u64,
    pub classes: u64,
}

/// Per-phase counters, safe to update from worker threads.
#[derive(Debug, Default)]
pub struct TimingData {
    phases: Mutex<BTreeMap<Phase, PhaseTiming>>,
}

impl TimingData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, phase: Phase, sources: u64, elapsed: Duration, classes: u64) {
        let mut phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        let entry = phases.entry(phase).or_default();
        entry.sources += sources;
        entry.elapsed_ms += elapsed.as_millis() as u64;
        entry.classes += classes;
    }

    /// Adds every counter of `other` into this one.
    pub fn absorb(&self, other: &TimingData) {
        let theirs = other.snapshot();
        let mut phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        for (phase, timing) in theirs {
            if timing == PhaseTiming::default() {
                continue;
            }
            let entry = phases.entry(phase).or_default();
            entry.sources += timing.sources;
            entry.elapsed_ms += timing.elapsed_ms;
            entry.classes += timing.classes;
        }
    }

    pub fn get(&self, phase: Phase) -> PhaseTiming {
        let phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        phases.get(&phase).copied().unwrap_or_default()
    }

    /// Every phase, including those never entered.
    pub fn snapshot(&self) -> BTreeMap<Phase, PhaseTiming> {
        Phase::ALL.into_iter().map(|p| (p, self.get(p))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_per_phase() {
        let timing = TimingData::new();
        timing.add(Phase::Scan, 1, Duration::from_millis(5), 10);
        timing.add(Phase::Scan, 2, Duration::from_millis(7), 3);
        timing.add(Phase::CacheWrite, 4, Duration::ZERO, 13);

        assert_eq!(
            timing.get(Phase::Scan),
            PhaseTiming {
                sources: 3,
                elapsed_ms: 12,
                classes: 13
            }
        );
        let snapshot = timing.snapshot();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot[&Phase::JandexRead], PhaseTiming::default());

        let total = TimingData::new();
        total.absorb(&timing);
        total.absorb(&timing);
        assert_eq!(total.get(Phase::CacheWrite).classes, 26);
    }
}
