//! Per-stage timing side-channel.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    FeatureExtraction,
    AppearanceDetect,
    DepthUpdate,
    ScaleUpdate,
    ModelUpdate,
    TrackDetect,
    PrimaryAssignment,
    Reacquisition,
    Spawn,
}

pub trait TimingObserver: Send + Sync {
    fn record(&self, stage: Stage, elapsed: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimings;

impl TimingObserver for NoopTimings {
    fn record(&self, _stage: Stage, _elapsed: Duration) {}
}

/// Accumulates total time and call count per stage.
#[derive(Debug, Default)]
pub struct TimingLog {
    stages: Mutex<BTreeMap<Stage, (Duration, u64)>>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, stage: Stage) -> Duration {
        self.snapshot().get(&stage).map(|e| e.0).unwrap_or_default()
    }

    pub fn count(&self, stage: Stage) -> u64 {
        self.snapshot().get(&stage).map(|e| e.1).unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<Stage, (Duration, u64)> {
        match self.stages.lock() {
            Ok(stages) => stages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TimingObserver for TimingLog {
    fn record(&self, stage: Stage, elapsed: Duration) {
        let mut stages = match self.stages.lock() {
            Ok(stages) => stages,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = stages.entry(stage).or_insert((Duration::ZERO, 0));
        entry.0 += elapsed;
        entry.1 += 1;
    }
}

/// Runs `f` and reports its wall time for `stage`.
pub fn timed<T, F: FnOnce() -> T>(observer: &dyn TimingObserver, stage: Stage, f: F) -> T {
    let start = Instant::now();
    let out = f();
    observer.record(stage, start.elapsed());
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_timing_log_accumulates() {
        let log = TimingLog::new();

        log.record(Stage::Spawn, Duration::from_millis(2));
        log.record(Stage::Spawn, Duration::from_millis(3));
        let v = timed(&log, Stage::ModelUpdate, || 7);

        assert_eq!(v, 7);
        assert_eq!(log.total(Stage::Spawn), Duration::from_millis(5));
        assert_eq!(log.count(Stage::Spawn), 2);
        assert_eq!(log.count(Stage::ModelUpdate), 1);
        assert_eq!(log.count(Stage::Reacquisition), 0);
    }
}
