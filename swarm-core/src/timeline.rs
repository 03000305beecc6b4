use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Iteration outcomes within one second of run time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineBucket {
    /// Whole seconds since the run started.
    pub second: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Per-second counts of successful and failed iterations.
#[derive(Debug, Default)]
pub struct IterationTimeline {
    started: OnceLock<Instant>,
    buckets: Mutex<Vec<TimelineBucket>>,
}

impl IterationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchors second `0`. Later calls are ignored.
    pub fn start(&self, at: Instant) {
        let _ = self.started.set(at);
    }

    pub fn record(&self, success: bool) {
        self.record_at(Instant::now(), success);
    }

    pub fn record_at(&self, at: Instant, success: bool) {
        let second = self
            .started
            .get()
            .map_or(0, |started| at.saturating_duration_since(*started).as_secs());
        let idx = usize::try_from(second).unwrap_or(usize::MAX);

        let mut buckets = self.buckets.lock();
        if buckets.len() <= idx {
            let from = buckets.len() as u64;
            buckets.extend((from..=second).map(|second| TimelineBucket {
                second,
                ..TimelineBucket::default()
            }));
        }
        if let Some(b) = buckets.get_mut(idx) {
            if success {
                b.successful += 1;
            } else {
                b.failed += 1;
            }
        }
    }

    pub fn buckets(&self) -> Vec<TimelineBucket> {
        self.buckets.lock().clone()
    }
}
