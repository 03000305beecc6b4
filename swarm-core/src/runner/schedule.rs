use std::time::Duration;

use crate::config::Stage;

/// Piecewise-linear target over a list of stages, starting from `start`.
#[derive(Debug, Clone)]
pub struct RampingSchedule {
    start: u64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl RampingSchedule {
    pub fn new(start: u64, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            stages,
            cumulative_ends,
        }
    }

    /// A schedule that holds `value` for `duration`.
    pub fn constant(value: u64, duration: Duration) -> Self {
        Self::new(
            value,
            vec![Stage {
                duration,
                target: value,
            }],
        )
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Highest target the schedule ever reaches.
    pub fn peak(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(0)
            .max(self.start)
    }

    /// Interpolated value at `elapsed`; the last target once every stage has passed.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        if self.stages.is_empty() || elapsed.is_zero() {
            return self.start as f64;
        }

        if elapsed >= self.total_duration() {
            return self.stages.last().map_or(self.start, |s| s.target) as f64;
        }

        // A stage owns the half-open interval (start, end]; at a boundary the earlier
        // stage's end target applies.
        let idx = match self.cumulative_ends.binary_search(&elapsed) {
            Ok(i) | Err(i) => i,
        };

        let stage_end = self.cumulative_ends[idx];
        let stage_start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };

        let start_target = if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        } as f64;
        let end_target = self.stages[idx].target as f64;

        let stage_duration = stage_end.saturating_sub(stage_start);
        if stage_duration.is_zero() {
            return end_target;
        }

        let frac = elapsed.saturating_sub(stage_start).as_secs_f64() / stage_duration.as_secs_f64();
        start_target + (end_target - start_target) * frac
    }

    /// Integer target at `elapsed`, rounded to the nearest whole number.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let v = self.value_at(elapsed).round();
        if v <= 0.0 { 0 } else { v as u64 }
    }
}
