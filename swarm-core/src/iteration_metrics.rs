use std::time::Duration;

use swarm_metrics::{MetricId, MetricKind, Registry, TagSet};

use crate::Result;
use crate::request_metrics::millis;

pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATIONS_FAILED: &str = "iterations_failed";
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

#[derive(Debug, Clone, Copy)]
pub struct IterationMetricIds {
    /// Iterations that ran to completion (successfully or with an error).
    pub iterations: MetricId,
    /// Iteration duration in milliseconds.
    pub iteration_duration: MetricId,
    pub iterations_failed: MetricId,
    pub dropped_iterations: MetricId,
    pub vus: MetricId,
    pub vus_max: MetricId,
}

impl IterationMetricIds {
    pub fn register(metrics: &Registry) -> Result<Self> {
        Ok(Self {
            iterations: metrics.register(ITERATIONS, MetricKind::Counter)?,
            iteration_duration: metrics.register(ITERATION_DURATION, MetricKind::Trend)?,
            iterations_failed: metrics.register(ITERATIONS_FAILED, MetricKind::Counter)?,
            dropped_iterations: metrics.register(DROPPED_ITERATIONS, MetricKind::Counter)?,
            vus: metrics.register(VUS, MetricKind::Gauge)?,
            vus_max: metrics.register(VUS_MAX, MetricKind::Gauge)?,
        })
    }

    /// Records one non-interrupted iteration.
    pub fn record_iteration(
        &self,
        metrics: &Registry,
        tags: &TagSet,
        duration: Duration,
        success: bool,
    ) {
        add(metrics, self.iterations, tags, 1.0);
        add(metrics, self.iteration_duration, tags, millis(duration));
        if !success {
            add(metrics, self.iterations_failed, tags, 1.0);
        }
    }

    pub fn record_dropped(&self, metrics: &Registry, tags: &TagSet, count: u64) {
        add(metrics, self.dropped_iterations, tags, count as f64);
    }

    pub fn sample_vus(&self, metrics: &Registry, active: u64, max: u64) {
        let tags = TagSet::default();
        add(metrics, self.vus, &tags, active as f64);
        add(metrics, self.vus_max, &tags, max as f64);
    }
}

fn add(metrics: &Registry, id: MetricId, tags: &TagSet, value: f64) {
    if let Some(h) = metrics.handle(id, tags.clone()) {
        h.add(value);
    }
}
