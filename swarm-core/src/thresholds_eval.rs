use std::time::Duration;

use swarm_metrics::{Aggregate, Registry};

use crate::thresholds::{ThresholdAgg, ThresholdExpr, ThresholdOp, ThresholdSet};

/// Result of one threshold expression at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdOutcome {
    /// The threshold key, e.g. `http_req_duration{scenario:api}`.
    pub key: String,
    pub metric: String,
    pub expression: String,
    /// `None` when the aggregate could not be computed (no samples, unknown metric).
    pub observed: Option<f64>,
    pub passed: bool,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

impl ThresholdOutcome {
    /// Whether this failure should stop the run at `elapsed`.
    pub fn should_abort(&self, elapsed: Duration) -> bool {
        !self.passed
            && self.abort_on_fail
            && self.delay_abort_eval.is_none_or(|delay| elapsed >= delay)
    }
}

/// Evaluates every expression against the metrics recorded so far.
///
/// `elapsed` is the run time used for per-second counter rates.
pub fn evaluate_thresholds(
    metrics: &Registry,
    sets: &[ThresholdSet],
    elapsed: Duration,
) -> Vec<ThresholdOutcome> {
    let mut out = Vec::new();

    for set in sets {
        // Missing metric => every expression fails.
        let aggregate = metrics.lookup(&set.metric).and_then(|info| {
            set.filters
                .iter()
                .fold(metrics.query(info.id), |q, f| q.filter(f))
                .aggregate()
        });

        for expr in &set.expressions {
            let observed = aggregate
                .as_ref()
                .and_then(|agg| observed_value(agg, expr.agg, elapsed));
            out.push(outcome(set, expr, observed));
        }
    }

    out
}

fn outcome(set: &ThresholdSet, expr: &ThresholdExpr, observed: Option<f64>) -> ThresholdOutcome {
    ThresholdOutcome {
        key: set.key.clone(),
        metric: set.metric.clone(),
        expression: expr.source.clone(),
        observed,
        passed: observed.is_some_and(|v| compare(v, expr.op, expr.value)),
        abort_on_fail: expr.abort_on_fail,
        delay_abort_eval: expr.delay_abort_eval,
    }
}

fn observed_value(agg: &Aggregate, wanted: ThresholdAgg, elapsed: Duration) -> Option<f64> {
    if !wanted.applies_to(agg.kind()) {
        return None;
    }

    match (agg, wanted) {
        (Aggregate::Counter { sum }, ThresholdAgg::Count) => Some(*sum),
        (Aggregate::Counter { sum }, ThresholdAgg::Rate) => {
            let secs = elapsed.as_secs_f64();
            Some(if secs > 0.0 { *sum / secs } else { 0.0 })
        }

        (Aggregate::Gauge(g), ThresholdAgg::Value) => g.map(|g| g.value),
        (Aggregate::Gauge(g), ThresholdAgg::Min) => g.map(|g| g.min),
        (Aggregate::Gauge(g), ThresholdAgg::Max) => g.map(|g| g.max),

        (Aggregate::Rate { .. }, ThresholdAgg::Rate) => agg.rate(),

        (Aggregate::Trend(t), ThresholdAgg::Avg) => t.avg(),
        (Aggregate::Trend(t), ThresholdAgg::Min) => t.min(),
        (Aggregate::Trend(t), ThresholdAgg::Max) => t.max(),
        (Aggregate::Trend(t), ThresholdAgg::Med) => t.med(),
        (Aggregate::Trend(t), ThresholdAgg::P(p)) => t.percentile(p),

        _ => None,
    }
}

fn compare(observed: f64, op: ThresholdOp, expected: f64) -> bool {
    match op {
        ThresholdOp::Lt => observed < expected,
        ThresholdOp::Lte => observed <= expected,
        ThresholdOp::Gt => observed > expected,
        ThresholdOp::Gte => observed >= expected,
        ThresholdOp::Eq | ThresholdOp::StrictEq => observed == expected,
        ThresholdOp::NotEq => observed != expected,
    }
}
