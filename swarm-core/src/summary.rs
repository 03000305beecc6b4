use std::collections::BTreeMap;
use std::time::Duration;

use swarm_metrics::{MetricKind, MetricSeriesSummary, MetricValue, Registry};

use crate::check::CHECKS;
use crate::thresholds_eval::ThresholdOutcome;
use crate::timeline::TimelineBucket;

/// Untagged aggregate of every series of one metric.
#[derive(Debug, Clone)]
pub struct MetricSummary {
    pub name: String,
    pub kind: MetricKind,
    /// `None` for a gauge that was never set.
    pub value: Option<MetricValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub name: String,
    /// Group path the check ran in, empty at the root.
    pub group: String,
    pub passes: u64,
    pub fails: u64,
}

/// Everything a finished run reports.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub duration: Duration,
    /// Every tagged series.
    pub series: Vec<MetricSeriesSummary>,
    /// One merged value per registered metric.
    pub metrics: Vec<MetricSummary>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub checks: Vec<CheckSummary>,
    pub timeline: Vec<TimelineBucket>,
    /// Why the run stopped early, if it did.
    pub aborted: Option<String>,
    pub teardown_error: Option<String>,
}

impl RunSummary {
    pub(crate) fn collect(
        registry: &Registry,
        duration: Duration,
        thresholds: Vec<ThresholdOutcome>,
        timeline: Vec<TimelineBucket>,
        aborted: Option<String>,
        teardown_error: Option<String>,
    ) -> Self {
        let series = registry.summarize();
        let metrics = registry
            .metrics()
            .into_iter()
            .map(|info| MetricSummary {
                name: info.name.to_string(),
                kind: info.kind,
                value: registry
                    .query(info.id)
                    .aggregate()
                    .and_then(|agg| agg.value()),
            })
            .collect();
        let checks = roll_up_checks(&series);

        Self {
            duration,
            series,
            metrics,
            thresholds,
            checks,
            timeline,
            aborted,
            teardown_error,
        }
    }

    /// No threshold failed and teardown succeeded.
    pub fn passed(&self) -> bool {
        self.teardown_error.is_none() && self.thresholds.iter().all(|t| t.passed)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Sum of a counter, `0` when it has no samples or is not a counter.
    pub fn counter(&self, name: &str) -> f64 {
        match self.metric(name).and_then(|m| m.value.as_ref()) {
            Some(MetricValue::Counter { sum }) => *sum,
            _ => 0.0,
        }
    }

    /// Hit fraction of a rate metric. `None` without samples.
    pub fn rate(&self, name: &str) -> Option<f64> {
        self.metric(name)
            .and_then(|m| m.value.as_ref())
            .and_then(MetricValue::rate)
    }

    pub fn check(&self, name: &str) -> Option<&CheckSummary> {
        self.checks.iter().find(|c| c.name == name)
    }
}

fn roll_up_checks(series: &[MetricSeriesSummary]) -> Vec<CheckSummary> {
    let mut by_key: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
    for s in series.iter().filter(|s| s.name == CHECKS) {
        let MetricValue::Rate { total, hits } = s.values else {
            continue;
        };
        let Some(name) = s.tag("check") else {
            continue;
        };
        let group = s.tag("group").unwrap_or_default();
        let entry = by_key
            .entry((name.to_string(), group.to_string()))
            .or_default();
        entry.0 += hits;
        entry.1 += total - hits;
    }

    by_key
        .into_iter()
        .map(|((name, group), (passes, fails))| CheckSummary {
            name,
            group,
            passes,
            fails,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checks_roll_up_across_scenarios() {
        let reg = Registry::new();
        let id = reg
            .register(CHECKS, MetricKind::Rate)
            .unwrap_or_else(|e| panic!("{e}"));
        let write = |scenario: &str, group: &str, hit: bool| {
            let tags = reg.resolve_tags([
                ("scenario", scenario),
                ("group", group),
                ("check", "status is 200"),
            ]);
            if let Some(h) = reg.handle(id, tags) {
                h.add_bool(hit);
            }
        };
        write("a", "", true);
        write("b", "", false);
        write("a", "::login", true);

        let summary = RunSummary::collect(&reg, Duration::from_secs(1), Vec::new(), Vec::new(), None, None);
        assert_eq!(
            summary.checks,
            vec![
                CheckSummary {
                    name: "status is 200".to_string(),
                    group: String::new(),
                    passes: 1,
                    fails: 1,
                },
                CheckSummary {
                    name: "status is 200".to_string(),
                    group: "::login".to_string(),
                    passes: 1,
                    fails: 0,
                },
            ]
        );
        assert_eq!(summary.rate(CHECKS), Some(2.0 / 3.0));
        assert!(summary.passed());
    }

    #[test]
    fn teardown_error_fails_the_run() {
        let reg = Registry::new();
        let summary = RunSummary::collect(
            &reg,
            Duration::ZERO,
            Vec::new(),
            Vec::new(),
            None,
            Some("boom".to_string()),
        );
        assert!(!summary.passed());
        assert_eq!(summary.counter("iterations"), 0.0);
    }
}
