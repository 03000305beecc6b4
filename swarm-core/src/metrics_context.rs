use std::sync::Arc;

use swarm_metrics::{Registry, TagSet};

use crate::Result;
use crate::check::CheckMetricIds;
use crate::iteration_metrics::IterationMetricIds;
use crate::request_metrics::RequestMetricIds;

/// Tag keys the engine owns. Scenario-level tags cannot override them.
pub const RESERVED_TAGS: &[&str] = &["scenario", "group"];

/// Base tags shared by every sample a VU emits: the scenario name and its tags.
///
/// Setup and teardown run outside any scenario and carry no `scenario` tag.
#[derive(Debug, Clone, Default)]
pub struct MetricsContext {
    scenario: Option<Arc<str>>,
    scenario_tags: Arc<[(String, String)]>,
}

impl MetricsContext {
    #[must_use]
    pub fn new(scenario: Arc<str>, scenario_tags: Arc<[(String, String)]>) -> Self {
        Self {
            scenario: Some(scenario),
            scenario_tags,
        }
    }

    /// Context for code running outside a scenario.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scenario(&self) -> Option<&str> {
        self.scenario.as_deref()
    }

    #[must_use]
    pub fn scenario_tags(&self) -> &[(String, String)] {
        self.scenario_tags.as_ref()
    }

    /// Resolves the full tag set for one sample.
    ///
    /// Order of precedence, lowest first: scenario-level tags, `scenario`, `group`, `extra`.
    /// Reserved keys in `extra` are skipped.
    pub fn tags(&self, registry: &Registry, group: &str, extra: &[(&str, &str)]) -> TagSet {
        let mut merged: Vec<(&str, &str)> =
            Vec::with_capacity(self.scenario_tags.len() + extra.len() + 2);
        merged.extend(
            self.scenario_tags
                .iter()
                .filter(|(k, _)| !RESERVED_TAGS.contains(&k.as_str()))
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if let Some(scenario) = self.scenario() {
            merged.push(("scenario", scenario));
        }
        merged.push(("group", group));
        merged.extend(
            extra
                .iter()
                .copied()
                .filter(|(k, _)| !RESERVED_TAGS.contains(k)),
        );
        registry.resolve_tags(merged)
    }
}

/// Ids of every metric the engine emits on its own.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinMetrics {
    pub request: RequestMetricIds,
    pub iteration: IterationMetricIds,
    pub check: CheckMetricIds,
}

impl BuiltinMetrics {
    pub fn register(metrics: &Registry) -> Result<Self> {
        Ok(Self {
            request: RequestMetricIds::register(metrics)?,
            iteration: IterationMetricIds::register(metrics)?,
            check: CheckMetricIds::register(metrics)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_cannot_be_overridden() {
        let reg = Registry::new();
        let ctx = MetricsContext::new(
            Arc::from("api"),
            Arc::from(vec![
                ("scenario".to_string(), "spoofed".to_string()),
                ("team".to_string(), "web".to_string()),
            ]),
        );
        let tags = ctx.tags(&reg, "::login", &[("group", "x"), ("team", "core"), ("method", "GET")]);
        let strings = reg.tags_to_strings(&tags);
        let get = |k: &str| {
            strings
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("scenario"), Some("api"));
        assert_eq!(get("group"), Some("::login"));
        assert_eq!(get("team"), Some("core"));
        assert_eq!(get("method"), Some("GET"));
    }

    #[test]
    fn detached_context_has_no_scenario_tag() {
        let reg = Registry::new();
        let tags = MetricsContext::detached().tags(&reg, "::setup", &[]);
        let strings = reg.tags_to_strings(&tags);
        assert_eq!(strings, vec![("group".to_string(), "::setup".to_string())]);
    }
}
