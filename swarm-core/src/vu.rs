use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use swarm_http::HttpClient;
use swarm_metrics::{MetricId, MetricKind, Registry, Sample, TagSet};

use crate::ScriptError;
use crate::config::{DEFAULT_EXEC, ScenarioConfig, ScenarioExecutorKind};
use crate::http::Http;
use crate::metrics_context::{BuiltinMetrics, MetricsContext};
use crate::runner::RunControl;
use crate::timeline::IterationTimeline;

/// Separator between nested group names in a group path.
pub const GROUP_SEPARATOR: &str = "::";

/// What a script sees when building per-VU state.
#[derive(Debug, Clone)]
pub struct VuInitInfo {
    /// Unique across the run, starting at 1.
    pub id: u64,
    /// Unique within the scenario, starting at 1.
    pub id_in_scenario: u64,
    pub scenario: String,
    pub exec: String,
}

#[derive(Debug, Clone)]
pub struct ScenarioInfo {
    pub name: Arc<str>,
    pub exec: Arc<str>,
    pub executor: ScenarioExecutorKind,
    pub start_time: Duration,
}

impl ScenarioInfo {
    pub(crate) fn from_config(cfg: &ScenarioConfig) -> Self {
        Self {
            name: Arc::from(cfg.name()),
            exec: Arc::from(cfg.exec.as_str()),
            executor: cfg.executor.kind(),
            start_time: cfg.start_time,
        }
    }
}

/// Snapshot of where a VU is in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionInfo {
    /// `0` for setup and teardown.
    pub vu_id: u64,
    pub vu_id_in_scenario: u64,
    /// Iterations this VU has started, across its lifetime.
    pub iteration_in_instance: u64,
    /// Index of the current iteration among all iterations of the scenario.
    pub iteration_in_scenario: u64,
    pub scenario: Option<String>,
    pub executor: Option<ScenarioExecutorKind>,
}

/// Run-scoped state every VU context points at.
#[derive(Debug)]
pub(crate) struct RunShared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) builtin: BuiltinMetrics,
    /// Client for setup and teardown. VUs own their clients.
    pub(crate) client: HttpClient,
    pub(crate) control: Arc<RunControl>,
    pub(crate) timeline: IterationTimeline,
    /// VUs currently inside an iteration.
    pub(crate) active_vus: AtomicU64,
    /// Set once setup returns, before any iteration starts.
    pub(crate) setup_data: OnceLock<Option<Value>>,
    pub(crate) iteration_timeout: Option<Duration>,
}

impl RunShared {
    pub(crate) fn new(
        registry: Arc<Registry>,
        builtin: BuiltinMetrics,
        client: HttpClient,
        iteration_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            builtin,
            client,
            control: Arc::default(),
            timeline: IterationTimeline::new(),
            active_vus: AtomicU64::new(0),
            setup_data: OnceLock::new(),
            iteration_timeout,
        }
    }
}

/// Per-VU handle passed to script code.
#[derive(Debug)]
pub struct VuContext {
    id: u64,
    id_in_scenario: u64,
    scenario: Option<ScenarioInfo>,
    metrics_ctx: MetricsContext,
    pub(crate) shared: Arc<RunShared>,
    pub(crate) client: HttpClient,
    groups: Mutex<Vec<String>>,
    iteration_in_instance: AtomicU64,
    iteration_in_scenario: AtomicU64,
}

impl VuContext {
    pub(crate) fn new(
        id: u64,
        id_in_scenario: u64,
        scenario: &ScenarioConfig,
        shared: Arc<RunShared>,
        client: HttpClient,
    ) -> Self {
        Self {
            id,
            id_in_scenario,
            scenario: Some(ScenarioInfo::from_config(scenario)),
            metrics_ctx: scenario.metrics_ctx.clone(),
            shared,
            client,
            groups: Mutex::new(Vec::new()),
            iteration_in_instance: AtomicU64::new(0),
            iteration_in_scenario: AtomicU64::new(0),
        }
    }

    /// Context for setup/teardown: VU id `0`, no scenario, rooted at group `::<phase>`.
    pub(crate) fn detached(phase: &str, shared: Arc<RunShared>) -> Self {
        Self {
            id: 0,
            id_in_scenario: 0,
            scenario: None,
            metrics_ctx: MetricsContext::detached(),
            client: shared.client.clone(),
            shared,
            groups: Mutex::new(vec![phase.to_string()]),
            iteration_in_instance: AtomicU64::new(0),
            iteration_in_scenario: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn id_in_scenario(&self) -> u64 {
        self.id_in_scenario
    }

    pub fn scenario(&self) -> Option<&ScenarioInfo> {
        self.scenario.as_ref()
    }

    /// Entry point name of the scenario this VU runs.
    pub fn exec(&self) -> &str {
        self.scenario.as_ref().map_or(DEFAULT_EXEC, |s| &*s.exec)
    }

    pub fn execution(&self) -> ExecutionInfo {
        ExecutionInfo {
            vu_id: self.id,
            vu_id_in_scenario: self.id_in_scenario,
            iteration_in_instance: self.iteration_in_instance.load(Ordering::Relaxed),
            iteration_in_scenario: self.iteration_in_scenario.load(Ordering::Relaxed),
            scenario: self.scenario.as_ref().map(|s| s.name.to_string()),
            executor: self.scenario.as_ref().map(|s| s.executor),
        }
    }

    pub(crate) fn begin_iteration(&self, iteration_in_scenario: u64) {
        self.iteration_in_instance.fetch_add(1, Ordering::Relaxed);
        self.iteration_in_scenario
            .store(iteration_in_scenario, Ordering::Relaxed);
    }

    pub fn http(&self) -> Http<'_> {
        Http::new(self)
    }

    pub fn metrics(&self) -> &Registry {
        &self.shared.registry
    }

    /// Current group path, e.g. `::checkout::pay`. Empty at the root.
    pub fn group_path(&self) -> String {
        let groups = self.groups.lock();
        let mut path = String::new();
        for name in groups.iter() {
            path.push_str(GROUP_SEPARATOR);
            path.push_str(name);
        }
        path
    }

    pub(crate) fn push_group(&self, name: &str) {
        self.groups.lock().push(name.to_string());
    }

    pub(crate) fn pop_group(&self) {
        self.groups.lock().pop();
    }

    /// Tag set for a sample emitted here: scenario tags, scenario, group, then `extra`.
    pub(crate) fn tags(&self, extra: &[(&str, &str)]) -> TagSet {
        self.metrics_ctx
            .tags(&self.shared.registry, &self.group_path(), extra)
    }

    /// Tags for iteration-level metrics, which always sit at the root group.
    pub(crate) fn root_tags(&self) -> TagSet {
        self.metrics_ctx.tags(&self.shared.registry, "", &[])
    }

    /// Registers (or looks up) a custom metric.
    pub fn metric(&self, name: &str, kind: MetricKind) -> Result<CustomMetric<'_>, ScriptError> {
        let id = self.shared.registry.register(name, kind)?;
        Ok(CustomMetric { ctx: self, id })
    }

    pub fn counter(&self, name: &str) -> Result<CustomMetric<'_>, ScriptError> {
        self.metric(name, MetricKind::Counter)
    }

    pub fn gauge(&self, name: &str) -> Result<CustomMetric<'_>, ScriptError> {
        self.metric(name, MetricKind::Gauge)
    }

    pub fn rate(&self, name: &str) -> Result<CustomMetric<'_>, ScriptError> {
        self.metric(name, MetricKind::Rate)
    }

    pub fn trend(&self, name: &str) -> Result<CustomMetric<'_>, ScriptError> {
        self.metric(name, MetricKind::Trend)
    }

    /// Pauses the VU. A hard stop interrupts the sleep along with the iteration.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Stops the whole run gracefully.
    pub fn abort_test(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("VU {} aborted the test: {reason}", self.id);
        self.shared
            .control
            .request_stop(format!("aborted by script: {reason}"));
    }
}

/// Write handle for a user-defined metric, tagged like any other sample from this VU.
#[derive(Debug, Clone, Copy)]
pub struct CustomMetric<'a> {
    ctx: &'a VuContext,
    id: MetricId,
}

impl CustomMetric<'_> {
    pub fn id(&self) -> MetricId {
        self.id
    }

    pub fn add(&self, value: f64) {
        self.add_with_tags(value, &[]);
    }

    pub fn add_with_tags(&self, value: f64, tags: &[(&str, &str)]) {
        let sample = Sample::new(self.id, self.ctx.tags(tags), value);
        self.ctx.shared.registry.record(&sample);
    }

    /// Rate shorthand: a hit when `true`.
    pub fn add_bool(&self, hit: bool) {
        self.add(if hit { 1.0 } else { 0.0 });
    }

    /// Trend shorthand: records `duration` in milliseconds.
    pub fn add_duration(&self, duration: Duration) {
        self.add(crate::request_metrics::millis(duration));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::ScenarioExecutor;
    use swarm_http::HttpClientOptions;

    pub(crate) fn shared() -> Arc<RunShared> {
        let registry = Arc::new(Registry::new());
        let builtin = BuiltinMetrics::register(&registry).unwrap_or_else(|e| panic!("{e}"));
        let client =
            HttpClient::new(HttpClientOptions::default()).unwrap_or_else(|e| panic!("{e}"));
        Arc::new(RunShared::new(registry, builtin, client, None))
    }

    pub(crate) fn scenario(name: &str) -> ScenarioConfig {
        ScenarioConfig {
            exec: "browse".to_string(),
            metrics_ctx: MetricsContext::new(
                Arc::from(name),
                Arc::from(vec![("team".to_string(), "web".to_string())]),
            ),
            executor: ScenarioExecutor::PerVuIterations {
                vus: 2,
                iterations: 1,
                max_duration: Duration::from_secs(60),
            },
            start_time: Duration::ZERO,
            graceful_stop: Duration::from_secs(1),
        }
    }

    pub(crate) fn vu() -> VuContext {
        let shared = shared();
        let client = shared.client.clone();
        VuContext::new(3, 2, &scenario("api"), shared, client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_metrics::MetricValue;

    #[test]
    fn execution_info_tracks_iterations() {
        let ctx = testing::vu();
        assert_eq!(ctx.exec(), "browse");
        ctx.begin_iteration(7);
        ctx.begin_iteration(9);

        let info = ctx.execution();
        assert_eq!(info.vu_id, 3);
        assert_eq!(info.vu_id_in_scenario, 2);
        assert_eq!(info.iteration_in_instance, 2);
        assert_eq!(info.iteration_in_scenario, 9);
        assert_eq!(info.scenario.as_deref(), Some("api"));
        assert_eq!(info.executor, Some(ScenarioExecutorKind::PerVuIterations));
    }

    #[test]
    fn detached_context_has_phase_group_and_no_scenario() {
        let ctx = VuContext::detached("setup", testing::shared());
        assert_eq!(ctx.id(), 0);
        assert_eq!(ctx.group_path(), "::setup");
        assert_eq!(ctx.exec(), DEFAULT_EXEC);

        let tags = ctx.metrics().tags_to_strings(&ctx.tags(&[]));
        assert!(tags.iter().all(|(k, _)| k != "scenario"));
        assert!(tags.contains(&("group".to_string(), "::setup".to_string())));
    }

    #[test]
    fn custom_metrics_carry_scenario_tags() {
        let ctx = testing::vu();
        let c = ctx.counter("orders").unwrap_or_else(|e| panic!("{e}"));
        c.add(2.0);
        c.add_with_tags(3.0, &[("kind", "express")]);

        let series: Vec<_> = ctx
            .metrics()
            .summarize()
            .into_iter()
            .filter(|s| s.name == "orders")
            .collect();
        assert_eq!(series.len(), 2);
        assert!(series.iter().all(|s| s.tag("scenario") == Some("api")));
        assert!(series.iter().all(|s| s.tag("team") == Some("web")));
        let express = series
            .iter()
            .find(|s| s.tag("kind") == Some("express"))
            .unwrap_or_else(|| panic!("missing tagged series"));
        assert_eq!(express.values, MetricValue::Counter { sum: 3.0 });

        assert!(ctx.gauge("orders").is_err());
    }

    #[test]
    fn abort_test_requests_a_run_stop() {
        let ctx = testing::vu();
        ctx.abort_test("bad data");
        assert!(ctx.shared.control.is_stopping());
        assert_eq!(
            ctx.shared.control.reason().as_deref(),
            Some("aborted by script: bad data")
        );
    }
}
