use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use swarm_http::HttpClient;
use swarm_metrics::Registry;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{DEFAULT_SETUP_TIMEOUT, RunConfig, ScenarioConfig};
use crate::metrics_context::BuiltinMetrics;
use crate::options::ScriptOptions;
use crate::runner::{ScenarioRuntime, StopHandle, drive_scenario, run_vu};
use crate::scenarios::scenarios_from_options;
use crate::summary::RunSummary;
use crate::thresholds::{ThresholdSet, parse_thresholds, validate_thresholds};
use crate::thresholds_eval::evaluate_thresholds;
use crate::vu::{RunShared, VuContext, VuInitInfo};
use crate::{Error, Result, Script};

const VUS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// A prepared run: options validated, metrics registered, nothing executed yet.
#[derive(Debug)]
pub struct Run<S: Script> {
    script: Arc<S>,
    scenarios: Vec<ScenarioConfig>,
    thresholds: Arc<[ThresholdSet]>,
    config: RunConfig,
    setup_timeout: Duration,
    teardown_timeout: Duration,
    shared: Arc<RunShared>,
}

impl<S: Script> Run<S> {
    /// Resolves scenarios and thresholds. Every configuration error surfaces here.
    pub fn new(script: S, options: &ScriptOptions, mut config: RunConfig) -> Result<Self> {
        let scenarios = scenarios_from_options(options, &config)?;
        if let Some(max) = options.max_redirects {
            config.http.max_redirects = max;
        }

        let registry = Arc::new(Registry::new());
        let builtin = BuiltinMetrics::register(&registry)?;
        let thresholds = parse_thresholds(&options.thresholds)?;
        validate_thresholds(&thresholds, &registry)?;

        let client = HttpClient::new(config.http.clone())?;
        let shared = Arc::new(RunShared::new(
            registry,
            builtin,
            client,
            config.iteration_timeout,
        ));

        Ok(Self {
            script: Arc::new(script),
            scenarios,
            thresholds: thresholds.into(),
            setup_timeout: options.setup_timeout.unwrap_or(DEFAULT_SETUP_TIMEOUT),
            teardown_timeout: options.teardown_timeout.unwrap_or(DEFAULT_SETUP_TIMEOUT),
            config,
            shared,
        })
    }

    pub fn scenarios(&self) -> &[ScenarioConfig] {
        &self.scenarios
    }

    pub fn thresholds(&self) -> &[ThresholdSet] {
        &self.thresholds
    }

    /// Live metrics of this run.
    pub fn metrics(&self) -> Arc<Registry> {
        self.shared.registry.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.shared.control.clone())
    }

    /// Initializes every VU, runs setup, all scenarios and teardown, then evaluates thresholds.
    pub async fn execute(self) -> Result<RunSummary> {
        let Self {
            script,
            scenarios,
            thresholds,
            config,
            setup_timeout,
            teardown_timeout,
            shared,
        } = self;

        let runtimes: Vec<Arc<ScenarioRuntime>> = scenarios
            .into_iter()
            .map(|s| Arc::new(ScenarioRuntime::new(s)))
            .collect();
        let total_vus: u64 = runtimes.iter().map(|s| s.vus()).sum();
        log::info!(
            "initializing {total_vus} VU(s) across {} scenario(s)",
            runtimes.len()
        );

        let init_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let ready = Arc::new(Barrier::new(
            usize::try_from(total_vus).unwrap_or(usize::MAX).saturating_add(1),
        ));

        let mut vu_handles: Vec<JoinHandle<()>> = Vec::new();
        let mut next_vu_id: u64 = 1;
        for scenario in &runtimes {
            for id_in_scenario in 1..=scenario.vus() {
                let id = next_vu_id;
                next_vu_id += 1;

                let info = VuInitInfo {
                    id,
                    id_in_scenario,
                    scenario: scenario.config.name().to_string(),
                    exec: scenario.config.exec.clone(),
                };
                let client = match HttpClient::new(config.http.clone()) {
                    Ok(client) => client,
                    Err(err) => {
                        abort_all(vu_handles).await;
                        return Err(err.into());
                    }
                };
                let ctx = VuContext::new(
                    id,
                    id_in_scenario,
                    &scenario.config,
                    shared.clone(),
                    client,
                );
                let lease = scenario.lease();
                let script = script.clone();
                let scenario = scenario.clone();
                let init_error = init_error.clone();
                let ready = ready.clone();

                vu_handles.push(tokio::spawn(async move {
                    let _lease = lease;
                    // A panicking init must still reach the barrier.
                    let init = {
                        let script = script.clone();
                        tokio::spawn(async move { script.init_vu(&info).await })
                    };
                    let failure = match init.await {
                        Ok(Ok(state)) => Ok(state),
                        Ok(Err(err)) => Err(err.to_string()),
                        Err(err) => Err(format!("init panicked: {err}")),
                    };
                    let state = match failure {
                        Ok(state) => Some(state),
                        Err(message) => {
                            log::error!("VU {id} failed to initialize: {message}");
                            let mut first = init_error.lock();
                            if first.is_none() {
                                *first = Some(Error::VuInit { vu: id, message });
                            }
                            None
                        }
                    };
                    ready.wait().await;
                    if let Some(state) = state {
                        run_vu(script, state, ctx, scenario).await;
                    }
                }));
            }
        }

        // Initialization stays outside the measured run.
        ready.wait().await;
        let init_error = init_error.lock().take();
        if let Some(err) = init_error {
            abort_all(vu_handles).await;
            return Err(err);
        }
        shared
            .builtin
            .iteration
            .sample_vus(&shared.registry, 0, total_vus);

        let setup_ctx = VuContext::detached("setup", shared.clone());
        let setup = match tokio::time::timeout(setup_timeout, script.setup(&setup_ctx)).await {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => {
                abort_all(vu_handles).await;
                return Err(Error::Setup(err.to_string()));
            }
            Err(_) => {
                abort_all(vu_handles).await;
                return Err(Error::Setup(format!("timed out after {setup_timeout:?}")));
            }
        };
        let _ = shared.setup_data.set(setup);

        let started = Instant::now();
        shared.timeline.start(started);
        log::info!("run started");

        let controllers: Vec<JoinHandle<()>> = runtimes
            .iter()
            .map(|scenario| {
                tokio::spawn(drive_scenario(
                    scenario.clone(),
                    shared.clone(),
                    config.abort_mode,
                    config.ramp_tick,
                ))
            })
            .collect();

        let mut background = vec![tokio::spawn(sample_vus(shared.clone(), total_vus))];
        if thresholds.iter().any(|set| set.expressions.iter().any(|e| e.abort_on_fail)) {
            background.push(tokio::spawn(watch_thresholds(
                shared.clone(),
                thresholds.clone(),
                started,
                config.threshold_interval,
            )));
        }
        if let Some(limit) = config.max_duration {
            let shared = shared.clone();
            background.push(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                shared
                    .control
                    .request_stop(format!("max duration of {limit:?} reached"));
            }));
        }

        let joined = join_all(controllers).await;
        let joined = match joined {
            Ok(()) => join_all(vu_handles).await,
            Err(err) => {
                abort_all(vu_handles).await;
                Err(err)
            }
        };
        for task in &background {
            task.abort();
        }
        joined?;

        let duration = started.elapsed();
        shared
            .builtin
            .iteration
            .sample_vus(&shared.registry, 0, total_vus);

        let teardown_ctx = VuContext::detached("teardown", shared.clone());
        let data = shared.setup_data.get().and_then(Option::as_ref);
        let teardown_error =
            match tokio::time::timeout(teardown_timeout, script.teardown(&teardown_ctx, data)).await
            {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("timed out after {teardown_timeout:?}")),
            };
        if let Some(err) = &teardown_error {
            log::error!("teardown failed: {err}");
        }

        let outcomes = evaluate_thresholds(&shared.registry, &thresholds, duration);
        let summary = RunSummary::collect(
            &shared.registry,
            duration,
            outcomes,
            shared.timeline.buckets(),
            shared.control.reason(),
            teardown_error,
        );
        log::info!(
            "run finished in {duration:?}: {} iteration(s), thresholds {}",
            summary.counter(crate::iteration_metrics::ITERATIONS),
            if summary.passed() { "passed" } else { "failed" }
        );
        Ok(summary)
    }
}

/// Prepares and executes a run in one call.
pub async fn run<S: Script>(
    script: S,
    options: &ScriptOptions,
    config: RunConfig,
) -> Result<RunSummary> {
    Run::new(script, options, config)?.execute().await
}

async fn join_all(handles: Vec<JoinHandle<()>>) -> Result<()> {
    for h in handles {
        h.await?;
    }
    Ok(())
}

async fn abort_all(handles: Vec<JoinHandle<()>>) {
    for h in &handles {
        h.abort();
    }
    for h in handles {
        let _ = h.await;
    }
}

async fn sample_vus(shared: Arc<RunShared>, max: u64) {
    let mut tick = tokio::time::interval(VUS_SAMPLE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let active = shared.active_vus.load(std::sync::atomic::Ordering::Relaxed);
        shared
            .builtin
            .iteration
            .sample_vus(&shared.registry, active, max);
    }
}

async fn watch_thresholds(
    shared: Arc<RunShared>,
    thresholds: Arc<[ThresholdSet]>,
    started: Instant,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately, before anything was recorded.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.control.stopped() => return,
        }
        let elapsed = started.elapsed();
        let outcomes = evaluate_thresholds(&shared.registry, &thresholds, elapsed);
        if let Some(failed) = outcomes.iter().find(|o| o.should_abort(elapsed)) {
            log::warn!(
                "threshold `{}` on `{}` failed (observed {:?}), aborting",
                failed.expression,
                failed.key,
                failed.observed
            );
            shared.control.request_stop(format!(
                "threshold `{}` on `{}` crossed",
                failed.expression, failed.key
            ));
            return;
        }
    }
}
