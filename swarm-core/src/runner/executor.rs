use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::gate::IterationGate;
use super::pacer::{ArrivalClock, ArrivalPacer};
use super::schedule::RampingSchedule;
use super::signal::Signal;
use crate::config::{AbortMode, ScenarioConfig, ScenarioExecutor};
use crate::vu::{RunShared, VuContext};
use crate::{Script, ScriptError};

const ARRIVAL_TICK: Duration = Duration::from_millis(10);

/// How VUs of a scenario get permission to start an iteration.
#[derive(Debug)]
pub(crate) enum ScenarioWork {
    Shared(IterationGate),
    PerVu {
        iterations: u64,
    },
    /// Loop until the scenario stops.
    Timed,
    Ramping {
        target: watch::Sender<u64>,
        schedule: RampingSchedule,
        graceful_ramp_down: Duration,
    },
    Arrival {
        pacer: ArrivalPacer,
        schedule: RampingSchedule,
        time_unit: Duration,
    },
}

/// Live state of one scenario, shared by its controller and its VUs.
#[derive(Debug)]
pub(crate) struct ScenarioRuntime {
    pub(crate) config: ScenarioConfig,
    pub(crate) work: ScenarioWork,
    /// VUs may start iterating.
    started: Signal,
    /// No new iterations.
    stop: Signal,
    /// Interrupt iterations in flight.
    hard_stop: Signal,
    /// Every VU task has exited.
    finished: Signal,
    live_vus: AtomicU64,
    iterations: AtomicU64,
}

impl ScenarioRuntime {
    pub(crate) fn new(config: ScenarioConfig) -> Self {
        let work = match &config.executor {
            ScenarioExecutor::SharedIterations { iterations, .. } => {
                ScenarioWork::Shared(IterationGate::new(*iterations))
            }
            ScenarioExecutor::PerVuIterations { iterations, .. } => ScenarioWork::PerVu {
                iterations: *iterations,
            },
            ScenarioExecutor::ConstantVus { .. } => ScenarioWork::Timed,
            ScenarioExecutor::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
            } => {
                let schedule = RampingSchedule::new(*start_vus, stages.clone());
                let (target, _) = watch::channel(schedule.target_at(Duration::ZERO));
                ScenarioWork::Ramping {
                    target,
                    schedule,
                    graceful_ramp_down: *graceful_ramp_down,
                }
            }
            ScenarioExecutor::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => ScenarioWork::Arrival {
                pacer: ArrivalPacer::new(*pre_allocated_vus, *max_vus),
                schedule: RampingSchedule::constant(*rate, *duration),
                time_unit: *time_unit,
            },
            ScenarioExecutor::RampingArrivalRate {
                start_rate,
                time_unit,
                pre_allocated_vus,
                max_vus,
                stages,
            } => ScenarioWork::Arrival {
                pacer: ArrivalPacer::new(*pre_allocated_vus, *max_vus),
                schedule: RampingSchedule::new(*start_rate, stages.clone()),
                time_unit: *time_unit,
            },
        };

        let vus = config.executor.max_vus();
        Self {
            config,
            work,
            started: Signal::new(),
            stop: Signal::new(),
            hard_stop: Signal::new(),
            finished: Signal::new(),
            live_vus: AtomicU64::new(vus),
            iterations: AtomicU64::new(0),
        }
    }

    pub(crate) fn vus(&self) -> u64 {
        self.config.executor.max_vus()
    }

    /// One lease per VU task; the last one dropped marks the scenario finished.
    pub(crate) fn lease(self: &Arc<Self>) -> VuLease {
        VuLease {
            scenario: self.clone(),
        }
    }
}

pub(crate) struct VuLease {
    scenario: Arc<ScenarioRuntime>,
}

impl Drop for VuLease {
    fn drop(&mut self) {
        if self.scenario.live_vus.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.scenario.finished.fire();
        }
    }
}

struct BusyGuard<'a>(&'a AtomicU64);

impl<'a> BusyGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Iteration loop of one VU. Returns when the scenario has no more work for it.
pub(crate) async fn run_vu<S: Script>(
    script: Arc<S>,
    mut state: S::Vu,
    ctx: VuContext,
    scenario: Arc<ScenarioRuntime>,
) {
    tokio::select! {
        _ = scenario.started.wait() => {}
        _ = scenario.stop.wait() => return,
    }

    let slot = ctx.id_in_scenario();
    let mut ramp = match &scenario.work {
        ScenarioWork::Ramping {
            target,
            graceful_ramp_down,
            ..
        } => Some((target.subscribe(), *graceful_ramp_down)),
        _ => None,
    };
    let mut own_iterations = 0u64;

    loop {
        if scenario.stop.is_fired() {
            break;
        }

        let permitted = match &scenario.work {
            ScenarioWork::Shared(gate) => gate.try_acquire(),
            ScenarioWork::PerVu { iterations } => own_iterations < *iterations,
            ScenarioWork::Timed => true,
            ScenarioWork::Ramping { .. } => match ramp.as_mut() {
                Some((rx, _)) => wait_scheduled(rx, slot, &scenario.stop).await,
                None => false,
            },
            ScenarioWork::Arrival { pacer, .. } => tokio::select! {
                claimed = pacer.claim(slot) => claimed,
                _ = scenario.stop.wait() => false,
            },
        };
        if !permitted {
            break;
        }
        own_iterations += 1;

        run_iteration(script.as_ref(), &mut state, &ctx, &scenario, ramp.as_mut()).await;

        if let ScenarioWork::Arrival { pacer, .. } = &scenario.work {
            pacer.release();
        }
    }

    log::debug!(
        "VU {} leaving scenario `{}` after {own_iterations} iteration(s)",
        ctx.id(),
        scenario.config.name()
    );
}

async fn run_iteration<S: Script>(
    script: &S,
    state: &mut S::Vu,
    ctx: &VuContext,
    scenario: &ScenarioRuntime,
    ramp: Option<&mut (watch::Receiver<u64>, Duration)>,
) {
    let shared: &RunShared = &ctx.shared;
    ctx.begin_iteration(scenario.iterations.fetch_add(1, Ordering::Relaxed));
    let _busy = BusyGuard::new(&shared.active_vus);
    let data = shared.setup_data.get().and_then(Option::as_ref);
    let iteration_timeout = shared.iteration_timeout;
    let slot = ctx.id_in_scenario();
    let started = Instant::now();

    let body = async move {
        match iteration_timeout {
            Some(limit) => tokio::time::timeout(limit, script.iteration(state, ctx, data))
                .await
                .unwrap_or_else(|_| {
                    Err(ScriptError::new(format!("iteration timed out after {limit:?}")))
                }),
            None => script.iteration(state, ctx, data).await,
        }
    };

    let interrupt = async move {
        match ramp {
            Some((rx, grace)) => tokio::select! {
                _ = scenario.hard_stop.wait() => {}
                _ = descheduled(rx, slot, *grace) => {}
            },
            None => scenario.hard_stop.wait().await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = interrupt => None,
        res = body => Some(res),
    };

    match outcome {
        // Interrupted iterations are not counted.
        None => log::debug!("VU {} iteration interrupted", ctx.id()),
        Some(res) => {
            let success = match res {
                Ok(()) => true,
                Err(err) => {
                    log::warn!(
                        "VU {} iteration in scenario `{}` failed: {err}",
                        ctx.id(),
                        scenario.config.name()
                    );
                    false
                }
            };
            shared.builtin.iteration.record_iteration(
                &shared.registry,
                &ctx.root_tags(),
                started.elapsed(),
                success,
            );
            shared.timeline.record(success);
        }
    }
}

/// Waits until the ramp target includes `slot`. `false` once the scenario stops.
async fn wait_scheduled(rx: &mut watch::Receiver<u64>, slot: u64, stop: &Signal) -> bool {
    loop {
        if stop.is_fired() {
            return false;
        }
        let target = *rx.borrow_and_update();
        if target >= slot {
            return true;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = stop.wait() => return false,
        }
    }
}

/// Resolves once the ramp target has stayed below `slot` for `grace`.
async fn descheduled(rx: &mut watch::Receiver<u64>, slot: u64, grace: Duration) {
    loop {
        loop {
            let target = *rx.borrow_and_update();
            if target < slot {
                break;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }

        let rescheduled = async {
            loop {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
                let target = *rx.borrow_and_update();
                if target >= slot {
                    break;
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(grace) => return,
            _ = rescheduled => {}
        }
    }
}

/// Drives one scenario: waits for `startTime`, runs the executor's work window, then stops
/// its VUs, allowing `gracefulStop` before interrupting what is still running.
pub(crate) async fn drive_scenario(
    scenario: Arc<ScenarioRuntime>,
    shared: Arc<RunShared>,
    abort_mode: AbortMode,
    ramp_tick: Duration,
) {
    let name = scenario.config.name().to_string();
    let control = &shared.control;

    tokio::select! {
        _ = tokio::time::sleep(scenario.config.start_time) => {}
        _ = control.stopped() => {
            log::info!("scenario `{name}` skipped: run stopped before its start time");
            scenario.stop.fire();
            scenario.finished.wait().await;
            return;
        }
    }

    log::info!(
        "scenario `{name}` started: executor={} vus={}",
        scenario.config.executor.kind(),
        scenario.vus()
    );
    let t0 = Instant::now();
    scenario.started.fire();

    tokio::select! {
        _ = drive_work(&scenario, &shared, t0, ramp_tick) => {}
        _ = scenario.finished.wait() => {}
        _ = control.stopped() => {}
    }

    scenario.stop.fire();
    if let ScenarioWork::Arrival { pacer, .. } = &scenario.work {
        let unclaimed = pacer.finish();
        if unclaimed != 0 {
            log::debug!("scenario `{name}`: {unclaimed} granted start(s) never began");
            let tags = scenario.config.metrics_ctx.tags(&shared.registry, "", &[]);
            shared
                .builtin
                .iteration
                .record_dropped(&shared.registry, &tags, unclaimed);
        }
    }

    let hard_requested = async {
        if abort_mode == AbortMode::Hard {
            control.stopped().await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    let interrupted = tokio::select! {
        _ = scenario.finished.wait() => false,
        _ = tokio::time::sleep(scenario.config.graceful_stop) => {
            log::info!(
                "scenario `{name}`: gracefulStop ({:?}) elapsed, interrupting running iterations",
                scenario.config.graceful_stop
            );
            true
        }
        _ = hard_requested => true,
    };
    if interrupted {
        scenario.hard_stop.fire();
        scenario.finished.wait().await;
    }

    log::info!(
        "scenario `{name}` finished after {:?} ({} iteration(s) started)",
        t0.elapsed(),
        scenario.iterations.load(Ordering::Relaxed)
    );
}

async fn drive_work(
    scenario: &ScenarioRuntime,
    shared: &RunShared,
    t0: Instant,
    ramp_tick: Duration,
) {
    match &scenario.work {
        ScenarioWork::Shared(_) | ScenarioWork::PerVu { .. } | ScenarioWork::Timed => {
            tokio::time::sleep(scenario.config.executor.work_window()).await;
        }
        ScenarioWork::Ramping {
            target, schedule, ..
        } => {
            let mut tick = tokio::time::interval(ramp_tick.max(Duration::from_millis(1)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let elapsed = t0.elapsed();
                let want = schedule.target_at(elapsed);
                target.send_if_modified(|cur| {
                    let changed = *cur != want;
                    *cur = want;
                    changed
                });
                if schedule.is_done(elapsed) {
                    break;
                }
            }
        }
        ScenarioWork::Arrival {
            pacer,
            schedule,
            time_unit,
        } => {
            let mut clock = ArrivalClock::new(schedule.clone(), *time_unit);
            let tags = scenario
                .config
                .metrics_ctx
                .tags(&shared.registry, "", &[]);
            let mut tick = tokio::time::interval(ARRIVAL_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let elapsed = t0.elapsed();
                let dropped = pacer.due(clock.advance(elapsed));
                if dropped != 0 {
                    log::debug!(
                        "scenario `{}`: dropped {dropped} iteration(s), all {} VUs busy",
                        scenario.config.name(),
                        pacer.max_vus()
                    );
                    shared
                        .builtin
                        .iteration
                        .record_dropped(&shared.registry, &tags, dropped);
                }
                if elapsed >= clock.total_duration() {
                    break;
                }
            }
        }
    }
}
