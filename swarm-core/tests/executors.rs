#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::json;
use swarm_core::{
    DROPPED_ITERATIONS, ITERATIONS, ITERATIONS_FAILED, RunConfig, Script, ScriptError,
    ScriptOptions, VuContext, VuInitInfo, run,
};
use tokio::time::Instant;

#[derive(Default)]
struct Log {
    started: OnceLock<Instant>,
    // (seconds since setup, vu id in scenario)
    starts: Mutex<Vec<(f64, u64)>>,
    per_vu: Mutex<HashMap<u64, u64>>,
    total: AtomicU64,
}

/// Records every iteration start, then sleeps `pause`.
struct Recorder {
    log: Arc<Log>,
    pause: Duration,
}

impl Recorder {
    fn new(pause: Duration) -> (Self, Arc<Log>) {
        let log = Arc::new(Log::default());
        (
            Self {
                log: log.clone(),
                pause,
            },
            log,
        )
    }
}

impl Script for Recorder {
    type Vu = ();

    async fn init_vu(&self, _info: &VuInitInfo) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn setup(&self, _ctx: &VuContext) -> Result<Option<serde_json::Value>, ScriptError> {
        let _ = self.log.started.set(Instant::now());
        Ok(None)
    }

    async fn iteration(
        &self,
        _vu: &mut (),
        ctx: &VuContext,
        _data: Option<&serde_json::Value>,
    ) -> Result<(), ScriptError> {
        let at = self
            .log
            .started
            .get()
            .map_or(0.0, |s| s.elapsed().as_secs_f64());
        self.log
            .starts
            .lock()
            .unwrap()
            .push((at, ctx.id_in_scenario()));
        *self.log.per_vu.lock().unwrap().entry(ctx.id()).or_default() += 1;
        self.log.total.fetch_add(1, Ordering::Relaxed);

        if self.pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            ctx.sleep(self.pause).await;
        }
        Ok(())
    }
}

fn options(v: serde_json::Value) -> ScriptOptions {
    ScriptOptions::from_value(v).unwrap()
}

#[tokio::test]
async fn shared_iterations_run_exactly_the_requested_total() {
    let _ = env_logger::builder().is_test(true).try_init();

    for vus in [1, 3, 7, 50] {
        let (script, log) = Recorder::new(Duration::ZERO);
        let opts = options(json!({
            "scenarios": {
                "shared": { "executor": "shared-iterations", "vus": vus, "iterations": 50 }
            }
        }));

        let summary = run(script, &opts, RunConfig::default()).await.unwrap();

        assert_eq!(log.total.load(Ordering::Relaxed), 50, "vus={vus}");
        assert_eq!(summary.counter(ITERATIONS), 50.0, "vus={vus}");
        assert!(log.per_vu.lock().unwrap().len() <= vus as usize);
        assert!(summary.passed());
    }
}

#[tokio::test]
async fn per_vu_iterations_run_k_each() {
    let (script, log) = Recorder::new(Duration::ZERO);
    let opts = options(json!({
        "scenarios": {
            "each": { "executor": "per-vu-iterations", "vus": 4, "iterations": 3 }
        }
    }));

    let summary = run(script, &opts, RunConfig::default()).await.unwrap();

    let per_vu = log.per_vu.lock().unwrap().clone();
    assert_eq!(per_vu.len(), 4);
    assert!(per_vu.values().all(|&n| n == 3), "{per_vu:?}");
    assert_eq!(summary.counter(ITERATIONS), 12.0);

    let timeline_total: u64 = summary
        .timeline
        .iter()
        .map(|b| b.successful + b.failed)
        .sum();
    assert_eq!(timeline_total, 12);
}

#[tokio::test(start_paused = true)]
async fn ramping_vus_follow_the_stages() {
    let (script, log) = Recorder::new(Duration::from_millis(100));
    let opts = options(json!({
        "scenarios": {
            "ramp": {
                "executor": "ramping-vus",
                "startVUs": 0,
                "stages": [
                    { "duration": "10s", "target": 5 },
                    { "duration": "5s", "target": 5 },
                    { "duration": "5s", "target": 0 }
                ]
            }
        }
    }));

    let summary = run(script, &opts, RunConfig::default()).await.unwrap();
    let starts = log.starts.lock().unwrap().clone();
    assert!(!starts.is_empty());

    for &(t, slot) in &starts {
        assert!(slot <= 5, "slot {slot} at {t}");
        if t < 10.0 {
            // target(t) = round(t / 2) during the first stage
            assert!(slot as f64 <= t / 2.0 + 0.5 + 1e-9, "slot {slot} at {t}");
        }
        assert!(t < 20.0, "iteration started after the ramp ended: {t}");
    }
    assert!(starts.iter().all(|&(t, _)| t >= 0.9), "{starts:?}");

    let plateau: std::collections::BTreeSet<u64> = starts
        .iter()
        .filter(|&&(t, _)| (10.5..14.5).contains(&t))
        .map(|&(_, slot)| slot)
        .collect();
    assert_eq!(plateau.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

    assert!(summary.duration >= Duration::from_secs(20));
    assert!(summary.duration < Duration::from_secs(21));
}

#[tokio::test(start_paused = true)]
async fn arrival_rate_records_dropped_iterations() {
    let (script, log) = Recorder::new(Duration::from_secs(1));
    let opts = options(json!({
        "scenarios": {
            "rps": {
                "executor": "constant-arrival-rate",
                "rate": 50,
                "timeUnit": "1s",
                "duration": "2s",
                "preAllocatedVUs": 1,
                "maxVUs": 2
            }
        }
    }));

    let summary = run(script, &opts, RunConfig::default()).await.unwrap();

    let started = log.total.load(Ordering::Relaxed);
    assert!((2..=6).contains(&started), "started={started}");
    let dropped = summary.counter(DROPPED_ITERATIONS);
    assert!(dropped > 80.0, "dropped={dropped}");
    assert!(log.per_vu.lock().unwrap().len() <= 2);
}

#[tokio::test(start_paused = true)]
async fn abort_on_fail_threshold_stops_new_iterations() {
    let (script, log) = Recorder::new(Duration::from_millis(100));
    let opts = options(json!({
        "scenarios": {
            "steady": { "executor": "constant-vus", "vus": 2, "duration": "60s" }
        },
        "thresholds": {
            "iterations": [{ "threshold": "count<5", "abortOnFail": true }]
        }
    }));
    let cfg = RunConfig {
        threshold_interval: Duration::from_millis(500),
        ..RunConfig::default()
    };

    let summary = run(script, &opts, cfg).await.unwrap();

    assert!(!summary.passed());
    assert!(
        summary
            .aborted
            .as_deref()
            .is_some_and(|r| r.contains("count<5")),
        "{:?}",
        summary.aborted
    );
    assert!(summary.duration < Duration::from_secs(2));
    // Abort at the 0.5s tick; in-flight iterations finish, nothing starts afterwards.
    let starts = log.starts.lock().unwrap().clone();
    assert!(starts.iter().all(|&(t, _)| t <= 0.5 + 1e-9), "{starts:?}");
    assert_eq!(summary.counter(ITERATIONS), starts.len() as f64);
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_interrupts_long_iterations() {
    let (script, log) = Recorder::new(Duration::from_secs(3600));
    let opts = options(json!({
        "scenarios": {
            "stuck": {
                "executor": "constant-vus",
                "vus": 3,
                "duration": "1s",
                "gracefulStop": "500ms"
            }
        }
    }));

    let summary = run(script, &opts, RunConfig::default()).await.unwrap();

    assert_eq!(log.total.load(Ordering::Relaxed), 3);
    // Interrupted iterations are not counted as completed.
    assert_eq!(summary.counter(ITERATIONS), 0.0);
    assert!(summary.duration >= Duration::from_millis(1500));
    assert!(summary.duration < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn stop_handle_ends_the_run() {
    let (script, _log) = Recorder::new(Duration::from_millis(50));
    let opts = options(json!({ "vus": 2, "duration": "1h" }));

    let prepared = swarm_core::Run::new(script, &opts, RunConfig::default()).unwrap();
    let handle = prepared.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop("operator request");
    });

    let summary = prepared.execute().await.unwrap();
    assert_eq!(summary.aborted.as_deref(), Some("operator request"));
    assert!(summary.duration < Duration::from_secs(2));
    assert!(summary.counter(ITERATIONS) > 0.0);
}

#[tokio::test(start_paused = true)]
async fn iteration_timeout_fails_the_iteration() {
    let (script, _log) = Recorder::new(Duration::from_secs(3600));
    let opts = options(json!({
        "scenarios": { "slow": { "executor": "per-vu-iterations", "vus": 1, "iterations": 2 } }
    }));
    let cfg = RunConfig {
        iteration_timeout: Some(Duration::from_millis(200)),
        ..RunConfig::default()
    };

    let summary = run(script, &opts, cfg).await.unwrap();
    assert_eq!(summary.counter(ITERATIONS), 2.0);
    assert_eq!(summary.counter(ITERATIONS_FAILED), 2.0);
}

#[tokio::test(start_paused = true)]
async fn scenarios_start_at_their_offsets() {
    let (script, log) = Recorder::new(Duration::ZERO);
    let opts = options(json!({
        "scenarios": {
            "early": { "executor": "per-vu-iterations", "vus": 1, "iterations": 1 },
            "late": {
                "executor": "per-vu-iterations",
                "vus": 1,
                "iterations": 1,
                "startTime": "3s"
            }
        }
    }));

    let summary = run(script, &opts, RunConfig::default()).await.unwrap();

    let mut starts: Vec<f64> = log.starts.lock().unwrap().iter().map(|&(t, _)| t).collect();
    starts.sort_by(f64::total_cmp);
    assert_eq!(starts.len(), 2);
    assert!(starts[0] < 0.5);
    assert!(starts[1] >= 3.0);
    assert_eq!(summary.counter(ITERATIONS), 2.0);
}
