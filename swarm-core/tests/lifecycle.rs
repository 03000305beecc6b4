#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use swarm_core::{
    Error, ITERATIONS, ITERATIONS_FAILED, RunConfig, Script, ScriptError, ScriptOptions,
    VuContext, VuInitInfo, run,
};

#[derive(Default)]
struct Calls {
    init: AtomicU64,
    setup: AtomicU64,
    iterations: AtomicU64,
    saw_data: AtomicU64,
    teardown: AtomicU64,
    teardown_saw_data: AtomicU64,
}

#[derive(Default, Clone, Copy)]
enum Fault {
    #[default]
    None,
    InitVu(u64),
    InitPanic(u64),
    Setup,
    EveryOtherIteration,
    Teardown,
}

struct Lifecycle {
    calls: Arc<Calls>,
    fault: Fault,
}

fn lifecycle(fault: Fault) -> (Lifecycle, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    (
        Lifecycle {
            calls: calls.clone(),
            fault,
        },
        calls,
    )
}

impl Script for Lifecycle {
    /// Iterations run by this VU.
    type Vu = u64;

    async fn init_vu(&self, info: &VuInitInfo) -> Result<u64, ScriptError> {
        self.calls.init.fetch_add(1, Ordering::Relaxed);
        match self.fault {
            Fault::InitVu(id) if id == info.id => Err(ScriptError::new("cannot open data file")),
            Fault::InitPanic(id) if id == info.id => panic!("corrupt fixture for VU {id}"),
            _ => Ok(0),
        }
    }

    async fn setup(&self, ctx: &VuContext) -> Result<Option<Value>, ScriptError> {
        self.calls.setup.fetch_add(1, Ordering::Relaxed);
        assert_eq!(ctx.id(), 0);
        assert_eq!(ctx.group_path(), "::setup");
        if let Fault::Setup = self.fault {
            return Err(ScriptError::fail("login service unavailable"));
        }
        Ok(Some(json!({ "token": "abc" })))
    }

    async fn iteration(
        &self,
        vu: &mut u64,
        _ctx: &VuContext,
        data: Option<&Value>,
    ) -> Result<(), ScriptError> {
        *vu += 1;
        self.calls.iterations.fetch_add(1, Ordering::Relaxed);
        if data.and_then(|d| d["token"].as_str()) == Some("abc") {
            self.calls.saw_data.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(self.fault, Fault::EveryOtherIteration) && *vu % 2 == 0 {
            return Err(ScriptError::fail(format!("iteration {vu} failed")));
        }
        Ok(())
    }

    async fn teardown(&self, ctx: &VuContext, data: Option<&Value>) -> Result<(), ScriptError> {
        self.calls.teardown.fetch_add(1, Ordering::Relaxed);
        assert_eq!(ctx.group_path(), "::teardown");
        if data.is_some() {
            self.calls.teardown_saw_data.fetch_add(1, Ordering::Relaxed);
        }
        if let Fault::Teardown = self.fault {
            return Err(ScriptError::new("cleanup failed"));
        }
        Ok(())
    }
}

fn per_vu(vus: u64, iterations: u64) -> ScriptOptions {
    ScriptOptions::from_value(json!({
        "scenarios": {
            "main": { "executor": "per-vu-iterations", "vus": vus, "iterations": iterations }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn setup_data_reaches_every_iteration_and_teardown() {
    let (script, calls) = lifecycle(Fault::None);
    let summary = run(script, &per_vu(3, 4), RunConfig::default())
        .await
        .unwrap();

    assert_eq!(calls.init.load(Ordering::Relaxed), 3);
    assert_eq!(calls.setup.load(Ordering::Relaxed), 1);
    assert_eq!(calls.iterations.load(Ordering::Relaxed), 12);
    assert_eq!(calls.saw_data.load(Ordering::Relaxed), 12);
    assert_eq!(calls.teardown.load(Ordering::Relaxed), 1);
    assert_eq!(calls.teardown_saw_data.load(Ordering::Relaxed), 1);
    assert!(summary.passed());
    assert!(summary.aborted.is_none());
}

#[tokio::test]
async fn iteration_errors_are_counted_and_the_vu_continues() {
    let (script, calls) = lifecycle(Fault::EveryOtherIteration);
    let summary = run(script, &per_vu(2, 5), RunConfig::default())
        .await
        .unwrap();

    assert_eq!(calls.iterations.load(Ordering::Relaxed), 10);
    assert_eq!(summary.counter(ITERATIONS), 10.0);
    assert_eq!(summary.counter(ITERATIONS_FAILED), 4.0);

    let failed: u64 = summary.timeline.iter().map(|b| b.failed).sum();
    assert_eq!(failed, 4);
    // Iteration failures alone do not fail the run.
    assert!(summary.passed());
}

#[tokio::test]
async fn vu_init_error_aborts_before_any_iteration() {
    let (script, calls) = lifecycle(Fault::InitVu(2));
    let err = run(script, &per_vu(3, 1), RunConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::VuInit { vu: 2, .. }), "{err}");
    assert_eq!(calls.setup.load(Ordering::Relaxed), 0);
    assert_eq!(calls.iterations.load(Ordering::Relaxed), 0);
    assert_eq!(calls.teardown.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn vu_init_panic_is_reported_instead_of_hanging() {
    let (script, calls) = lifecycle(Fault::InitPanic(3));
    let err = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        run(script, &per_vu(4, 1), RunConfig::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    let Error::VuInit { vu, message } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(*vu, 3);
    assert!(message.contains("panicked"), "{message}");
    assert_eq!(calls.setup.load(Ordering::Relaxed), 0);
    assert_eq!(calls.iterations.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn setup_failure_skips_iterations_and_teardown() {
    let (script, calls) = lifecycle(Fault::Setup);
    let err = run(script, &per_vu(2, 1), RunConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Setup(_)), "{err}");
    assert!(err.to_string().contains("login service unavailable"));
    assert_eq!(calls.iterations.load(Ordering::Relaxed), 0);
    assert_eq!(calls.teardown.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn teardown_failure_marks_the_run_failed() {
    let (script, calls) = lifecycle(Fault::Teardown);
    let summary = run(script, &per_vu(1, 1), RunConfig::default())
        .await
        .unwrap();

    assert_eq!(calls.teardown.load(Ordering::Relaxed), 1);
    assert_eq!(summary.teardown_error.as_deref(), Some("cleanup failed"));
    assert!(!summary.passed());
}

#[tokio::test]
async fn configuration_errors_surface_before_init() {
    let cases = [
        json!({ "thresholds": { "http_req_duration": ["p95<500"] } }),
        json!({ "thresholds": { "http_req_duration": ["rate<0.1"] } }),
        json!({ "scenarios": { "a": { "executor": "constant-vus", "vus": 0, "duration": "1s" } } }),
        json!({ "scenarios": { "a": { "executor": "warp-speed" } } }),
    ];

    for case in cases {
        let (script, calls) = lifecycle(Fault::None);
        let opts = ScriptOptions::from_value(case.clone()).unwrap();
        let res = run(script, &opts, RunConfig::default()).await;
        assert!(res.is_err(), "{case}");
        assert_eq!(calls.init.load(Ordering::Relaxed), 0, "{case}");
    }
}

#[tokio::test]
async fn thresholds_are_evaluated_at_run_end() {
    let (script, _calls) = lifecycle(Fault::EveryOtherIteration);
    let opts = ScriptOptions::from_value(json!({
        "scenarios": {
            "main": { "executor": "shared-iterations", "vus": 2, "iterations": 10 }
        },
        "thresholds": {
            "iterations": ["count==10"],
            "iterations_failed{scenario:main}": ["count<1"],
            "iteration_duration": ["max<60000", "p(99.9)>=0"]
        }
    }))
    .unwrap();

    let summary = run(script, &opts, RunConfig::default()).await.unwrap();

    assert_eq!(summary.thresholds.len(), 4);
    let failed: Vec<_> = summary.failed_thresholds().collect();
    assert_eq!(failed.len(), 1, "{failed:?}");
    assert_eq!(failed[0].key, "iterations_failed{scenario:main}");
    assert!(failed[0].observed.is_some_and(|v| v > 0.0));
    assert!(!summary.passed());
}
