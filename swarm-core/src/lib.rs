//! Load-testing engine core: scenario scheduling, VU runtime, thresholds and run summary.

mod check;
mod config;
mod error;
mod http;
mod iteration_metrics;
mod metrics_context;
mod options;
mod request_metrics;
mod run;
mod scenarios;
mod script;
mod summary;
mod thresholds;
mod thresholds_eval;
mod timeline;
mod vu;

pub mod runner;

pub use check::{CHECKS, CheckMetricIds, CheckOutcome, Checks, GROUP_DURATION};
pub use config::{
    AbortMode, DEFAULT_EXEC, DEFAULT_GRACEFUL_RAMP_DOWN, DEFAULT_GRACEFUL_STOP,
    DEFAULT_MAX_DURATION, DEFAULT_RAMP_TICK, DEFAULT_SCENARIO, DEFAULT_SETUP_TIMEOUT,
    DEFAULT_THRESHOLD_INTERVAL, DEFAULT_TIME_UNIT, RunConfig, ScenarioConfig, ScenarioExecutor,
    ScenarioExecutorKind, Stage,
};
pub use error::{Error, Result};
pub use self::http::{Http, Params};
pub use iteration_metrics::{
    DROPPED_ITERATIONS, ITERATION_DURATION, ITERATIONS, ITERATIONS_FAILED, IterationMetricIds,
    VUS, VUS_MAX,
};
pub use metrics_context::{BuiltinMetrics, MetricsContext};
pub use options::{ScenarioOptions, ScriptOptions, ThresholdEntry, ThresholdObject, ThresholdOptions};
pub use request_metrics::{
    DATA_RECEIVED, DATA_SENT, HTTP_REQ_BLOCKED, HTTP_REQ_CONNECTING, HTTP_REQ_DURATION,
    HTTP_REQ_FAILED, HTTP_REQ_RECEIVING, HTTP_REQ_SENDING, HTTP_REQ_TLS_HANDSHAKING,
    HTTP_REQ_WAITING, HTTP_REQS, RequestMetricIds,
};
pub use run::{Run, run};
pub use runner::StopHandle;
pub use scenarios::scenarios_from_options;
pub use script::{Script, ScriptError};
pub use summary::{CheckSummary, MetricSummary, RunSummary};
pub use thresholds::{
    ThresholdAgg, ThresholdExpr, ThresholdOp, ThresholdSet, parse_threshold_expr,
    parse_threshold_key, parse_thresholds, validate_thresholds,
};
pub use thresholds_eval::{ThresholdOutcome, evaluate_thresholds};
pub use timeline::{IterationTimeline, TimelineBucket};
pub use vu::{CustomMetric, ExecutionInfo, GROUP_SEPARATOR, ScenarioInfo, VuContext, VuInitInfo};

pub use swarm_http::{HttpClientOptions, HttpResponse, HttpTransportErrorKind, Timings};
pub use swarm_metrics::{MetricKind, MetricValue, Registry, TagFilter};
