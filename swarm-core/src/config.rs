use serde::Deserialize;
use std::time::Duration;

use crate::MetricsContext;
use crate::options::de_duration;
use swarm_http::HttpClientOptions;

pub const DEFAULT_EXEC: &str = "default";
pub const DEFAULT_SCENARIO: &str = "default";
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_TIME_UNIT: Duration = Duration::from_secs(1);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RAMP_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Stage {
    #[serde(deserialize_with = "de_duration")]
    pub duration: Duration,
    pub target: u64,
}

/// What a run-level stop does to iterations already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AbortMode {
    /// Stop starting iterations and let in-flight ones finish within `gracefulStop`.
    #[default]
    Graceful,
    /// Interrupt in-flight iterations immediately.
    Hard,
}

/// Run-time settings supplied by the host, outside the options document.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Overrides for the top-level `vus` / `iterations` / `duration` shortcuts.
    pub iterations: Option<u64>,
    pub vus: Option<u64>,
    pub duration: Option<Duration>,

    pub abort_mode: AbortMode,
    pub threshold_interval: Duration,
    pub ramp_tick: Duration,
    /// Stops the whole run once elapsed.
    pub max_duration: Option<Duration>,
    /// Interrupts any single iteration running longer than this.
    pub iteration_timeout: Option<Duration>,
    pub http: HttpClientOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: None,
            vus: None,
            duration: None,
            abort_mode: AbortMode::default(),
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
            ramp_tick: DEFAULT_RAMP_TICK,
            max_duration: None,
            iteration_timeout: None,
            http: HttpClientOptions::default(),
        }
    }
}

impl RunConfig {
    pub(crate) fn has_shape_overrides(&self) -> bool {
        self.vus.is_some() || self.iterations.is_some() || self.duration.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioExecutor {
    /// A fixed number of iterations shared by all VUs.
    SharedIterations {
        vus: u64,
        iterations: u64,
        max_duration: Duration,
    },

    /// Every VU runs exactly `iterations` iterations.
    PerVuIterations {
        vus: u64,
        iterations: u64,
        max_duration: Duration,
    },

    ConstantVus {
        vus: u64,
        duration: Duration,
    },

    /// Ramp the number of active VUs up/down over time.
    RampingVus {
        start_vus: u64,
        stages: Vec<Stage>,
        graceful_ramp_down: Duration,
    },

    /// Open-model arrival rate (iterations started per `time_unit`).
    ConstantArrivalRate {
        rate: u64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
    },

    /// Open-model arrival rate, with ramping stages.
    RampingArrivalRate {
        start_rate: u64,
        time_unit: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
        stages: Vec<Stage>,
    },
}

impl ScenarioExecutor {
    pub fn kind(&self) -> ScenarioExecutorKind {
        match self {
            Self::SharedIterations { .. } => ScenarioExecutorKind::SharedIterations,
            Self::PerVuIterations { .. } => ScenarioExecutorKind::PerVuIterations,
            Self::ConstantVus { .. } => ScenarioExecutorKind::ConstantVus,
            Self::RampingVus { .. } => ScenarioExecutorKind::RampingVus,
            Self::ConstantArrivalRate { .. } => ScenarioExecutorKind::ConstantArrivalRate,
            Self::RampingArrivalRate { .. } => ScenarioExecutorKind::RampingArrivalRate,
        }
    }

    /// Number of VUs the scenario initializes up front.
    pub fn max_vus(&self) -> u64 {
        match self {
            Self::SharedIterations { vus, .. }
            | Self::PerVuIterations { vus, .. }
            | Self::ConstantVus { vus, .. } => *vus,
            Self::RampingVus {
                start_vus, stages, ..
            } => stages
                .iter()
                .map(|st| st.target)
                .max()
                .unwrap_or(0)
                .max(*start_vus),
            Self::ConstantArrivalRate { max_vus, .. } | Self::RampingArrivalRate { max_vus, .. } => {
                *max_vus
            }
        }
    }

    /// How long the executor keeps starting iterations, not counting `gracefulStop`.
    pub fn work_window(&self) -> Duration {
        match self {
            Self::SharedIterations { max_duration, .. }
            | Self::PerVuIterations { max_duration, .. } => *max_duration,
            Self::ConstantVus { duration, .. } | Self::ConstantArrivalRate { duration, .. } => {
                *duration
            }
            Self::RampingVus { stages, .. } | Self::RampingArrivalRate { stages, .. } => {
                total_stage_duration(stages)
            }
        }
    }
}

pub(crate) fn total_stage_duration(stages: &[Stage]) -> Duration {
    stages
        .iter()
        .fold(Duration::ZERO, |acc, st| acc.saturating_add(st.duration))
}

/// Scenario executor kind (the string form used in options documents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::Display)]
pub enum ScenarioExecutorKind {
    #[strum(to_string = "shared-iterations")]
    SharedIterations,

    #[strum(to_string = "per-vu-iterations")]
    PerVuIterations,

    #[strum(to_string = "constant-vus", serialize = "constant")]
    ConstantVus,

    #[strum(to_string = "ramping-vus")]
    RampingVus,

    #[strum(to_string = "constant-arrival-rate")]
    ConstantArrivalRate,

    #[strum(to_string = "ramping-arrival-rate", serialize = "ramping-rps")]
    RampingArrivalRate,
}

impl ScenarioExecutorKind {
    #[must_use]
    pub fn is_arrival_rate(self) -> bool {
        matches!(self, Self::ConstantArrivalRate | Self::RampingArrivalRate)
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub exec: String,
    pub metrics_ctx: MetricsContext,
    pub executor: ScenarioExecutor,
    pub start_time: Duration,
    pub graceful_stop: Duration,
}

impl ScenarioConfig {
    pub fn name(&self) -> &str {
        self.metrics_ctx.scenario().unwrap_or(DEFAULT_SCENARIO)
    }
}
