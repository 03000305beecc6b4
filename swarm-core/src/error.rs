pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to initialize VU {vu}: {message}")]
    VuInit { vu: u64, message: String },

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("invalid options document: {0}")]
    Options(#[from] serde_json::Error),

    #[error(transparent)]
    Metrics(#[from] swarm_metrics::Error),

    #[error("http client: {0}")]
    Http(#[from] swarm_http::Error),

    #[error("invalid threshold for metric `{metric}`: {error}")]
    Threshold { metric: String, error: String },

    #[error("scenario `{scenario}`: {source}")]
    Scenario {
        scenario: String,
        #[source]
        source: Box<Error>,
    },

    #[error("scenario names must be non-empty: `{0}`")]
    InvalidScenarioName(String),

    #[error("`vus` must be a positive integer")]
    InvalidVus,

    #[error("`iterations` must be a positive integer (and at least `vus` for shared-iterations)")]
    InvalidIterations,

    #[error(
        "invalid `executor` `{0}` (expected `shared-iterations`, `per-vu-iterations`, `constant-vus`, `ramping-vus`, `constant-arrival-rate`, or `ramping-arrival-rate`)"
    )]
    InvalidExecutor(String),

    #[error("`stages` must be a non-empty array of {{ duration, target }} with a positive total duration")]
    InvalidStages,

    #[error("`duration` must be a positive duration")]
    InvalidDuration,

    #[error("`rate` must be a positive integer")]
    InvalidRate,

    #[error("`timeUnit` must be a positive duration")]
    InvalidTimeUnit,

    #[error("`preAllocatedVUs` must be a positive integer")]
    InvalidPreAllocatedVus,

    #[error("`maxVUs` must be >= `preAllocatedVUs`")]
    InvalidMaxVus,
}

impl Error {
    pub(crate) fn in_scenario(self, scenario: &str) -> Self {
        Error::Scenario {
            scenario: scenario.to_string(),
            source: Box::new(self),
        }
    }
}
