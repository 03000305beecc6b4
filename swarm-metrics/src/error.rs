use crate::metrics::MetricKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid metric name `{0}`: expected [a-zA-Z_][a-zA-Z0-9_]* up to 128 chars")]
    InvalidName(String),

    #[error("metric `{name}` is already registered as {existing}, cannot register it as {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
