//! Run-scoped metrics registry.
//!
//! Metrics are registered once by name with a fixed [`MetricKind`]. Every distinct tag set
//! of a metric gets its own series, so concurrent writers only contend on the series they
//! touch. Reads merge series at query time.

pub mod agg;
pub mod error;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod tags;
pub mod trend;

pub use agg::{Aggregate, Query, TagFilter};
pub use error::{Error, Result};
pub use key::KeyId;
pub use metrics::{GaugeValue, MetricHandle, MetricKind, MetricSeriesSummary, MetricValue, Sample};
pub use registry::{MetricId, MetricInfo, Registry, is_valid_metric_name};
pub use tags::TagSet;
pub use trend::{EXACT_SAMPLE_LIMIT, Trend, TrendSummary};
