use smallvec::SmallVec;

use crate::key::KeyId;
use crate::metrics::{GaugeValue, MetricKind, MetricValue, SeriesStorage};
use crate::registry::{MetricId, Registry};
use crate::tags::TagSet;
use crate::trend::Trend;

/// Series selector on tag values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    Eq(String, String),
    NotEq(String, String),
    Has(String),
    Missing(String),
}

// Filter resolved against the interner. Strings never interned cannot appear in any
// series, which lets the match collapse to a constant.
#[derive(Debug, Clone, Copy)]
enum Resolved {
    Eq(KeyId, KeyId),
    NotEq(KeyId, KeyId),
    Has(KeyId),
    Missing(KeyId),
    Always,
    Never,
}

impl Resolved {
    fn matches(&self, tags: &TagSet) -> bool {
        match *self {
            Resolved::Eq(k, v) => tags.get(k) == Some(v),
            Resolved::NotEq(k, v) => tags.get(k) != Some(v),
            Resolved::Has(k) => tags.get(k).is_some(),
            Resolved::Missing(k) => tags.get(k).is_none(),
            Resolved::Always => true,
            Resolved::Never => false,
        }
    }
}

/// Merged state of every series matched by a [`Query`].
#[derive(Debug, Clone)]
pub enum Aggregate {
    Counter { sum: f64 },
    Gauge(Option<GaugeValue>),
    Rate { total: u64, hits: u64 },
    Trend(Trend),
}

impl Aggregate {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Aggregate::Counter { sum: 0.0 },
            MetricKind::Gauge => Aggregate::Gauge(None),
            MetricKind::Rate => Aggregate::Rate { total: 0, hits: 0 },
            MetricKind::Trend => Aggregate::Trend(Trend::new()),
        }
    }

    fn absorb(&mut self, storage: &SeriesStorage) {
        match (self, storage) {
            (Aggregate::Counter { sum }, SeriesStorage::Counter(c)) => *sum += c.load(),
            (Aggregate::Gauge(acc), SeriesStorage::Gauge(g)) => {
                if let Some(g) = *g.lock() {
                    match acc {
                        Some(acc) => acc.merge(&g),
                        None => *acc = Some(g),
                    }
                }
            }
            (Aggregate::Rate { total, hits }, SeriesStorage::Rate(_)) => {
                if let Some(MetricValue::Rate {
                    total: t,
                    hits: h,
                }) = storage.value()
                {
                    *total += t;
                    *hits += h;
                }
            }
            (Aggregate::Trend(acc), SeriesStorage::Trend(t)) => acc.merge(&t.lock()),
            _ => {}
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Counter { .. } => MetricKind::Counter,
            Aggregate::Gauge(_) => MetricKind::Gauge,
            Aggregate::Rate { .. } => MetricKind::Rate,
            Aggregate::Trend(_) => MetricKind::Trend,
        }
    }

    /// Fraction of hits for rates. An empty rate is `0`.
    pub fn rate(&self) -> Option<f64> {
        match *self {
            Aggregate::Rate { total: 0, .. } => Some(0.0),
            Aggregate::Rate { total, hits } => Some(hits as f64 / total as f64),
            _ => None,
        }
    }

    pub fn trend(&self) -> Option<&Trend> {
        match self {
            Aggregate::Trend(t) => Some(t),
            _ => None,
        }
    }

    /// Summary form. `None` for a gauge that was never set.
    pub fn value(&self) -> Option<MetricValue> {
        Some(match self {
            Aggregate::Counter { sum } => MetricValue::Counter { sum: *sum },
            Aggregate::Gauge(g) => MetricValue::Gauge((*g)?),
            Aggregate::Rate { total, hits } => MetricValue::Rate {
                total: *total,
                hits: *hits,
            },
            Aggregate::Trend(t) => MetricValue::Trend(t.summary()),
        })
    }
}

/// Tag-filtered read over one metric.
#[derive(Debug, Clone)]
pub struct Query<'a> {
    registry: &'a Registry,
    metric: MetricId,
    filters: SmallVec<[Resolved; 4]>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(registry: &'a Registry, metric: MetricId) -> Self {
        Self {
            registry,
            metric,
            filters: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: &TagFilter) -> Self {
        let key = |k: &str| self.registry.existing_key(k);
        let resolved = match filter {
            TagFilter::Eq(k, v) => match (key(k), key(v)) {
                (Some(k), Some(v)) => Resolved::Eq(k, v),
                _ => Resolved::Never,
            },
            TagFilter::NotEq(k, v) => match (key(k), key(v)) {
                (Some(k), Some(v)) => Resolved::NotEq(k, v),
                _ => Resolved::Always,
            },
            TagFilter::Has(k) => key(k).map_or(Resolved::Never, Resolved::Has),
            TagFilter::Missing(k) => key(k).map_or(Resolved::Always, Resolved::Missing),
        };
        self.filters.push(resolved);
        self
    }

    #[must_use]
    pub fn where_eq(self, key: &str, value: &str) -> Self {
        self.filter(&TagFilter::Eq(key.to_string(), value.to_string()))
    }

    #[must_use]
    pub fn where_not_eq(self, key: &str, value: &str) -> Self {
        self.filter(&TagFilter::NotEq(key.to_string(), value.to_string()))
    }

    #[must_use]
    pub fn where_has(self, key: &str) -> Self {
        self.filter(&TagFilter::Has(key.to_string()))
    }

    #[must_use]
    pub fn where_missing(self, key: &str) -> Self {
        self.filter(&TagFilter::Missing(key.to_string()))
    }

    fn matches(&self, tags: &TagSet) -> bool {
        self.filters.iter().all(|f| f.matches(tags))
    }

    /// Number of series the filters select.
    pub fn series_count(&self) -> usize {
        let mut n = 0;
        self.registry.visit_series(self.metric, |tags, _| {
            if self.matches(tags) {
                n += 1;
            }
        });
        n
    }

    /// Merges all matching series. `None` if the metric is not registered.
    pub fn aggregate(&self) -> Option<Aggregate> {
        let kind = self.registry.kind(self.metric)?;
        let mut acc = Aggregate::empty(kind);
        self.registry.visit_series(self.metric, |tags, storage| {
            if self.matches(tags) {
                acc.absorb(storage);
            }
        });
        Some(acc)
    }
}
