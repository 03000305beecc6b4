use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::registry::MetricId;
use crate::tags::TagSet;
use crate::trend::{Trend, TrendSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

/// One observation addressed to a registered metric.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: MetricId,
    pub tags: TagSet,
    pub value: f64,
    pub time: SystemTime,
}

impl Sample {
    pub fn new(metric: MetricId, tags: TagSet, value: f64) -> Self {
        Self {
            metric,
            tags,
            value,
            time: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricSeriesSummary {
    pub name: String,
    pub kind: MetricKind,
    pub tags: Vec<(String, String)>,
    pub values: MetricValue,
}

impl MetricSeriesSummary {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter { sum: f64 },
    Gauge(GaugeValue),
    Rate { total: u64, hits: u64 },
    Trend(TrendSummary),
}

impl MetricValue {
    /// Fraction of truthy samples for rate metrics.
    pub fn rate(&self) -> Option<f64> {
        match *self {
            MetricValue::Rate { total, hits } if total > 0 => Some(hits as f64 / total as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeValue {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub(crate) updated: SystemTime,
}

impl GaugeValue {
    pub(crate) fn merge(&mut self, other: &GaugeValue) {
        if other.updated >= self.updated {
            self.value = other.value;
            self.updated = other.updated;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// `f64` accumulator stored as bits in an `AtomicU64`.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

/// Hit and sample counts of a rate series, updated together so readers never see
/// `hits > total`.
#[derive(Debug, Default)]
pub struct RateState {
    counts: Mutex<RateCounts>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RateCounts {
    total: u64,
    hits: u64,
}

impl RateState {
    fn record(&self, hit: bool) {
        let mut c = self.counts.lock();
        c.total += 1;
        c.hits += u64::from(hit);
    }

    fn value(&self) -> MetricValue {
        let RateCounts { total, hits } = *self.counts.lock();
        MetricValue::Rate { total, hits }
    }
}

/// Per-series state. Counters are lock-free; the other kinds take a short per-series lock.
#[derive(Debug)]
pub(crate) enum SeriesStorage {
    Counter(Arc<AtomicF64>),
    Gauge(Arc<Mutex<Option<GaugeValue>>>),
    Rate(Arc<RateState>),
    Trend(Arc<Mutex<Trend>>),
}

impl SeriesStorage {
    pub(crate) fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => SeriesStorage::Counter(Arc::default()),
            MetricKind::Gauge => SeriesStorage::Gauge(Arc::default()),
            MetricKind::Rate => SeriesStorage::Rate(Arc::default()),
            MetricKind::Trend => SeriesStorage::Trend(Arc::default()),
        }
    }

    pub(crate) fn handle(&self) -> MetricHandle {
        match self {
            SeriesStorage::Counter(a) => MetricHandle::Counter(a.clone()),
            SeriesStorage::Gauge(a) => MetricHandle::Gauge(a.clone()),
            SeriesStorage::Rate(a) => MetricHandle::Rate(a.clone()),
            SeriesStorage::Trend(a) => MetricHandle::Trend(a.clone()),
        }
    }

    /// `None` for a gauge that was created but never set.
    pub(crate) fn value(&self) -> Option<MetricValue> {
        Some(match self {
            SeriesStorage::Counter(c) => MetricValue::Counter { sum: c.load() },
            SeriesStorage::Gauge(g) => MetricValue::Gauge((*g.lock())?),
            SeriesStorage::Rate(r) => r.value(),
            SeriesStorage::Trend(t) => MetricValue::Trend(t.lock().summary()),
        })
    }
}

/// Write handle for a single series.
#[derive(Debug, Clone)]
pub enum MetricHandle {
    Counter(Arc<AtomicF64>),
    Gauge(Arc<Mutex<Option<GaugeValue>>>),
    Rate(Arc<RateState>),
    Trend(Arc<Mutex<Trend>>),
}

impl MetricHandle {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricHandle::Counter(_) => MetricKind::Counter,
            MetricHandle::Gauge(_) => MetricKind::Gauge,
            MetricHandle::Rate(_) => MetricKind::Rate,
            MetricHandle::Trend(_) => MetricKind::Trend,
        }
    }

    /// Records `value` with kind-specific semantics:
    /// counters sum it (negative and non-finite values are dropped), gauges store it,
    /// rates count it as a hit when non-zero, trends observe it.
    #[inline]
    pub fn add(&self, value: f64) {
        self.add_at(value, SystemTime::now());
    }

    pub(crate) fn add_at(&self, value: f64, time: SystemTime) {
        match self {
            MetricHandle::Counter(c) => {
                if value.is_finite() && value >= 0.0 {
                    c.add(value);
                }
            }
            MetricHandle::Gauge(g) => {
                if !value.is_finite() {
                    return;
                }
                let mut g = g.lock();
                match g.as_mut() {
                    Some(cur) => {
                        cur.value = value;
                        cur.min = cur.min.min(value);
                        cur.max = cur.max.max(value);
                        cur.updated = cur.updated.max(time);
                    }
                    None => {
                        *g = Some(GaugeValue {
                            value,
                            min: value,
                            max: value,
                            updated: time,
                        });
                    }
                }
            }
            MetricHandle::Rate(r) => r.record(value != 0.0 && !value.is_nan()),
            MetricHandle::Trend(t) => t.lock().add(value),
        }
    }

    /// Rate shorthand. No-op on other kinds.
    #[inline]
    pub fn add_bool(&self, hit: bool) {
        if let MetricHandle::Rate(r) = self {
            r.record(hit);
        }
    }

    pub fn value(&self) -> Option<MetricValue> {
        match self {
            MetricHandle::Counter(c) => Some(MetricValue::Counter { sum: c.load() }),
            MetricHandle::Gauge(g) => (*g.lock()).map(MetricValue::Gauge),
            MetricHandle::Rate(r) => Some(r.value()),
            MetricHandle::Trend(t) => Some(MetricValue::Trend(t.lock().summary())),
        }
    }
}
