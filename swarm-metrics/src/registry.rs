use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::agg::Query;
use crate::error::{Error, Result};
use crate::key::{Interner, KeyId};
use crate::metrics::{MetricHandle, MetricKind, MetricSeriesSummary, Sample, SeriesStorage};
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricInfo {
    pub id: MetricId,
    pub name: Arc<str>,
    pub kind: MetricKind,
}

#[derive(Debug)]
struct MetricDef {
    name: KeyId,
    kind: MetricKind,
}

/// Registry of named metrics and their tagged series.
///
/// A name is bound to one kind for the lifetime of the registry. Series are created lazily
/// the first time a tag set is written.
#[derive(Debug, Default)]
pub struct Registry {
    interner: Interner,
    defs: RwLock<Vec<MetricDef>>,
    series: DashMap<MetricId, DashMap<TagSet, SeriesStorage>>,
}

pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 128
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` as `kind`, or returns the existing id if it already has that kind.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<MetricId> {
        if !is_valid_metric_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }

        let name_id = self.interner.intern(name);

        let mut defs = self.defs.write();
        if let Some((idx, def)) = defs.iter().enumerate().find(|(_, d)| d.name == name_id) {
            if def.kind != kind {
                return Err(Error::KindMismatch {
                    name: name.to_string(),
                    existing: def.kind,
                    requested: kind,
                });
            }
            return Ok(MetricId(idx as u32));
        }

        let id = MetricId(defs.len() as u32);
        defs.push(MetricDef {
            name: name_id,
            kind,
        });
        self.series.insert(id, DashMap::new());
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<MetricInfo> {
        let name_id = self.interner.get(name)?;
        let defs = self.defs.read();
        defs.iter()
            .position(|d| d.name == name_id)
            .and_then(|idx| self.info_locked(&defs, MetricId(idx as u32)))
    }

    pub fn info(&self, metric: MetricId) -> Option<MetricInfo> {
        let defs = self.defs.read();
        self.info_locked(&defs, metric)
    }

    pub fn kind(&self, metric: MetricId) -> Option<MetricKind> {
        self.defs.read().get(metric.0 as usize).map(|d| d.kind)
    }

    /// All registered metrics in registration order.
    pub fn metrics(&self) -> Vec<MetricInfo> {
        let defs = self.defs.read();
        (0..defs.len())
            .filter_map(|idx| self.info_locked(&defs, MetricId(idx as u32)))
            .collect()
    }

    fn info_locked(&self, defs: &[MetricDef], metric: MetricId) -> Option<MetricInfo> {
        let def = defs.get(metric.0 as usize)?;
        Some(MetricInfo {
            id: metric,
            name: self.interner.resolve(def.name)?,
            kind: def.kind,
        })
    }

    pub fn resolve_key(&self, key: &str) -> KeyId {
        self.interner.intern(key)
    }

    pub(crate) fn existing_key(&self, key: &str) -> Option<KeyId> {
        self.interner.get(key)
    }

    pub fn resolve_tags<K, V>(&self, tags: impl IntoIterator<Item = (K, V)>) -> TagSet
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        TagSet::from_pairs(
            tags.into_iter()
                .map(|(k, v)| (self.resolve_key(k.as_ref()), self.resolve_key(v.as_ref()))),
        )
    }

    pub fn tags_to_strings(&self, tags: &TagSet) -> Vec<(String, String)> {
        tags.iter()
            .map(|(k, v)| {
                (
                    self.interner
                        .resolve(k)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    self.interner
                        .resolve(v)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Returns the write handle of the `(metric, tags)` series, creating it on first use.
    pub fn handle(&self, metric: MetricId, tags: TagSet) -> Option<MetricHandle> {
        let kind = self.kind(metric)?;
        let series = self.series.get(&metric)?;

        if let Some(existing) = series.get(&tags) {
            return Some(existing.handle());
        }

        let handle = series
            .entry(tags)
            .or_insert_with(|| SeriesStorage::new(kind))
            .handle();
        Some(handle)
    }

    /// Ingests one sample. Returns `false` if the metric is unknown.
    pub fn record(&self, sample: &Sample) -> bool {
        match self.handle(sample.metric, sample.tags.clone()) {
            Some(h) => {
                h.add_at(sample.value, sample.time);
                true
            }
            None => false,
        }
    }

    pub(crate) fn visit_series(&self, metric: MetricId, mut f: impl FnMut(&TagSet, &SeriesStorage)) {
        let Some(series) = self.series.get(&metric) else {
            return;
        };
        for entry in series.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn query(&self, metric: MetricId) -> Query<'_> {
        Query::new(self, metric)
    }

    /// Point-in-time values of every series, sorted by metric name then tags.
    pub fn summarize(&self) -> Vec<MetricSeriesSummary> {
        let mut out = Vec::new();

        for info in self.metrics() {
            self.visit_series(info.id, |tags, storage| {
                let Some(values) = storage.value() else {
                    return;
                };
                out.push(MetricSeriesSummary {
                    name: info.name.to_string(),
                    kind: info.kind,
                    tags: self.tags_to_strings(tags),
                    values,
                });
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;

    #[test]
    fn register_is_idempotent_per_kind() {
        let reg = Registry::new();
        let a = reg
            .register("http_reqs", MetricKind::Counter)
            .unwrap_or_else(|e| panic!("{e}"));
        let b = reg
            .register("http_reqs", MetricKind::Counter)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a, b);
        assert_eq!(reg.metrics().len(), 1);

        let tags = reg.resolve_tags([("scenario", "default")]);
        let h1 = reg.handle(a, tags.clone()).unwrap_or_else(|| panic!("no handle"));
        let h2 = reg.handle(b, tags).unwrap_or_else(|| panic!("no handle"));
        h1.add(1.0);
        h2.add(2.0);
        assert_eq!(reg.summarize().len(), 1);
        assert_eq!(h1.value(), Some(MetricValue::Counter { sum: 3.0 }));
    }

    #[test]
    fn register_rejects_kind_mismatch() {
        let reg = Registry::new();
        reg.register("latency", MetricKind::Trend)
            .unwrap_or_else(|e| panic!("{e}"));

        let err = match reg.register("latency", MetricKind::Counter) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            Error::KindMismatch {
                existing: MetricKind::Trend,
                requested: MetricKind::Counter,
                ..
            }
        ));
        assert_eq!(
            reg.lookup("latency").map(|i| i.kind),
            Some(MetricKind::Trend)
        );
    }

    #[test]
    fn register_validates_names() {
        let reg = Registry::new();
        let too_long = "x".repeat(129);
        for bad in ["", "1abc", "has space", "dash-ed", too_long.as_str()] {
            assert!(matches!(
                reg.register(bad, MetricKind::Counter),
                Err(Error::InvalidName(_))
            ));
        }
        assert!(reg.register("_ok_1", MetricKind::Counter).is_ok());
    }

    #[test]
    fn record_sample_creates_series() {
        let reg = Registry::new();
        let id = reg
            .register("vus", MetricKind::Gauge)
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(reg.record(&Sample::new(id, TagSet::default(), 4.0)));

        let summary = reg.summarize();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].name, "vus");
        let MetricValue::Gauge(g) = &summary[0].values else {
            panic!("expected gauge");
        };
        assert_eq!(g.value, 4.0);
    }

    #[test]
    fn concurrent_first_writes_share_one_series() {
        let reg = Arc::new(Registry::new());
        let id = reg
            .register("checks", MetricKind::Rate)
            .unwrap_or_else(|e| panic!("{e}"));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let tags = reg.resolve_tags([("check", "status is 200")]);
                    for _ in 0..500 {
                        if let Some(h) = reg.handle(id, tags.clone()) {
                            h.add_bool(true);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap_or_else(|_| panic!("thread panicked"));
        }

        let summary = reg.summarize();
        assert_eq!(summary.len(), 1);
        assert_eq!(
            summary[0].values,
            MetricValue::Rate {
                total: 4000,
                hits: 4000
            }
        );
    }
}
