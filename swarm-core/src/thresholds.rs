use std::collections::BTreeMap;
use std::time::Duration;

use swarm_metrics::{MetricKind, Registry, TagFilter, is_valid_metric_name};

use crate::options::{ThresholdEntry, ThresholdOptions};
use crate::{Error, Result};

/// All expressions declared for one `metric{tag:value,...}` key.
#[derive(Debug, Clone)]
pub struct ThresholdSet {
    /// The key as written in the options document.
    pub key: String,
    pub metric: String,
    pub filters: Vec<TagFilter>,
    pub expressions: Vec<ThresholdExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    StrictEq,
    NotEq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdAgg {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    P(f64),
}

impl ThresholdAgg {
    /// Whether this aggregator can be computed for metrics of `kind`.
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value | Self::Min | Self::Max),
            MetricKind::Rate => matches!(self, Self::Rate),
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::P(_)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    /// The expression as written, e.g. `p(95)<500`.
    pub source: String,
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    pub value: f64,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

pub fn parse_threshold_expr(raw: &str) -> std::result::Result<ThresholdExpr, String> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty threshold".to_string());
    }

    // Longer tokens first so `<=` is not read as `<`.
    let ops = [
        ("===", ThresholdOp::StrictEq),
        ("!=", ThresholdOp::NotEq),
        ("<=", ThresholdOp::Lte),
        (">=", ThresholdOp::Gte),
        ("==", ThresholdOp::Eq),
        ("<", ThresholdOp::Lt),
        (">", ThresholdOp::Gt),
    ];
    let (op_pos, op_len, op) = ops
        .iter()
        .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
        .ok_or_else(|| format!("invalid threshold (missing operator): {raw}"))?;

    let (left, right_with_op) = s.split_at(op_pos);
    let right = &right_with_op[op_len..];
    if left.is_empty() || right.is_empty() {
        return Err(format!("invalid threshold: {raw}"));
    }

    let agg = match left.to_ascii_lowercase().as_str() {
        "avg" => ThresholdAgg::Avg,
        "min" => ThresholdAgg::Min,
        "max" => ThresholdAgg::Max,
        "med" => ThresholdAgg::Med,
        "count" => ThresholdAgg::Count,
        "rate" => ThresholdAgg::Rate,
        "value" => ThresholdAgg::Value,
        other => {
            let Some(inner) = other.strip_prefix("p(").and_then(|v| v.strip_suffix(')')) else {
                return Err(format!("unknown aggregation `{left}` in threshold: {raw}"));
            };
            let p: f64 = inner
                .parse()
                .map_err(|_| format!("invalid percentile in threshold: {raw}"))?;
            if !(p > 0.0 && p <= 100.0) {
                return Err(format!("percentile out of range in threshold: {raw}"));
            }
            ThresholdAgg::P(p)
        }
    };

    let value: f64 = right
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| format!("invalid numeric value in threshold: {raw}"))?;

    Ok(ThresholdExpr {
        source: raw.trim().to_string(),
        agg,
        op,
        value,
        abort_on_fail: false,
        delay_abort_eval: None,
    })
}

/// Splits `metric{tag:value,...}` into the metric name and its series filters.
pub fn parse_threshold_key(raw: &str) -> std::result::Result<(String, Vec<TagFilter>), String> {
    let raw = raw.trim();
    let (metric, filters) = match raw.find('{') {
        None => (raw, Vec::new()),
        Some(open) => {
            let inner = raw[open + 1..]
                .strip_suffix('}')
                .ok_or_else(|| format!("unterminated tag filter in `{raw}`"))?;
            let mut filters = Vec::new();
            for part in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (k, v) = part
                    .split_once(':')
                    .ok_or_else(|| format!("tag filter `{part}` must be `key:value`"))?;
                let k = k.trim();
                if k.is_empty() {
                    return Err(format!("empty tag name in `{raw}`"));
                }
                filters.push(TagFilter::Eq(k.to_string(), v.trim().to_string()));
            }
            (raw[..open].trim_end(), filters)
        }
    };

    if !is_valid_metric_name(metric) {
        return Err(format!("invalid metric name `{metric}`"));
    }
    Ok((metric.to_string(), filters))
}

/// Parses every threshold of an options document. Malformed entries are configuration errors.
pub fn parse_thresholds(raw: &BTreeMap<String, ThresholdOptions>) -> Result<Vec<ThresholdSet>> {
    let mut out = Vec::with_capacity(raw.len());
    for (key, entries) in raw {
        let invalid = |error: String| Error::Threshold {
            metric: key.clone(),
            error,
        };

        let (metric, filters) = parse_threshold_key(key).map_err(invalid)?;
        let mut expressions = Vec::new();
        for entry in entries.entries() {
            let expr = match entry {
                ThresholdEntry::Expr(s) => parse_threshold_expr(&s).map_err(invalid)?,
                ThresholdEntry::Object(obj) => ThresholdExpr {
                    abort_on_fail: obj.abort_on_fail,
                    delay_abort_eval: obj.delay_abort_eval,
                    ..parse_threshold_expr(&obj.threshold).map_err(invalid)?
                },
            };
            expressions.push(expr);
        }

        out.push(ThresholdSet {
            key: key.clone(),
            metric,
            filters,
            expressions,
        });
    }
    Ok(out)
}

/// Rejects aggregators that can never apply to an already-registered metric.
pub fn validate_thresholds(sets: &[ThresholdSet], metrics: &Registry) -> Result<()> {
    for set in sets {
        let Some(info) = metrics.lookup(&set.metric) else {
            continue;
        };
        if let Some(expr) = set.expressions.iter().find(|e| !e.agg.applies_to(info.kind)) {
            return Err(Error::Threshold {
                metric: set.key.clone(),
                error: format!("`{}` does not apply to {} metrics", expr.source, info.kind),
            });
        }
    }
    Ok(())
}
