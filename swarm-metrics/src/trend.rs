use std::sync::OnceLock;

use hdrhistogram::Histogram;

/// Number of raw samples a trend keeps before switching to a histogram sketch.
pub const EXACT_SAMPLE_LIMIT: usize = 10_000;

// Sketch values are recorded as integers in thousandths of the input unit.
const SKETCH_SCALE: f64 = 1000.0;
const SKETCH_SIGFIGS: u8 = 3;

/// Distribution of observed values.
///
/// Count, sum, min and max are always exact. Percentiles are exact (linear interpolation
/// between closest ranks) while at most [`EXACT_SAMPLE_LIMIT`] samples were added. After
/// that the samples move into an HDR histogram with 3 significant digits, which bounds the
/// percentile error to 0.1% of the value (plus 0.001 absolute from integer scaling).
/// Negative values are clamped to zero in the sketch.
#[derive(Debug, Clone)]
pub struct Trend {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    Exact(Vec<f64>),
    Sketch(Histogram<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendSummary {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl Default for Trend {
    fn default() -> Self {
        Self::new()
    }
}

impl Trend {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            repr: Repr::Exact(Vec::new()),
        }
    }

    /// Adds one observation. Non-finite values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if matches!(&self.repr, Repr::Exact(values) if values.len() >= EXACT_SAMPLE_LIMIT) {
            self.promote();
        }
        match &mut self.repr {
            Repr::Exact(values) => values.push(value),
            Repr::Sketch(h) => record(h, value),
        }
    }

    /// Folds another trend into this one.
    pub fn merge(&mut self, other: &Trend) {
        if other.count == 0 {
            return;
        }

        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);

        let fits = match (&self.repr, &other.repr) {
            (Repr::Exact(a), Repr::Exact(b)) => a.len() + b.len() <= EXACT_SAMPLE_LIMIT,
            _ => false,
        };

        if !fits {
            self.promote();
        }

        let adopted = match (&mut self.repr, &other.repr) {
            (Repr::Exact(a), Repr::Exact(b)) => {
                a.extend_from_slice(b);
                None
            }
            (Repr::Sketch(h), Repr::Exact(b)) => {
                b.iter().for_each(|v| record(h, *v));
                None
            }
            (Repr::Sketch(h), Repr::Sketch(o)) => {
                // Auto-resizing histograms accept any range.
                let _ = h.add(o);
                None
            }
            // Only reachable when this trend could not build its own sketch.
            (Repr::Exact(a), Repr::Sketch(o)) => {
                let mut h = o.clone();
                a.iter().for_each(|v| record(&mut h, *v));
                Some(h)
            }
        };
        if let Some(h) = adopted {
            self.repr = Repr::Sketch(h);
        }
    }

    /// Moves the raw samples into a histogram. Keeps them exact if no histogram can be built.
    fn promote(&mut self) {
        if let Repr::Exact(values) = &self.repr
            && let Some(mut sketch) = new_sketch()
        {
            for v in values {
                record(&mut sketch, *v);
            }
            self.repr = Repr::Sketch(sketch);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.repr, Repr::Exact(_))
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn med(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Returns the `p`-th percentile, `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentile_in(self.sorted().as_deref(), p)
    }

    /// Sorted copy of the raw samples. `None` once they moved into the histogram.
    fn sorted(&self) -> Option<Vec<f64>> {
        match &self.repr {
            Repr::Exact(values) => {
                let mut sorted = values.clone();
                sorted.sort_by(f64::total_cmp);
                Some(sorted)
            }
            Repr::Sketch(_) => None,
        }
    }

    fn percentile_in(&self, sorted: Option<&[f64]>, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        match (&self.repr, sorted) {
            (Repr::Exact(_), Some(sorted)) => interpolate(sorted, p),
            (Repr::Sketch(h), _) => {
                let v = h.value_at_quantile(p / 100.0) as f64 / SKETCH_SCALE;
                Some(v.clamp(self.min.max(0.0), self.max.max(0.0)))
            }
            (Repr::Exact(_), None) => None,
        }
    }

    pub fn summary(&self) -> TrendSummary {
        let sorted = self.sorted();
        let pct = |p| self.percentile_in(sorted.as_deref(), p);
        TrendSummary {
            count: self.count,
            min: self.min(),
            max: self.max(),
            avg: self.avg(),
            med: pct(50.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
        }
    }
}

fn interpolate(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = p / 100.0 * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let (a, b) = (sorted.get(lo)?, sorted.get(hi)?);
    Some(a + (b - a) * (rank - lo as f64))
}

// Built once and cloned for every trend that outgrows its raw samples.
fn new_sketch() -> Option<Histogram<u64>> {
    static TEMPLATE: OnceLock<Option<Histogram<u64>>> = OnceLock::new();
    TEMPLATE
        .get_or_init(|| Histogram::new(SKETCH_SIGFIGS).ok())
        .clone()
}

fn record(h: &mut Histogram<u64>, value: f64) {
    let scaled = (value.max(0.0) * SKETCH_SCALE).round() as u64;
    let _ = h.record(scaled);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Option<f64>, b: f64, tol: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() <= tol)
    }

    #[test]
    fn empty_trend_has_no_stats() {
        let t = Trend::new();
        let s = t.summary();
        assert_eq!(s.count, 0);
        assert!(s.min.is_none());
        assert!(s.max.is_none());
        assert!(s.avg.is_none());
        assert!(s.med.is_none());
        assert!(t.percentile(95.0).is_none());
    }

    #[test]
    fn ten_values_are_exact() {
        let mut t = Trend::new();
        for v in (1..=10).map(|i| f64::from(i) * 10.0) {
            t.add(v);
        }

        assert!(t.is_exact());
        assert_eq!(t.min(), Some(10.0));
        assert_eq!(t.max(), Some(100.0));
        assert_eq!(t.avg(), Some(55.0));
        assert!(approx(t.med(), 55.0, 1e-9));
        assert!(approx(t.percentile(0.0), 10.0, 1e-9));
        assert!(approx(t.percentile(100.0), 100.0, 1e-9));
        assert!(approx(t.percentile(90.0), 91.0, 1e-9));
    }

    #[test]
    fn out_of_range_percentile_is_none() {
        let mut t = Trend::new();
        t.add(1.0);
        assert!(t.percentile(-1.0).is_none());
        assert!(t.percentile(100.5).is_none());
    }

    #[test]
    fn switches_to_sketch_and_stays_within_error_bound() {
        let mut t = Trend::new();
        let n = EXACT_SAMPLE_LIMIT * 5;
        for i in 1..=n {
            t.add(i as f64);
        }

        assert!(!t.is_exact());
        assert_eq!(t.count(), n as u64);
        assert_eq!(t.min(), Some(1.0));
        assert_eq!(t.max(), Some(n as f64));

        let p50 = n as f64 * 0.5;
        let p99 = n as f64 * 0.99;
        assert!(approx(t.percentile(50.0), p50, p50 * 0.001 + 1.0));
        assert!(approx(t.percentile(99.0), p99, p99 * 0.001 + 1.0));
    }

    #[test]
    fn merge_combines_exact_and_sketch() {
        let mut a = Trend::new();
        let mut b = Trend::new();
        for i in 0..100 {
            a.add(f64::from(i));
        }
        for _ in 0..EXACT_SAMPLE_LIMIT {
            b.add(500.0);
        }

        let mut merged = Trend::new();
        merged.merge(&a);
        assert!(merged.is_exact());
        merged.merge(&b);
        assert!(!merged.is_exact());
        assert_eq!(merged.count(), 100 + EXACT_SAMPLE_LIMIT as u64);
        assert_eq!(merged.min(), Some(0.0));
        assert_eq!(merged.max(), Some(500.0));
        assert!(approx(merged.med(), 500.0, 0.5));
    }

    #[test]
    fn summary_matches_individual_percentiles() {
        let mut t = Trend::new();
        for v in [7.0, 1.0, 9.0, 3.0, 5.0] {
            t.add(v);
        }
        let s = t.summary();
        assert_eq!(s.med, t.med());
        assert_eq!(s.p90, t.percentile(90.0));
        assert_eq!(s.p95, t.percentile(95.0));
        assert_eq!(s.p99, t.percentile(99.0));
        assert!(approx(s.med, 5.0, 1e-9));
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let mut t = Trend::new();
        t.add(f64::NAN);
        t.add(f64::INFINITY);
        assert!(t.is_empty());
    }
}
