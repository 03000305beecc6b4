use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use swarm_metrics::{MetricId, MetricKind, Registry, TagSet};
use tokio::time::Instant;

use crate::request_metrics::millis;
use crate::vu::{GROUP_SEPARATOR, VuContext};
use crate::{Result, ScriptError};

pub const CHECKS: &str = "checks";
pub const GROUP_DURATION: &str = "group_duration";

#[derive(Debug, Clone, Copy)]
pub struct CheckMetricIds {
    pub checks: MetricId,
    /// Group duration in milliseconds.
    pub group_duration: MetricId,
}

impl CheckMetricIds {
    pub fn register(metrics: &Registry) -> Result<Self> {
        Ok(Self {
            checks: metrics.register(CHECKS, MetricKind::Rate)?,
            group_duration: metrics.register(GROUP_DURATION, MetricKind::Trend)?,
        })
    }

    pub fn record_check(&self, metrics: &Registry, tags: TagSet, passed: bool) {
        if let Some(h) = metrics.handle(self.checks, tags) {
            h.add_bool(passed);
        }
    }

    pub fn record_group(&self, metrics: &Registry, tags: TagSet, duration: Duration) {
        if let Some(h) = metrics.handle(self.group_duration, tags) {
            h.add(millis(duration));
        }
    }
}

/// Anything a check predicate may return.
///
/// A predicate that errors counts as a failed check; the error is logged, not raised.
pub trait CheckOutcome {
    fn into_outcome(self) -> std::result::Result<bool, String>;
}

impl CheckOutcome for bool {
    fn into_outcome(self) -> std::result::Result<bool, String> {
        Ok(self)
    }
}

impl<E: Display> CheckOutcome for std::result::Result<bool, E> {
    fn into_outcome(self) -> std::result::Result<bool, String> {
        self.map_err(|e| e.to_string())
    }
}

/// Builder form of [`VuContext::check`] for predicates of mixed return types.
#[must_use = "call `passed()` to read the combined result"]
pub struct Checks<'a, T: ?Sized> {
    ctx: &'a VuContext,
    value: &'a T,
    all_passed: bool,
}

impl<'a, T: ?Sized> Checks<'a, T> {
    /// Evaluates and records one named predicate.
    pub fn that<O: CheckOutcome>(mut self, name: &str, predicate: impl FnOnce(&T) -> O) -> Self {
        let passed = match predicate(self.value).into_outcome() {
            Ok(passed) => passed,
            Err(err) => {
                log::debug!("check `{name}` errored: {err}");
                false
            }
        };
        self.ctx.record_check(name, passed);
        self.all_passed &= passed;
        self
    }

    pub fn passed(&self) -> bool {
        self.all_passed
    }
}

impl VuContext {
    /// Evaluates every predicate against `value`, recording one `checks` sample each.
    /// Returns `true` when all passed. A failed check does not fail the iteration.
    pub fn check<T: ?Sized>(&self, value: &T, checks: &[(&str, &dyn Fn(&T) -> bool)]) -> bool {
        let mut all_passed = true;
        for (name, predicate) in checks {
            let passed = predicate(value);
            self.record_check(name, passed);
            all_passed &= passed;
        }
        all_passed
    }

    pub fn checks<'a, T: ?Sized>(&'a self, value: &'a T) -> Checks<'a, T> {
        Checks {
            ctx: self,
            value,
            all_passed: true,
        }
    }

    pub fn record_check(&self, name: &str, passed: bool) {
        let tags = self.tags(&[("check", name)]);
        self.shared
            .builtin
            .check
            .record_check(&self.shared.registry, tags, passed);
    }

    /// Runs `f` inside a named group and returns its result.
    ///
    /// Samples emitted inside carry the nested group path as their `group` tag, and the
    /// group's wall time is recorded as `group_duration`. Group names must be non-empty and
    /// must not contain `::`.
    pub async fn group<T, F, Fut>(&self, name: &str, f: F) -> std::result::Result<T, ScriptError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ScriptError>>,
    {
        if name.is_empty() || name.contains(GROUP_SEPARATOR) {
            return Err(ScriptError::new(format!(
                "invalid group name `{name}`: must be non-empty and not contain `{GROUP_SEPARATOR}`"
            )));
        }

        let guard = GroupGuard::enter(self, name);
        let started = Instant::now();
        let out = f().await;

        let tags = self.tags(&[]);
        self.shared
            .builtin
            .check
            .record_group(&self.shared.registry, tags, started.elapsed());
        drop(guard);
        out
    }
}

// Pops the group on every exit path, including cancellation of the iteration.
struct GroupGuard<'a> {
    ctx: &'a VuContext,
}

impl<'a> GroupGuard<'a> {
    fn enter(ctx: &'a VuContext, name: &str) -> Self {
        ctx.push_group(name);
        Self { ctx }
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.ctx.pop_group();
    }
}

#[cfg(test)]
mod tests {
    use swarm_metrics::Aggregate;

    use super::*;
    use crate::vu::testing;

    fn checks_rate(ctx: &VuContext, group: &str) -> Option<f64> {
        let id = ctx.shared.builtin.check.checks;
        ctx.metrics()
            .query(id)
            .where_eq("group", group)
            .aggregate()
            .and_then(|a| a.rate())
    }

    #[test]
    fn check_records_one_sample_per_predicate() {
        let ctx = testing::vu();
        let status = 200u16;
        let ok = ctx.check(
            &status,
            &[
                ("is 200", &|s: &u16| *s == 200),
                ("is 201", &|s: &u16| *s == 201),
            ],
        );
        assert!(!ok);
        assert_eq!(checks_rate(&ctx, ""), Some(0.5));

        let by_name = ctx
            .metrics()
            .query(ctx.shared.builtin.check.checks)
            .where_eq("check", "is 200")
            .aggregate();
        assert!(matches!(by_name, Some(Aggregate::Rate { total: 1, hits: 1 })));
    }

    #[test]
    fn errored_predicate_counts_as_failed() {
        let ctx = testing::vu();
        let body = "not json";
        let passed = ctx
            .checks(body)
            .that("non-empty", |b: &str| !b.is_empty())
            .that("is json", |b: &str| {
                serde_json::from_str::<serde_json::Value>(b).map(|_| true)
            })
            .passed();
        assert!(!passed);
        assert_eq!(checks_rate(&ctx, ""), Some(0.5));
    }

    #[tokio::test]
    async fn nested_groups_tag_samples_and_unwind_on_error() {
        let ctx = testing::vu();

        let res: std::result::Result<(), ScriptError> = ctx
            .group("A", || async {
                ctx.record_check("in a", true);
                ctx.group("B", || async {
                    assert_eq!(ctx.group_path(), "::A::B");
                    ctx.record_check("in b", false);
                    Err::<(), _>(ScriptError::new("boom"))
                })
                .await
            })
            .await;

        assert!(res.is_err());
        assert_eq!(ctx.group_path(), "");
        assert_eq!(checks_rate(&ctx, "::A"), Some(1.0));
        assert_eq!(checks_rate(&ctx, "::A::B"), Some(0.0));

        let durations = ctx
            .metrics()
            .query(ctx.shared.builtin.check.group_duration)
            .series_count();
        assert_eq!(durations, 2);
    }

    #[tokio::test]
    async fn cancelled_group_pops_its_path() {
        let ctx = testing::vu();
        let never = ctx.group("slow", || async {
            std::future::pending::<std::result::Result<(), ScriptError>>().await
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), never).await;
        assert!(timed_out.is_err());
        assert_eq!(ctx.group_path(), "");
    }

    #[tokio::test]
    async fn invalid_group_names_fail() {
        let ctx = testing::vu();
        for name in ["", "a::b"] {
            let res = ctx.group(name, || async { Ok(()) }).await;
            assert!(res.is_err(), "{name:?}");
        }
    }
}
