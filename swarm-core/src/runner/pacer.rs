use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::schedule::RampingSchedule;

#[derive(Debug)]
struct PacerState {
    /// Starts granted but not yet claimed by a VU.
    pending: u64,
    /// Activated VUs that are not running an iteration.
    idle: u64,
    /// VU slots `1..=active` may claim starts.
    active: u64,
    done: bool,
}

/// Hands iteration starts of an arrival-rate scenario to a VU pool that grows on demand.
///
/// A start that finds no idle VU activates one more VU, up to `max_vus`; past that the start
/// is dropped and counted. The pool never shrinks during a scenario.
#[derive(Debug)]
pub struct ArrivalPacer {
    state: Mutex<PacerState>,
    max_vus: u64,
    dropped: AtomicU64,
    notify: Notify,
}

impl ArrivalPacer {
    pub fn new(pre_allocated_vus: u64, max_vus: u64) -> Self {
        let active = pre_allocated_vus.min(max_vus);
        Self {
            state: Mutex::new(PacerState {
                pending: 0,
                idle: active,
                active,
                done: false,
            }),
            max_vus,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Grants `n` iteration starts. Returns how many of them were dropped.
    pub fn due(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }

        let mut dropped = 0;
        {
            let mut st = self.state.lock();
            if st.done {
                return 0;
            }
            for _ in 0..n {
                if st.pending < st.idle {
                    st.pending += 1;
                } else if st.active < self.max_vus {
                    st.active += 1;
                    st.idle += 1;
                    st.pending += 1;
                } else {
                    dropped += 1;
                }
            }
        }

        if dropped != 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        dropped
    }

    /// Waits until VU `slot` (1-based) may start an iteration. `false` once finished.
    pub async fn claim(&self, slot: u64) -> bool {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.done {
                    return false;
                }
                if slot <= st.active && st.pending > 0 {
                    st.pending -= 1;
                    st.idle = st.idle.saturating_sub(1);
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Marks a claimed iteration as finished; the VU is idle again.
    pub fn release(&self) {
        let mut st = self.state.lock();
        st.idle = (st.idle + 1).min(st.active);
    }

    /// No further starts. Waiting VUs return from `claim` with `false`.
    ///
    /// Starts granted but never claimed are counted as dropped; returns how many.
    pub fn finish(&self) -> u64 {
        let unclaimed = {
            let mut st = self.state.lock();
            if st.done {
                return 0;
            }
            st.done = true;
            std::mem::take(&mut st.pending)
        };
        if unclaimed != 0 {
            self.dropped.fetch_add(unclaimed, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        unclaimed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn active_vus(&self) -> u64 {
        self.state.lock().active
    }

    pub fn max_vus(&self) -> u64 {
        self.max_vus
    }
}

/// Turns an iterations-per-`time_unit` schedule into whole iteration starts.
#[derive(Debug)]
pub struct ArrivalClock {
    schedule: RampingSchedule,
    time_unit: Duration,
    carry: f64,
    last: Duration,
}

impl ArrivalClock {
    pub fn new(schedule: RampingSchedule, time_unit: Duration) -> Self {
        // A non-zero starting rate starts its first iteration immediately.
        let carry = if schedule.value_at(Duration::ZERO) > 0.0 {
            1.0
        } else {
            0.0
        };
        Self {
            schedule,
            time_unit,
            carry,
            last: Duration::ZERO,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.schedule.total_duration()
    }

    /// Starts due between the previous call and `elapsed` (measured from scenario start).
    pub fn advance(&mut self, elapsed: Duration) -> u64 {
        let elapsed = elapsed.min(self.schedule.total_duration());
        if elapsed > self.last {
            let dt = (elapsed - self.last).as_secs_f64();
            // Midpoint rate over the step keeps ramps exact for linear stages.
            let mid = self.last + (elapsed - self.last) / 2;
            let rate = self.schedule.value_at(mid) / self.time_unit.as_secs_f64();
            self.carry += rate * dt;
            self.last = elapsed;
        }

        let due = self.carry.floor();
        self.carry -= due;
        if due <= 0.0 { 0 } else { due as u64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use std::sync::Arc;

    #[test]
    fn constant_rate_emits_expected_count() {
        let mut clock = ArrivalClock::new(
            RampingSchedule::constant(10, Duration::from_secs(1)),
            Duration::from_secs(1),
        );

        let mut total = clock.advance(Duration::ZERO);
        assert_eq!(total, 1);
        for ms in (10..1_000).step_by(10) {
            total += clock.advance(Duration::from_millis(ms));
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn time_unit_scales_rate() {
        let mut clock = ArrivalClock::new(
            RampingSchedule::constant(30, Duration::from_secs(60)),
            Duration::from_secs(60),
        );
        let mut total = 0;
        for s in 0..60 {
            total += clock.advance(Duration::from_secs(s));
        }
        assert_eq!(total, 30);
    }

    #[test]
    fn ramp_integrates_area_under_curve() {
        // 0 -> 10/s over 10s: 50 starts.
        let mut clock = ArrivalClock::new(
            RampingSchedule::new(
                0,
                vec![Stage {
                    duration: Duration::from_secs(10),
                    target: 10,
                }],
            ),
            Duration::from_secs(1),
        );
        let mut total = clock.advance(Duration::ZERO);
        assert_eq!(total, 0);
        for ms in (10..=10_000).step_by(10) {
            total += clock.advance(Duration::from_millis(ms));
        }
        assert!((49..=50).contains(&total), "total={total}");
    }

    #[tokio::test]
    async fn grows_pool_then_drops() {
        let pacer = ArrivalPacer::new(1, 2);

        assert_eq!(pacer.due(1), 0);
        assert!(pacer.claim(1).await);
        assert_eq!(pacer.active_vus(), 1);

        // VU 1 is busy, so the next start activates VU 2.
        assert_eq!(pacer.due(1), 0);
        assert_eq!(pacer.active_vus(), 2);
        assert!(pacer.claim(2).await);

        // Both busy and the pool is at max.
        assert_eq!(pacer.due(3), 3);
        assert_eq!(pacer.dropped(), 3);

        pacer.release();
        assert_eq!(pacer.due(1), 0);
        assert!(pacer.claim(1).await);
        assert_eq!(pacer.active_vus(), 2);
    }

    #[tokio::test]
    async fn finish_releases_waiters() {
        let pacer = Arc::new(ArrivalPacer::new(1, 1));
        let waiter = {
            let pacer = pacer.clone();
            tokio::spawn(async move { pacer.claim(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pacer.finish();
        let claimed = waiter.await.unwrap_or_else(|e| panic!("{e}"));
        assert!(!claimed);
        assert_eq!(pacer.due(5), 0);
    }

    #[tokio::test]
    async fn unclaimed_starts_are_dropped_on_finish() {
        let pacer = ArrivalPacer::new(3, 3);
        assert_eq!(pacer.due(3), 0);
        assert!(pacer.claim(1).await);

        assert_eq!(pacer.finish(), 2);
        assert_eq!(pacer.dropped(), 2);
        assert_eq!(pacer.finish(), 0);
        assert!(!pacer.claim(2).await);
    }

    #[tokio::test]
    async fn inactive_slot_cannot_claim() {
        let pacer = ArrivalPacer::new(1, 4);
        pacer.due(1);
        let r = tokio::time::timeout(Duration::from_millis(20), pacer.claim(3)).await;
        assert!(r.is_err());
        assert!(pacer.claim(1).await);
    }
}
