use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out exactly `total` iteration permits across all VUs of a scenario.
#[derive(Debug)]
pub struct IterationGate {
    remaining: AtomicU64,
    total: u64,
}

impl IterationGate {
    pub fn new(total: u64) -> Self {
        Self {
            remaining: AtomicU64::new(total),
            total,
        }
    }

    /// Claims one permit. `false` once all permits are gone.
    pub fn try_acquire(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn issued(&self) -> u64 {
        self.total - self.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hands_out_exactly_total_under_contention() {
        let gate = Arc::new(IterationGate::new(10_000));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    let mut got = 0u64;
                    while gate.try_acquire() {
                        got += 1;
                    }
                    got
                })
            })
            .collect();
        let total: u64 = threads
            .into_iter()
            .map(|t| t.join().unwrap_or_else(|_| panic!("thread panicked")))
            .sum();

        assert_eq!(total, 10_000);
        assert_eq!(gate.remaining(), 0);
        assert_eq!(gate.issued(), 10_000);
        assert!(!gate.try_acquire());
    }
}
