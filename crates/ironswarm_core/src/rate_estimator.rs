use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct CountSnapshot {
    count: u64,
    instant: Instant,
}

/// Estimates an event rate (e.g. journey starts per second) over a sliding
/// time window of once-per-second snapshots.
pub struct RateEstimator {
    latest_per_second_snapshots: Mutex<VecDeque<CountSnapshot>>,
    per_second_milli: AtomicU64,
}

impl RateEstimator {
    pub fn new(window_seconds: usize) -> Self {
        assert!(window_seconds > 1);
        Self {
            latest_per_second_snapshots: Mutex::new(VecDeque::with_capacity(window_seconds)),
            per_second_milli: Default::default(),
        }
    }

    /// Current rate in events per second.
    pub fn per_second(&self) -> f64 {
        self.per_second_milli.load(Ordering::Relaxed) as f64 / 1000.
    }

    pub fn add_snapshot(&self, count: u64, instant: Instant) {
        let first = {
            let mut g = self.latest_per_second_snapshots.lock();

            let current = CountSnapshot { count, instant };

            if g.is_empty() {
                g.push_back(current);
                return;
            } else if g.len() < g.capacity() {
                g.push_back(current);
                g.front().copied().unwrap()
            } else {
                let first = g.pop_front().unwrap();
                g.push_back(current);
                first
            }
        };

        let diff = count.saturating_sub(first.count);
        let elapsed = instant - first.instant;
        if elapsed.as_secs_f64() == 0. {
            return;
        }
        let per_second = diff as f64 / elapsed.as_secs_f64();
        self.per_second_milli
            .store((per_second * 1000.) as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_constant_rate() {
        let est = RateEstimator::new(5);
        let start = Instant::now();
        for i in 0..10u64 {
            est.add_snapshot(i * 100, start + Duration::from_secs(i));
        }
        let rate = est.per_second();
        assert!((rate - 100.).abs() < 1., "rate was {rate}");
    }

    #[test]
    fn test_no_samples_is_zero() {
        let est = RateEstimator::new(5);
        assert_eq!(est.per_second(), 0.);
    }
}
