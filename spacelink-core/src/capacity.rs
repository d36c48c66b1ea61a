//! Outbound capacity estimation.
//!
//! The fair scheduler reports how many bytes each service round
//! actually handed to the network. [`CapacityEstimator`] turns those
//! reports into an exponentially windowed bytes/second rate:
//!
//! ```text
//! w    = e^(-T / K)
//! rate = (1 - w) * bytes / T + w * rate
//! ```
//!
//! where `T` is the time since the previous sample and `K` the window.

use std::time::{Duration, Instant};

/// Exponentially windowed throughput estimator.
#[derive(Debug, Clone)]
pub struct CapacityEstimator {
    /// Averaging window `K`.
    window: Duration,
    /// Estimated bytes/second.
    rate: f64,
    last_sample: Option<Instant>,
    /// Bytes reported at `last_sample` that have not been folded in yet.
    pending_bytes: u64,
    total_bytes: u64,
    samples: u64,
}

impl CapacityEstimator {
    /// Create an estimator with a 1-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        let window = if window.is_zero() {
            Duration::from_millis(1)
        } else {
            window
        };
        Self {
            window,
            rate: 0.0,
            last_sample: None,
            pending_bytes: 0,
            total_bytes: 0,
            samples: 0,
        }
    }

    /// Fold in `bytes` delivered up to `time`.
    ///
    /// Samples at the same (or an earlier) instant accumulate until
    /// time moves forward.
    pub fn sample(&mut self, time: Instant, bytes: u64) {
        self.samples += 1;
        self.total_bytes += bytes;

        let Some(last) = self.last_sample else {
            self.last_sample = Some(time);
            self.pending_bytes = bytes;
            return;
        };

        let elapsed = time.saturating_duration_since(last);
        if elapsed.is_zero() {
            self.pending_bytes += bytes;
            return;
        }

        let t = elapsed.as_secs_f64();
        let w = (-t / self.window.as_secs_f64()).exp();
        let bytes = (self.pending_bytes + bytes) as f64;
        self.rate = (1.0 - w) * (bytes / t) + w * self.rate;
        self.last_sample = Some(time);
        self.pending_bytes = 0;
    }

    /// Current estimate in bytes/second.
    pub fn current_rate(&self) -> f64 {
        self.rate
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

impl Default for CapacityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_returns_zero() {
        let est = CapacityEstimator::new();
        assert_eq!(est.current_rate(), 0.0);
        assert_eq!(est.sample_count(), 0);
    }

    #[test]
    fn first_sample_only_sets_the_baseline() {
        let mut est = CapacityEstimator::new();
        est.sample(Instant::now(), 4096);
        assert_eq!(est.current_rate(), 0.0);
        assert_eq!(est.total_bytes(), 4096);
    }

    #[test]
    fn steady_traffic_converges_to_its_rate() {
        let mut est = CapacityEstimator::with_window(Duration::from_millis(100));
        let t0 = Instant::now();
        // 1000 bytes every 10ms = 100_000 B/s.
        for i in 0..=200u64 {
            est.sample(t0 + Duration::from_millis(10 * i), 1000);
        }
        let rate = est.current_rate();
        assert!((rate - 100_000.0).abs() < 1_000.0, "rate = {rate}");
    }

    #[test]
    fn same_instant_samples_accumulate() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let t2 = t0 + Duration::from_secs(2);

        // Bytes reported again at t1 are carried into the next interval.
        let mut split = CapacityEstimator::with_window(Duration::from_secs(1));
        split.sample(t0, 0);
        split.sample(t1, 500);
        split.sample(t1, 100);
        split.sample(t2, 0);

        let mut whole = CapacityEstimator::with_window(Duration::from_secs(1));
        whole.sample(t0, 0);
        whole.sample(t1, 500);
        whole.sample(t2, 100);

        assert!((split.current_rate() - whole.current_rate()).abs() < 1e-9);
        assert_eq!(split.total_bytes(), whole.total_bytes());
    }

    #[test]
    fn idle_rounds_decay_the_estimate() {
        let mut est = CapacityEstimator::with_window(Duration::from_millis(100));
        let t0 = Instant::now();
        est.sample(t0, 0);
        est.sample(t0 + Duration::from_millis(100), 10_000);
        let busy = est.current_rate();
        est.sample(t0 + Duration::from_millis(600), 0);
        assert!(est.current_rate() < busy / 10.0);
    }
}
