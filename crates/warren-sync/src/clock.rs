//! Server clock offset and round-trip estimation.
//!
//! Every remote-timestamped message yields an instantaneous offset estimate
//! `remote - local`. The first estimate seeds the running offset, since the
//! two clocks may be on unrelated scales (the server stamps Unix epoch ms,
//! the driver counts from process start). After that the offset is an
//! exponentially smoothed average: the next sample moves it halfway, later
//! samples by a tenth. Without new samples the offset simply stays where it
//! is.

use std::collections::VecDeque;
use std::time::Duration;

/// Smoothing factor for the first sample after the seed.
pub const INITIAL_ALPHA: f64 = 0.5;

/// Smoothing factor once the estimate is ready.
pub const STEADY_ALPHA: f64 = 0.1;

/// Smoothed estimate of `server_clock - local_clock`, in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    offset_ms: f64,
    ready: bool,
    samples: u64,
}

impl ClockSync {
    /// Create an estimator with zero offset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one observation of a remote timestamp received at `local_ms`.
    pub fn observe(&mut self, remote_ms: u64, local_ms: u64) {
        let estimate = remote_ms as f64 - local_ms as f64;
        self.offset_ms = match self.samples {
            0 => estimate,
            1 => self.offset_ms * (1.0 - INITIAL_ALPHA) + estimate * INITIAL_ALPHA,
            _ => self.offset_ms * (1.0 - STEADY_ALPHA) + estimate * STEADY_ALPHA,
        };
        self.ready = true;
        self.samples += 1;
    }

    /// Current offset in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    /// Whether at least one sample has been accepted.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Samples accepted so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Estimated server clock at local time `local_ms`.
    pub fn server_now(&self, local_ms: u64) -> f64 {
        local_ms as f64 + self.offset_ms
    }
}

/// Exponentially weighted moving average RTT estimator, fed by ping/pong
/// pairs.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Recent RTT samples.
    pub samples: VecDeque<Duration>,
    /// Maximum number of samples to retain.
    pub max_samples: usize,
    /// Current EWMA RTT estimate.
    pub ewma_rtt: Duration,
    /// EWMA smoothing factor (default 0.125).
    pub alpha: f64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: 16,
            ewma_rtt: Duration::ZERO,
            alpha: 0.125,
        }
    }
}

impl RttEstimator {
    /// Record a new RTT sample and update the EWMA. The first sample seeds
    /// the average directly.
    pub fn record_sample(&mut self, rtt: Duration) {
        let first = self.samples.is_empty();
        self.samples.push_back(rtt);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }

        if first {
            self.ewma_rtt = rtt;
            return;
        }
        let new_ewma =
            self.alpha * rtt.as_secs_f64() + (1.0 - self.alpha) * self.ewma_rtt.as_secs_f64();
        self.ewma_rtt = Duration::from_secs_f64(new_ewma);
    }

    /// Median of stored samples.
    pub fn median_rtt(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        sorted[sorted.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_offset() {
        let mut clock = ClockSync::new();
        assert!(!clock.is_ready());

        clock.observe(11_000, 1_000);
        assert!(clock.is_ready());
        assert_eq!(clock.offset_ms(), 10_000.0);
    }

    #[test]
    fn test_second_sample_uses_half_weight() {
        let mut clock = ClockSync::new();
        clock.observe(11_000, 1_000); // 10000
        clock.observe(14_000, 2_000); // 10000*0.5 + 12000*0.5
        assert_eq!(clock.offset_ms(), 11_000.0);
    }

    #[test]
    fn test_later_samples_use_tenth_weight() {
        let mut clock = ClockSync::new();
        clock.observe(11_000, 1_000); // 10000
        clock.observe(12_000, 2_000); // 10000
        clock.observe(23_000, 3_000); // 10000*0.9 + 20000*0.1
        assert!((clock.offset_ms() - 11_000.0).abs() < 1e-9);
        assert_eq!(clock.samples(), 3);
    }

    #[test]
    fn test_epoch_timestamps_against_process_clock() {
        let mut clock = ClockSync::new();
        let epoch = 1_760_000_000_000u64;
        clock.observe(epoch, 1_000);
        assert_eq!(clock.offset_ms(), (epoch - 1_000) as f64);
        assert_eq!(clock.server_now(1_500), (epoch + 500) as f64);
    }

    #[test]
    fn test_offset_converges_to_constant_skew() {
        let mut clock = ClockSync::new();
        for i in 0..200u64 {
            clock.observe(50_000 + i * 100, i * 100);
        }
        assert!(
            (clock.offset_ms() - 50_000.0).abs() < 1.0,
            "offset should converge, got {}",
            clock.offset_ms()
        );
    }

    #[test]
    fn test_negative_offset() {
        let mut clock = ClockSync::new();
        clock.observe(0, 2_000);
        assert_eq!(clock.offset_ms(), -2_000.0);
        assert_eq!(clock.server_now(3_000), 1_000.0);
    }

    #[test]
    fn test_offset_stalls_without_samples() {
        let mut clock = ClockSync::new();
        clock.observe(3_000, 1_000);
        let before = clock.offset_ms();
        let _ = clock.server_now(99_999);
        assert_eq!(clock.offset_ms(), before);
    }

    #[test]
    fn test_rtt_first_sample_seeds_average() {
        let mut rtt = RttEstimator::default();
        rtt.record_sample(Duration::from_millis(40));
        assert_eq!(rtt.ewma_rtt, Duration::from_millis(40));
        assert_eq!(rtt.samples.len(), 1);
    }

    #[test]
    fn test_rtt_median_resists_outliers() {
        let mut rtt = RttEstimator::default();
        for _ in 0..14 {
            rtt.record_sample(Duration::from_millis(50));
        }
        rtt.record_sample(Duration::from_millis(200));
        rtt.record_sample(Duration::from_millis(200));

        assert!(
            rtt.median_rtt() <= Duration::from_millis(55),
            "median should be ~50ms despite outliers, got {:?}",
            rtt.median_rtt()
        );
    }

    #[test]
    fn test_rtt_window_is_bounded() {
        let mut rtt = RttEstimator::default();
        for i in 0..40 {
            rtt.record_sample(Duration::from_millis(i));
        }
        assert_eq!(rtt.samples.len(), 16);
    }
}
