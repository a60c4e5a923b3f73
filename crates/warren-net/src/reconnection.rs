//! Reconnect backoff with jitter.
//!
//! [`Backoff`] hands out exponentially increasing delays between connection
//! attempts. There is no attempt limit: a lost connection is always retried.
//! The cap applies before jitter, so a single delay may exceed the cap by at
//! most `cap * jitter`.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 500 ms.
    pub initial_delay: Duration,
    /// Multiplier applied after each failure. Default: 2.0.
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay. Default: 10 s.
    pub max_delay: Duration,
    /// Jitter factor (0.0–1.0), applied as ±jitter to the delay. Default: 0.25.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Build from the millisecond fields of the network config.
    pub fn from_millis(base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        Self {
            initial_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms.max(base_ms)),
            jitter: jitter.clamp(0.0, 1.0),
            ..Self::default()
        }
    }
}

/// Tracks consecutive failures and computes the next retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
    current_delay: Duration,
}

impl Backoff {
    /// Create a new backoff from the given config.
    pub fn new(config: BackoffConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            failures: 0,
            current_delay: initial,
        }
    }

    /// Compute the delay before the next attempt and advance the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay.min(self.config.max_delay);
        self.failures = self.failures.saturating_add(1);

        // Uniform in [base * (1 - jitter), base * (1 + jitter)]
        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        jittered
    }

    /// Reset after a successful open.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The un-jittered delay the next failure will use.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_sequence_is_exponential() {
        let mut backoff = Backoff::new(config_no_jitter());

        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4_000));
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(config_no_jitter());

        let mut last = Duration::ZERO;
        for _ in 0..40 {
            let d = backoff.next_delay();
            assert!(d >= last, "delay decreased: {d:?} < {last:?}");
            assert!(d <= Duration::from_secs(10), "delay over cap: {d:?}");
            last = d;
        }
        assert_eq!(last, Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_delay_stays_within_cap_plus_jitter() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..50 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_millis(12_500), "{d:?}");
        }
    }

    #[test]
    fn test_never_gives_up() {
        let mut backoff = Backoff::new(config_no_jitter());
        for _ in 0..1_000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.failures(), 1_000);
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = Backoff::new(config_no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_varies_delay() {
        let delays: Vec<_> = (0..10)
            .map(|_| Backoff::new(BackoffConfig::default()).next_delay())
            .collect();

        assert!(
            !delays.windows(2).all(|w| w[0] == w[1]),
            "Jitter should cause variation in delays: {delays:?}"
        );
        for d in &delays {
            assert!(*d >= Duration::from_millis(375) && *d <= Duration::from_millis(625));
        }
    }

    #[test]
    fn test_from_millis_clamps_inputs() {
        let config = BackoffConfig::from_millis(800, 100, 3.0);
        assert_eq!(config.max_delay, Duration::from_millis(800));
        assert_eq!(config.jitter, 1.0);
    }
}
