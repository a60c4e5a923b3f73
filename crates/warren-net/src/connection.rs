//! Connection lifecycle state machine.
//!
//! [`ConnectionManager`] decides *when* to connect, ping, and force a
//! self-update; it never touches a socket. The driver feeds it transport
//! events tagged with the generation it handed out from
//! [`ConnectionManager::ensure`], so late events from a replaced connection
//! are recognised and ignored.
//!
//! ```text
//! Closed --ensure() past cooldown--> Connecting --opened--> Open
//!    ^                                   |                   |
//!    +------------ closed/error ---------+-------------------+
//! ```

use std::time::Duration;

use crate::reconnection::{Backoff, BackoffConfig};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in flight.
    Closed,
    /// An attempt has been handed to the transport.
    Connecting,
    /// The transport reported the connection open.
    Open,
}

/// Timing parameters for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Retry backoff.
    pub backoff: BackoffConfig,
    /// Liveness ping interval.
    pub ping_interval: Duration,
    /// Force an outbound update if nothing was sent for this long.
    pub send_watchdog: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            ping_interval: Duration::from_secs(5),
            send_watchdog: Duration::from_secs(1),
        }
    }
}

/// Timers that came due in one [`ConnectionManager::poll_timers`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueTimers {
    /// A liveness ping should be sent.
    pub ping: bool,
    /// Nothing was sent within the watchdog bound; send a self-update.
    pub watchdog: bool,
}

/// Sans-IO owner of one logical connection.
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    generation: u64,
    backoff: Backoff,
    /// Earliest local ms at which `ensure` may start an attempt.
    retry_at: Option<u64>,
    ping_interval_ms: u64,
    send_watchdog_ms: u64,
    next_ping_at: Option<u64>,
    last_send_at: Option<u64>,
}

impl ConnectionManager {
    /// Create a manager in the [`ConnectionState::Closed`] state with no cooldown.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Closed,
            generation: 0,
            backoff: Backoff::new(config.backoff),
            retry_at: None,
            ping_interval_ms: duration_ms(config.ping_interval),
            send_watchdog_ms: duration_ms(config.send_watchdog),
            next_ping_at: None,
            last_send_at: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Generation of the most recent attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Local ms before which no new attempt starts, if a cooldown is active.
    pub fn retry_at(&self) -> Option<u64> {
        self.retry_at
    }

    /// Consecutive failures since the last successful open.
    pub fn failures(&self) -> u32 {
        self.backoff.failures()
    }

    /// Start a connection attempt if closed and past the cooldown.
    ///
    /// Returns the generation the transport must tag its events with.
    pub fn ensure(&mut self, now_ms: u64) -> Option<u64> {
        if self.state != ConnectionState::Closed {
            return None;
        }
        if self.retry_at.is_some_and(|at| now_ms < at) {
            return None;
        }

        self.state = ConnectionState::Connecting;
        self.generation += 1;
        tracing::debug!(generation = self.generation, "Connection attempt started");
        Some(self.generation)
    }

    /// The transport opened connection `generation`.
    ///
    /// Returns `false` for stale generations, which the caller should drop.
    pub fn on_open(&mut self, generation: u64, now_ms: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            tracing::debug!(generation, current = self.generation, "Ignoring stale open");
            return false;
        }

        self.state = ConnectionState::Open;
        self.backoff.reset();
        self.retry_at = None;
        self.next_ping_at = Some(now_ms + self.ping_interval_ms);
        self.last_send_at = Some(now_ms);
        true
    }

    /// The transport closed or failed connection `generation`.
    ///
    /// Returns the scheduled retry delay, or `None` for stale generations.
    pub fn on_close(&mut self, generation: u64, now_ms: u64) -> Option<Duration> {
        if generation != self.generation || self.state == ConnectionState::Closed {
            return None;
        }

        self.state = ConnectionState::Closed;
        self.next_ping_at = None;
        self.last_send_at = None;

        let delay = self.backoff.next_delay();
        self.retry_at = Some(now_ms + duration_ms(delay));
        tracing::info!(
            failures = self.backoff.failures(),
            delay_ms = duration_ms(delay),
            "Connection closed, retry scheduled"
        );
        Some(delay)
    }

    /// Connectivity or visibility came back: allow an immediate retry.
    ///
    /// Backoff state is left untouched.
    pub fn connectivity_regained(&mut self) {
        self.retry_at = None;
    }

    /// Record that a message went out at `now_ms`.
    pub fn record_send(&mut self, now_ms: u64) {
        if self.state == ConnectionState::Open {
            self.last_send_at = Some(now_ms);
        }
    }

    /// Check the ping and send-watchdog deadlines. Only fires while open.
    pub fn poll_timers(&mut self, now_ms: u64) -> DueTimers {
        let mut due = DueTimers::default();
        if self.state != ConnectionState::Open {
            return due;
        }

        if self.next_ping_at.is_some_and(|at| now_ms >= at) {
            due.ping = true;
            self.next_ping_at = Some(now_ms + self.ping_interval_ms);
        }

        if self
            .last_send_at
            .is_some_and(|last| now_ms.saturating_sub(last) >= self.send_watchdog_ms)
        {
            due.watchdog = true;
        }

        due
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionConfig {
            backoff: BackoffConfig {
                jitter: 0.0,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_ensure_starts_attempt_once() {
        let mut conn = manager();
        assert_eq!(conn.ensure(0), Some(1));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.ensure(1), None, "already connecting");
    }

    #[test]
    fn test_open_resets_backoff_and_arms_timers() {
        let mut conn = manager();
        let g = conn.ensure(0).unwrap();
        conn.on_close(g, 0);
        assert_eq!(conn.failures(), 1);

        let g = conn.ensure(500).unwrap();
        assert!(conn.on_open(g, 600));
        assert!(conn.is_open());
        assert_eq!(conn.failures(), 0);
        assert_eq!(conn.retry_at(), None);

        assert_eq!(conn.poll_timers(700), DueTimers::default());
        assert!(conn.poll_timers(1_600).watchdog);
        assert!(conn.poll_timers(5_600).ping);
    }

    #[test]
    fn test_close_schedules_retry_with_cooldown() {
        let mut conn = manager();
        let g = conn.ensure(0).unwrap();
        let delay = conn.on_close(g, 100).unwrap();
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(conn.retry_at(), Some(600));

        assert_eq!(conn.ensure(599), None, "inside cooldown");
        assert_eq!(conn.ensure(600), Some(2));
    }

    #[test]
    fn test_consecutive_failures_double_until_cap() {
        let mut conn = manager();
        let mut now = 0;
        let mut delays = Vec::new();
        for _ in 0..8 {
            let g = conn.ensure(now).unwrap();
            let d = conn.on_close(g, now).unwrap();
            delays.push(d.as_millis());
            now = conn.retry_at().unwrap();
        }
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000, 10_000]
        );
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut conn = manager();
        let old = conn.ensure(0).unwrap();
        conn.on_close(old, 0);
        let current = conn.ensure(conn.retry_at().unwrap()).unwrap();

        assert!(!conn.on_open(old, 1_000));
        assert_eq!(conn.on_close(old, 1_000), None);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.on_open(current, 1_000));
    }

    #[test]
    fn test_connectivity_regained_clears_cooldown_only() {
        let mut conn = manager();
        let g = conn.ensure(0).unwrap();
        conn.on_close(g, 0);
        let g = conn.ensure(500).unwrap();
        conn.on_close(g, 500);
        assert_eq!(conn.retry_at(), Some(1_500));

        conn.connectivity_regained();
        assert_eq!(conn.retry_at(), None);
        assert_eq!(conn.failures(), 2, "backoff untouched");
        assert!(conn.ensure(501).is_some());
    }

    #[test]
    fn test_record_send_defers_watchdog() {
        let mut conn = manager();
        let g = conn.ensure(0).unwrap();
        conn.on_open(g, 0);
        conn.record_send(900);
        assert!(!conn.poll_timers(1_500).watchdog);
        assert!(conn.poll_timers(1_900).watchdog);
    }

    #[test]
    fn test_timers_silent_when_closed() {
        let mut conn = manager();
        assert_eq!(conn.poll_timers(1_000_000), DueTimers::default());
    }

    #[test]
    fn test_ping_rearms_after_firing() {
        let mut conn = manager();
        let g = conn.ensure(0).unwrap();
        conn.on_open(g, 0);
        assert!(conn.poll_timers(5_000).ping);
        assert!(!conn.poll_timers(5_001).ping);
        assert!(conn.poll_timers(10_000).ping);
    }
}
