//! Level-switch choreography and the offline fallback.
//!
//! Switching levels freezes the local avatar until the new level's data
//! arrives. A fallback deadline force-unfreezes regardless (fail open), so a
//! lost or late snapshot never leaves the player stuck. When the server is
//! unreachable or silent, [`OfflineFallback`] decides when to load a static
//! snapshot instead.

/// Tracks the active level and its loading freeze.
#[derive(Debug, Clone)]
pub struct LevelSwitchCoordinator {
    level: String,
    loading: bool,
    fallback_ms: u64,
    fallback_at: Option<u64>,
}

/// How a loading phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingEnd {
    /// Data for the level was applied.
    DataArrived,
    /// The fallback deadline passed first.
    Forced,
}

impl LevelSwitchCoordinator {
    /// Start on `level`, not loading.
    pub fn new(level: impl Into<String>, fallback_ms: u64) -> Self {
        Self {
            level: level.into(),
            loading: false,
            fallback_ms,
            fallback_at: None,
        }
    }

    /// Active level.
    pub fn level(&self) -> &str {
        &self.level
    }

    /// Whether the local avatar should be frozen.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Deadline of the force-unfreeze, if armed.
    pub fn fallback_at(&self) -> Option<u64> {
        self.fallback_at
    }

    /// Enter loading for `level` and arm the fallback deadline.
    pub fn begin(&mut self, level: impl Into<String>, now_ms: u64) {
        self.level = level.into();
        self.loading = true;
        self.fallback_at = Some(now_ms + self.fallback_ms);
        tracing::info!(level = %self.level, "Level loading");
    }

    /// A snapshot or increment for the active level was applied.
    ///
    /// Returns `Some` if this ended a loading phase.
    pub fn data_applied(&mut self) -> Option<LoadingEnd> {
        if !self.loading {
            return None;
        }
        self.loading = false;
        self.fallback_at = None;
        tracing::info!(level = %self.level, "Level ready");
        Some(LoadingEnd::DataArrived)
    }

    /// Check the fallback deadline.
    pub fn poll(&mut self, now_ms: u64) -> Option<LoadingEnd> {
        if !self.loading || self.fallback_at.is_none_or(|at| now_ms < at) {
            return None;
        }
        self.loading = false;
        self.fallback_at = None;
        tracing::warn!(level = %self.level, "No level data in time, force-unfreezing");
        Some(LoadingEnd::Forced)
    }
}

/// Decides when to load a static snapshot for the active level.
///
/// Two watchdogs run from the start of each level: a short one for the
/// connection opening and a longer one for the first map data. Either
/// firing requests a fetch, but never for the same level twice in a row.
#[derive(Debug, Clone)]
pub struct OfflineFallback {
    connect_watchdog_ms: u64,
    data_watchdog_ms: u64,
    connect_deadline: Option<u64>,
    data_deadline: Option<u64>,
    live_data: bool,
    last_fetched: Option<String>,
}

impl OfflineFallback {
    /// Create with both watchdog windows, disarmed.
    pub fn new(connect_watchdog_ms: u64, data_watchdog_ms: u64) -> Self {
        Self {
            connect_watchdog_ms,
            data_watchdog_ms,
            connect_deadline: None,
            data_deadline: None,
            live_data: false,
            last_fetched: None,
        }
    }

    /// Arm both watchdogs for a fresh level.
    pub fn arm(&mut self, now_ms: u64) {
        self.connect_deadline = Some(now_ms + self.connect_watchdog_ms);
        self.data_deadline = Some(now_ms + self.data_watchdog_ms);
        self.live_data = false;
    }

    /// The connection opened; the connect watchdog is satisfied.
    pub fn connection_opened(&mut self) {
        self.connect_deadline = None;
    }

    /// Live map data arrived for the active level.
    pub fn live_map_data(&mut self) {
        self.live_data = true;
        self.connect_deadline = None;
        self.data_deadline = None;
    }

    /// Check the watchdogs. Returns `true` if a fetch for `level` should start.
    pub fn poll(&mut self, now_ms: u64, connected: bool, level: &str) -> bool {
        if self.live_data {
            return false;
        }

        let connect_fired = !connected && self.connect_deadline.is_some_and(|at| now_ms >= at);
        let data_fired = self.data_deadline.is_some_and(|at| now_ms >= at);
        if !connect_fired && !data_fired {
            return false;
        }

        self.connect_deadline = None;
        if data_fired {
            self.data_deadline = None;
        }
        if connect_fired {
            tracing::info!(level, "Connection not open in time, using offline snapshot");
        } else {
            tracing::info!(level, "No map data in time, using offline snapshot");
        }
        self.request(level)
    }

    /// Explicitly request a fetch for `level`. Returns `false` if the same
    /// level was the last one fetched.
    pub fn request(&mut self, level: &str) -> bool {
        if self.last_fetched.as_deref() == Some(level) {
            tracing::debug!(level, "Offline snapshot already fetched for this level");
            return false;
        }
        self.last_fetched = Some(level.to_string());
        true
    }

    /// Whether a fetched document should still be applied.
    pub fn should_apply(&self) -> bool {
        !self.live_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_clears_loading_and_cancels_fallback() {
        let mut level = LevelSwitchCoordinator::new("ROOT", 3_000);
        level.begin("attic", 100);
        assert!(level.is_loading());
        assert_eq!(level.fallback_at(), Some(3_100));

        assert_eq!(level.data_applied(), Some(LoadingEnd::DataArrived));
        assert!(!level.is_loading());
        assert_eq!(level.poll(10_000), None, "fallback cancelled");
        assert_eq!(level.data_applied(), None, "only the first apply ends loading");
    }

    #[test]
    fn test_fallback_force_unfreezes() {
        let mut level = LevelSwitchCoordinator::new("ROOT", 3_000);
        level.begin("attic", 0);
        assert_eq!(level.poll(2_999), None);
        assert_eq!(level.poll(3_000), Some(LoadingEnd::Forced));
        assert!(!level.is_loading());
        assert_eq!(level.data_applied(), None);
    }

    #[test]
    fn test_connect_watchdog_fires_when_not_connected() {
        let mut offline = OfflineFallback::new(150, 1_000);
        offline.arm(0);
        assert!(!offline.poll(149, false, "ROOT"));
        assert!(offline.poll(150, false, "ROOT"));
    }

    #[test]
    fn test_connect_watchdog_satisfied_by_open() {
        let mut offline = OfflineFallback::new(150, 1_000);
        offline.arm(0);
        offline.connection_opened();
        assert!(!offline.poll(500, true, "ROOT"));
        // Still no map data after a second.
        assert!(offline.poll(1_000, true, "ROOT"));
    }

    #[test]
    fn test_live_data_disarms_everything() {
        let mut offline = OfflineFallback::new(150, 1_000);
        offline.arm(0);
        offline.live_map_data();
        assert!(!offline.poll(5_000, false, "ROOT"));
        assert!(!offline.should_apply());
    }

    #[test]
    fn test_same_level_not_fetched_twice_in_a_row() {
        let mut offline = OfflineFallback::new(150, 1_000);
        offline.arm(0);
        assert!(offline.poll(150, false, "ROOT"));
        assert!(!offline.poll(1_000, false, "ROOT"), "data watchdog: same level");

        offline.arm(2_000);
        assert!(offline.request("attic"));
        offline.arm(3_000);
        assert!(offline.request("ROOT"), "different level in between");
    }

    #[test]
    fn test_rearm_resets_live_data() {
        let mut offline = OfflineFallback::new(150, 1_000);
        offline.arm(0);
        offline.live_map_data();
        offline.arm(10);
        assert!(offline.should_apply());
        assert!(offline.poll(160, false, "attic"));
    }
}
