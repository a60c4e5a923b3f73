//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum length of a session scope identifier.
pub const MAX_SCOPE_LEN: usize = 32;

/// Maximum length of a level identifier.
pub const MAX_LEVEL_LEN: usize = 64;

const APP_NAME: &str = "warren";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection and wire settings.
    pub network: NetworkConfig,
    /// World-state synchronization settings.
    pub sync: SyncConfig,
    /// Remote entity smoothing settings.
    pub replication: ReplicationConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Websocket endpoint, e.g. `ws://127.0.0.1:42666`.
    pub endpoint: String,
    /// Coarse session scope. Participants in different scopes never see each other.
    pub scope: String,
    /// Level (world partition) to join on startup.
    pub level: String,
    /// Client identifier. Generated at startup when empty.
    pub client_id: String,
    /// Liveness ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Force a self-state update if nothing was sent for this long (ms).
    pub send_watchdog_ms: u64,
    /// Minimum spacing between regular self-state updates (ms).
    pub self_update_interval_ms: u64,
    /// First reconnect delay (ms).
    pub reconnect_base_ms: u64,
    /// Upper bound on the reconnect delay before jitter (ms).
    pub reconnect_cap_ms: u64,
    /// Symmetric jitter as a fraction of the delay (0.0 - 1.0).
    pub reconnect_jitter: f64,
}

/// World-state synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Force-unfreeze after a level switch if no data arrived (ms).
    pub level_fallback_ms: u64,
    /// Load the offline snapshot if no connection opened within this window (ms).
    pub connect_watchdog_ms: u64,
    /// Load the offline snapshot if no map data arrived within this window (ms).
    pub data_watchdog_ms: u64,
    /// Maximum number of pending echo-suppression keys.
    pub suppression_capacity: usize,
    /// Maximum number of edit batches held while offline.
    pub outbox_capacity: usize,
    /// Directory holding `<level>.json` offline snapshots.
    pub offline_dir: PathBuf,
}

/// Remote entity interpolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// How far behind the estimated server clock remote entities are rendered (ms).
    pub interpolation_delay_ms: u64,
    /// Samples older than this relative to the newest are dropped (ms).
    pub retention_ms: u64,
    /// Maximum forward extrapolation past the newest sample (ms).
    pub max_extrapolation_ms: u64,
    /// Entities silent for longer than this are removed (ms).
    pub despawn_timeout_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config directory.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:42666".to_string(),
            scope: "DEFAULT".to_string(),
            level: "ROOT".to_string(),
            client_id: String::new(),
            ping_interval_ms: 5_000,
            send_watchdog_ms: 1_000,
            self_update_interval_ms: 100,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 10_000,
            reconnect_jitter: 0.25,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            level_fallback_ms: 3_000,
            connect_watchdog_ms: 150,
            data_watchdog_ms: 1_000,
            suppression_capacity: 1_024,
            outbox_capacity: 256,
            offline_dir: PathBuf::from("./levels"),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            interpolation_delay_ms: 150,
            retention_ms: 2_000,
            max_extrapolation_ms: 250,
            despawn_timeout_ms: 2_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl NetworkConfig {
    /// Liveness ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Send watchdog bound.
    pub fn send_watchdog(&self) -> Duration {
        Duration::from_millis(self.send_watchdog_ms)
    }
}

// --- Validation ---

/// Check that `scope` is 1-32 characters of `[A-Za-z0-9_-]`.
pub fn validate_scope(scope: &str) -> Result<(), ConfigError> {
    let well_formed = !scope.is_empty()
        && scope.len() <= MAX_SCOPE_LEN
        && scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(ConfigError::InvalidScope(scope.to_string()))
    }
}

/// Check that `level` is 1-64 characters.
pub fn validate_level(level: &str) -> Result<(), ConfigError> {
    if level.is_empty() || level.chars().count() > MAX_LEVEL_LEN {
        Err(ConfigError::InvalidLevel(level.to_string()))
    } else {
        Ok(())
    }
}

/// Config file name inside the config directory.
const CONFIG_FILE_NAME: &str = "config.ron";

/// Path of the config file inside `config_dir`.
pub fn config_file(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Platform configuration directory for the client (`<config>/warren`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join(APP_NAME))
}

// --- Load / Save / Reload ---

impl Config {
    /// Validate fields that must match between the identity announcement and
    /// every later operation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scope(&self.network.scope)?;
        validate_level(&self.network.level)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_file(config_dir);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_file(config_dir);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_file(config_dir);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
