//! Configuration system for the Warren sync client.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, and forward/backward
//! compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, MAX_LEVEL_LEN, MAX_SCOPE_LEN, NetworkConfig, ReplicationConfig,
    SyncConfig, config_file, default_config_dir, validate_level, validate_scope,
};
pub use error::ConfigError;
