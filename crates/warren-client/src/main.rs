//! Headless Warren client.
//!
//! Joins a scope and level on a Warren server, keeps the world state in sync,
//! and logs what happens. Falls back to `<offline_dir>/<level>.json` when the
//! server cannot be reached.
//!
//! Run with: `cargo run -p warren-client -- --endpoint ws://127.0.0.1:42666`

mod driver;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use warren_config::{CliArgs, Config, config_file, default_config_dir};
use warren_sync::{Baseline, MIN_CLIENT_ID_LEN, SessionConfig, SyncSession, generate_client_id};

use crate::driver::Driver;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    // Logging depends on the config, so the load is reported after init.
    let config_path = config_file(&config_dir);
    let existed = config_path.exists();
    let (mut file_config, load_error) = match Config::load_or_create(&config_dir) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    let mut config = file_config.clone();
    config.apply_cli_overrides(&args);

    let log_dir = config.debug.log_to_file.then(|| config_dir.join("logs"));
    warren_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    match load_error {
        Some(e) => warn!("Failed to load config from {}: {e}; using defaults", config_path.display()),
        None if existed => info!("Loaded config from {}", config_path.display()),
        None => info!("Created default config at {}", config_path.display()),
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    if config.network.client_id.chars().count() < MIN_CLIENT_ID_LEN {
        // Keep the identity stable across restarts.
        let id = generate_client_id();
        config.network.client_id = id.clone();
        file_config.network.client_id = id;
        if let Err(e) = file_config.save(&config_dir) {
            warn!("Could not persist generated client id: {e}");
        }
    }

    info!("Warren client");
    info!(
        "Endpoint: {} | Scope: {} | Level: {} | Id: {}",
        config.network.endpoint,
        config.network.scope,
        config.network.level,
        config.network.client_id
    );

    let endpoint = match warren_net::parse_endpoint(&config.network.endpoint) {
        Ok(url) => url,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let session = match SyncSession::new(
        SessionConfig::from_config(&config),
        Baseline::default(),
        0,
    ) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session: {e}");
            return ExitCode::FAILURE;
        }
    };

    Driver::new(session, endpoint, config.sync.offline_dir.clone())
        .with_config_reload(config_dir, file_config)
        .run()
        .await;

    info!("Warren client stopped");
    ExitCode::SUCCESS
}
