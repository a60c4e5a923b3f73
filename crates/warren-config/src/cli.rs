//! Command-line argument parsing for the Warren client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Warren client command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "warren-client", about = "Headless Warren world-sync client")]
pub struct CliArgs {
    /// Websocket endpoint (e.g. ws://host:42666).
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Session scope.
    #[arg(long)]
    pub scope: Option<String>,

    /// Level to join on startup.
    #[arg(long)]
    pub level: Option<String>,

    /// Directory holding offline level snapshots.
    #[arg(long)]
    pub offline_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref endpoint) = args.endpoint {
            self.network.endpoint = endpoint.clone();
        }
        if let Some(ref scope) = args.scope {
            self.network.scope = scope.clone();
        }
        if let Some(ref level) = args.level {
            self.network.level = level.clone();
        }
        if let Some(ref dir) = args.offline_dir {
            self.sync.offline_dir = dir.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
