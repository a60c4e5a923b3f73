//! Tokio event loop around a [`SyncSession`].
//!
//! The session is owned by this task alone. Connection tasks and offline
//! snapshot loads report back over channels, so every mutation happens here.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use url::Url;
use warren_config::Config;
use warren_net::{TransportEvent, WsConnection, encode_client_message};
use warren_sync::{
    Baseline, OfflineSnapshot, OfflineSnapshotError, Output, SyncEvent, SyncSession,
};

/// Session tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// How often the config file is checked for scope or level changes.
pub const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

type OfflineResult = (String, Result<OfflineSnapshot, OfflineSnapshotError>);

/// Scope and level changes found in a reloaded config file.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReloadChanges {
    scope: Option<String>,
    level: Option<String>,
}

fn reload_changes(old: &Config, new: &Config) -> ReloadChanges {
    ReloadChanges {
        scope: (new.network.scope != old.network.scope).then(|| new.network.scope.clone()),
        level: (new.network.level != old.network.level).then(|| new.network.level.clone()),
    }
}

struct ConfigWatch {
    dir: PathBuf,
    current: Config,
}

/// Owns the session and the transport, and runs until Ctrl-C.
pub struct Driver {
    session: SyncSession,
    endpoint: Url,
    offline_dir: PathBuf,
    connection: Option<WsConnection>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    offline_tx: mpsc::UnboundedSender<OfflineResult>,
    offline_rx: mpsc::UnboundedReceiver<OfflineResult>,
    config_watch: Option<ConfigWatch>,
    started: Instant,
}

impl Driver {
    /// Create a driver. Nothing runs until [`Driver::run`].
    pub fn new(session: SyncSession, endpoint: Url, offline_dir: PathBuf) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (offline_tx, offline_rx) = mpsc::unbounded_channel();
        Self {
            session,
            endpoint,
            offline_dir,
            connection: None,
            transport_tx,
            transport_rx,
            offline_tx,
            offline_rx,
            config_watch: None,
            started: Instant::now(),
        }
    }

    /// Watch `config.ron` in `dir` and follow scope and level edits.
    pub fn with_config_reload(mut self, dir: PathBuf, current: Config) -> Self {
        self.config_watch = Some(ConfigWatch { dir, current });
        self
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run until Ctrl-C.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut config_poll = tokio::time::interval(CONFIG_POLL_INTERVAL);
        config_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        self.pump();
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
                Some(event) = self.transport_rx.recv() => {
                    let now = self.now_ms();
                    self.session.on_transport_event(event, now);
                }
                Some((level, result)) = self.offline_rx.recv() => {
                    let now = self.now_ms();
                    self.session.apply_offline_snapshot(&level, result, now);
                }
                _ = ticker.tick() => {
                    let now = self.now_ms();
                    self.session.tick(now);
                    let ghosts = self.session.render_ghosts(now);
                    trace!(ghosts = ghosts.len(), "Rendered ghosts");
                }
                _ = config_poll.tick() => {
                    self.check_config();
                }
            }
            self.pump();
        }

        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Act on everything the session queued.
    fn pump(&mut self) {
        for output in self.session.drain_outputs() {
            match output {
                Output::Connect { generation } => self.connect(generation),
                Output::Send(msg) => {
                    let Some(connection) = &self.connection else {
                        continue;
                    };
                    match encode_client_message(&msg) {
                        Ok(text) => {
                            if let Err(e) = connection.send(text) {
                                debug!(kind = msg.kind(), "Send failed: {e}");
                            }
                        }
                        Err(e) => warn!(kind = msg.kind(), "Failed to encode message: {e}"),
                    }
                }
                Output::FetchOffline { level } => self.fetch_offline(level),
                Output::Event(event) => log_event(&event),
            }
        }
    }

    fn connect(&mut self, generation: u64) {
        if let Some(previous) = self.connection.take() {
            previous.close();
        }
        debug!(generation, endpoint = %self.endpoint, "Connecting");
        self.connection = Some(WsConnection::spawn(
            self.endpoint.clone(),
            generation,
            self.transport_tx.clone(),
        ));
    }

    fn fetch_offline(&self, level: String) {
        let dir = self.offline_dir.clone();
        let tx = self.offline_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = OfflineSnapshot::load(&dir, &level);
            let _ = tx.send((level, result));
        });
    }

    fn check_config(&mut self) {
        let Some(watch) = self.config_watch.as_mut() else {
            return;
        };
        let reloaded = match watch.current.reload(&watch.dir) {
            Ok(Some(config)) => config,
            Ok(None) => return,
            Err(e) => {
                debug!("Config reload skipped: {e}");
                return;
            }
        };

        let changes = reload_changes(&watch.current, &reloaded);
        watch.current = reloaded;

        let now = self.now_ms();
        if let Some(scope) = changes.scope {
            if let Err(e) = self.session.switch_scope(&scope, now) {
                warn!("Ignoring scope change: {e}");
            }
        }
        if let Some(level) = changes.level {
            if let Err(e) = self.session.switch_level(&level, Baseline::default(), now) {
                warn!("Ignoring level change: {e}");
            }
        }
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Connected => info!("Connected"),
        SyncEvent::Disconnected { retry_in } => {
            info!("Disconnected, retrying in {} ms", retry_in.as_millis());
        }
        SyncEvent::ScopeSwitched { scope } => info!("Scope switched to {scope}"),
        SyncEvent::LevelLoading { level } => info!("Loading level {level}"),
        SyncEvent::LevelReady { level, forced } => {
            if *forced {
                warn!("Level {level} ready without data");
            } else {
                info!("Level {level} ready");
            }
        }
        SyncEvent::OfflineSnapshotApplied { level, version } => {
            info!("Using offline snapshot v{version} for {level}");
        }
        SyncEvent::ColumnsRebuilt { columns } => debug!(count = columns.len(), "Columns rebuilt"),
        SyncEvent::TilesChanged { cells } => debug!(count = cells.len(), "Tiles changed"),
        SyncEvent::ItemsChanged { keys } => debug!(count = keys.len(), "Items changed"),
        SyncEvent::PortalsChanged { cells } => debug!(count = cells.len(), "Portals changed"),
        SyncEvent::Spawn(effect) => trace!(?effect, "Spawn effect"),
        SyncEvent::GhostDespawned { id, position } => {
            debug!(id = %id, ?position, "Ghost despawned");
        }
    }
}
