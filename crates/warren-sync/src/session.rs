//! The synchronization session: one object owning every piece of client-side
//! sync state for the active scope and level.
//!
//! [`SyncSession`] performs no I/O and reads no clock. The driver feeds it
//! transport events and a local monotonic millisecond timestamp, calls
//! [`SyncSession::tick`] on a fixed cadence, and drains [`Output`]s to act
//! on. All mutation happens through `&mut self`, so materialized state has a
//! single writer by construction.

use std::collections::VecDeque;
use std::time::Duration;

use glam::Vec3;
use warren_config::{Config, ConfigError, validate_level, validate_scope};
use warren_net::{
    BackoffConfig, ChannelBatch, ClientMessage, ConnectionConfig, ConnectionManager,
    ConnectionState, Domain, EditBatch, Hello, ItemOp, LevelChange, MovementState, Ping,
    PlayerUpdate, PortalOp, Resync, ResyncAll, Roster, ServerMessage, TileOp, TransportEvent, VoxelKind,
    VoxelOp, WirePos, decode_server_message,
};

use crate::channel::{ApplyOutcome, DiffChannel, DiffSet};
use crate::clock::{ClockSync, RttEstimator};
use crate::domain::{ChannelOp, ColumnKey, ItemKey, VoxelKey};
use crate::echo::LocalEchoSuppressor;
use crate::events::{Output, SyncEvent};
use crate::level::{LevelSwitchCoordinator, LoadingEnd, OfflineFallback};
use crate::merge::{Baseline, WorldMergeEngine};
use crate::offline::{OfflineSnapshot, OfflineSnapshotError};
use crate::outbox::Outbox;
use crate::replicator::{EntityReplicator, Pose, ReplicatorConfig, Sample};

/// Client identifiers shorter than this are replaced by a generated one.
pub const MIN_CLIENT_ID_LEN: usize = 8;

/// Everything a [`SyncSession`] needs to know up front.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifier announced to the server.
    pub client_id: String,
    /// Initial session scope.
    pub scope: String,
    /// Initial level.
    pub level: String,
    /// Connection timing.
    pub connection: ConnectionConfig,
    /// Minimum spacing between regular self-state updates (ms).
    pub self_update_interval_ms: u64,
    /// Force-unfreeze deadline after a level switch (ms).
    pub level_fallback_ms: u64,
    /// Offline fallback: connection must open within this window (ms).
    pub connect_watchdog_ms: u64,
    /// Offline fallback: map data must arrive within this window (ms).
    pub data_watchdog_ms: u64,
    /// Echo-suppression bound.
    pub suppression_capacity: usize,
    /// Pending-edit bound.
    pub outbox_capacity: usize,
    /// Ghost smoothing.
    pub replicator: ReplicatorConfig,
}

impl SessionConfig {
    /// Build from a loaded [`Config`], generating a client id if the
    /// configured one is too short.
    pub fn from_config(config: &Config) -> Self {
        let net = &config.network;
        let sync = &config.sync;
        let repl = &config.replication;

        let client_id = if net.client_id.chars().count() >= MIN_CLIENT_ID_LEN {
            net.client_id.clone()
        } else {
            generate_client_id()
        };

        Self {
            client_id,
            scope: net.scope.clone(),
            level: net.level.clone(),
            connection: ConnectionConfig {
                backoff: BackoffConfig::from_millis(
                    net.reconnect_base_ms,
                    net.reconnect_cap_ms,
                    net.reconnect_jitter,
                ),
                ping_interval: net.ping_interval(),
                send_watchdog: net.send_watchdog(),
            },
            self_update_interval_ms: net.self_update_interval_ms,
            level_fallback_ms: sync.level_fallback_ms,
            connect_watchdog_ms: sync.connect_watchdog_ms,
            data_watchdog_ms: sync.data_watchdog_ms,
            suppression_capacity: sync.suppression_capacity,
            outbox_capacity: sync.outbox_capacity,
            replicator: ReplicatorConfig {
                interpolation_delay_ms: repl.interpolation_delay_ms as f64,
                retention_ms: repl.retention_ms as f64,
                max_extrapolation_ms: repl.max_extrapolation_ms as f64,
                despawn_timeout_ms: repl.despawn_timeout_ms,
            },
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A random 16 hex character client identifier.
pub fn generate_client_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// The local avatar as last reported by the host.
#[derive(Debug, Clone, Copy, Default)]
struct LocalPose {
    pos: Vec3,
    state: MovementState,
    rotation: Option<f32>,
    frozen: bool,
}

#[derive(Debug, Default)]
struct Channels {
    map: DiffChannel<VoxelOp>,
    tiles: DiffChannel<TileOp>,
    items: DiffChannel<ItemOp>,
    portals: DiffChannel<PortalOp>,
}

/// Per-domain plumbing the session needs on top of [`ChannelOp`].
trait SessionDomain: ChannelOp {
    fn channel(channels: &mut Channels) -> &mut DiffChannel<Self>;

    fn edit_message(batch: EditBatch<Self>) -> ClientMessage;

    /// Propagate touched keys downstream and notify the host.
    fn changed(session: &mut SyncSession, touched: Vec<Self::Key>);
}

impl SessionDomain for VoxelOp {
    fn channel(channels: &mut Channels) -> &mut DiffChannel<Self> {
        &mut channels.map
    }

    fn edit_message(batch: EditBatch<Self>) -> ClientMessage {
        ClientMessage::MapEdit(batch)
    }

    fn changed(session: &mut SyncSession, touched: Vec<VoxelKey>) {
        let columns = session.world.apply(&touched, session.channels.map.state());
        if !columns.is_empty() {
            session.emit(SyncEvent::ColumnsRebuilt { columns });
        }
    }
}

impl SessionDomain for TileOp {
    fn channel(channels: &mut Channels) -> &mut DiffChannel<Self> {
        &mut channels.tiles
    }

    fn edit_message(batch: EditBatch<Self>) -> ClientMessage {
        ClientMessage::TileEdit(batch)
    }

    fn changed(session: &mut SyncSession, touched: Vec<ColumnKey>) {
        let cells = sorted_unique(touched);
        if !cells.is_empty() {
            session.emit(SyncEvent::TilesChanged { cells });
        }
    }
}

impl SessionDomain for ItemOp {
    fn channel(channels: &mut Channels) -> &mut DiffChannel<Self> {
        &mut channels.items
    }

    fn edit_message(batch: EditBatch<Self>) -> ClientMessage {
        ClientMessage::ItemEdit(batch)
    }

    fn changed(session: &mut SyncSession, touched: Vec<ItemKey>) {
        let keys = sorted_unique(touched);
        if !keys.is_empty() {
            session.emit(SyncEvent::ItemsChanged { keys });
        }
    }
}

impl SessionDomain for PortalOp {
    fn channel(channels: &mut Channels) -> &mut DiffChannel<Self> {
        &mut channels.portals
    }

    fn edit_message(batch: EditBatch<Self>) -> ClientMessage {
        ClientMessage::PortalEdit(batch)
    }

    fn changed(session: &mut SyncSession, touched: Vec<ColumnKey>) {
        let cells = sorted_unique(touched);
        if !cells.is_empty() {
            session.emit(SyncEvent::PortalsChanged { cells });
        }
    }
}

fn sorted_unique<K: Ord>(mut keys: Vec<K>) -> Vec<K> {
    keys.sort();
    keys.dedup();
    keys
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotSource {
    Live,
    Offline,
}

/// Client-side synchronization state for one scope and level at a time.
pub struct SyncSession {
    config: SessionConfig,
    scope: String,
    conn: ConnectionManager,
    clock: ClockSync,
    rtt: RttEstimator,
    ping_sent_at: Option<u64>,
    channels: Channels,
    world: WorldMergeEngine,
    ghosts: EntityReplicator,
    echo: LocalEchoSuppressor,
    outbox: Outbox,
    level: LevelSwitchCoordinator,
    offline: OfflineFallback,
    /// Domains whose version came from an offline document, not the server.
    offline_domains: Vec<Domain>,
    full_resync_sent: bool,
    local: LocalPose,
    self_dirty: bool,
    last_self_update_at: Option<u64>,
    is_visible: Box<dyn Fn(Vec3) -> bool + Send>,
    outputs: VecDeque<Output>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("client_id", &self.config.client_id)
            .field("scope", &self.scope)
            .field("level", &self.level.level())
            .field("connection", &self.conn.state())
            .field("ghosts", &self.ghosts.len())
            .field("pending_outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

impl SyncSession {
    /// Start a session on the configured level with `baseline` as its static
    /// world. The level begins in the loading state and the first connection
    /// attempt is queued immediately.
    pub fn new(config: SessionConfig, baseline: Baseline, now_ms: u64) -> Result<Self, ConfigError> {
        validate_scope(&config.scope)?;
        validate_level(&config.level)?;

        let mut session = Self {
            scope: config.scope.clone(),
            conn: ConnectionManager::new(config.connection.clone()),
            clock: ClockSync::new(),
            rtt: RttEstimator::default(),
            ping_sent_at: None,
            channels: Channels::default(),
            world: WorldMergeEngine::new(),
            ghosts: EntityReplicator::new(config.replicator.clone()),
            echo: LocalEchoSuppressor::new(config.suppression_capacity),
            outbox: Outbox::new(config.outbox_capacity),
            level: LevelSwitchCoordinator::new(config.level.clone(), config.level_fallback_ms),
            offline: OfflineFallback::new(config.connect_watchdog_ms, config.data_watchdog_ms),
            offline_domains: Vec::new(),
            full_resync_sent: false,
            local: LocalPose::default(),
            self_dirty: true,
            last_self_update_at: None,
            is_visible: Box::new(|_| true),
            outputs: VecDeque::new(),
            config,
        };

        tracing::info!(
            id = %session.config.client_id,
            scope = %session.scope,
            level = %session.config.level,
            "Sync session started"
        );

        let level = session.config.level.clone();
        session.enter_level(&level, baseline, now_ms);
        session.ensure_connection(now_ms);
        Ok(session)
    }

    /// Take every queued output, oldest first.
    pub fn drain_outputs(&mut self) -> Vec<Output> {
        self.outputs.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Advance every timer to `now_ms`.
    pub fn tick(&mut self, now_ms: u64) {
        self.ensure_connection(now_ms);

        let due = self.conn.poll_timers(now_ms);
        if due.ping {
            self.ping_sent_at = Some(now_ms);
            self.send(ClientMessage::Ping(Ping { now: now_ms }), now_ms);
        }
        if due.watchdog || self.self_update_due(now_ms) {
            self.send_self_update(now_ms);
        }

        if self.level.poll(now_ms) == Some(LoadingEnd::Forced) {
            self.self_dirty = true;
            let level = self.level.level().to_string();
            self.emit(SyncEvent::LevelReady { level, forced: true });
        }

        if self.offline.poll(now_ms, self.conn.is_open(), self.level.level()) {
            let level = self.level.level().to_string();
            self.outputs.push_back(Output::FetchOffline { level });
        }

        let is_visible = &self.is_visible;
        let despawned = self.ghosts.despawn_expired(now_ms, |pos| is_visible(pos));
        for ghost in despawned.into_iter().filter(|g| g.visible) {
            self.emit(SyncEvent::GhostDespawned {
                id: ghost.id,
                position: ghost.position,
            });
        }
    }

    /// Feed one event from the transport task.
    pub fn on_transport_event(&mut self, event: TransportEvent, now_ms: u64) {
        match event {
            TransportEvent::Opened { generation } => self.on_open(generation, now_ms),
            TransportEvent::Message { generation, text } => {
                self.on_message(generation, &text, now_ms);
            }
            TransportEvent::Closed { generation, reason } => {
                self.on_close(generation, reason.as_deref(), now_ms);
            }
        }
    }

    /// Network connectivity or app visibility came back. Skips the backoff
    /// cooldown and retries right away.
    pub fn connectivity_regained(&mut self, now_ms: u64) {
        self.conn.connectivity_regained();
        self.ensure_connection(now_ms);
    }

    fn ensure_connection(&mut self, now_ms: u64) {
        if let Some(generation) = self.conn.ensure(now_ms) {
            self.outputs.push_back(Output::Connect { generation });
        }
    }

    fn on_open(&mut self, generation: u64, now_ms: u64) {
        if !self.conn.on_open(generation, now_ms) {
            return;
        }
        tracing::info!(generation, scope = %self.scope, level = %self.level.level(), "Connected");

        self.send_hello(now_ms);
        self.send_self_update(now_ms);
        self.full_resync_sent = false;
        if !self.offline_domains.is_empty() {
            self.request_full_resync(now_ms);
        }

        let pending = self.outbox.drain();
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Flushing pending edits");
        }
        for msg in pending {
            self.send(msg, now_ms);
        }

        self.offline.connection_opened();
        self.emit(SyncEvent::Connected);
    }

    fn on_close(&mut self, generation: u64, reason: Option<&str>, now_ms: u64) {
        if let Some(retry_in) = self.conn.on_close(generation, now_ms) {
            tracing::warn!(generation, reason = reason.unwrap_or("closed"), "Disconnected");
            self.ping_sent_at = None;
            self.emit(SyncEvent::Disconnected { retry_in });
        }
    }

    fn on_message(&mut self, generation: u64, text: &str, now_ms: u64) {
        if generation != self.conn.generation() || !self.conn.is_open() {
            tracing::trace!(generation, "Dropping message from superseded connection");
            return;
        }

        let msg = match decode_server_message(text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed message");
                return;
            }
        };

        if let Some(remote) = msg.remote_time() {
            self.clock.observe(remote, now_ms);
        }

        match msg {
            ServerMessage::Snapshot(roster) => self.on_roster(roster, now_ms),
            ServerMessage::Update(update) => self.on_player_update(update, now_ms),
            ServerMessage::Pong(_) => {
                if let Some(sent) = self.ping_sent_at.take() {
                    self.rtt
                        .record_sample(Duration::from_millis(now_ms.saturating_sub(sent)));
                }
            }
            ServerMessage::MapSnapshot(batch) => self.on_batch(batch, true, now_ms),
            ServerMessage::MapOps(batch) => self.on_batch(batch, false, now_ms),
            ServerMessage::TileSnapshot(batch) => self.on_batch(batch, true, now_ms),
            ServerMessage::TileOps(batch) => self.on_batch(batch, false, now_ms),
            ServerMessage::ItemSnapshot(batch) => self.on_batch(batch, true, now_ms),
            ServerMessage::ItemOps(batch) => self.on_batch(batch, false, now_ms),
            ServerMessage::PortalSnapshot(batch) => self.on_batch(batch, true, now_ms),
            ServerMessage::PortalOps(batch) => self.on_batch(batch, false, now_ms),
        }
    }

    // -----------------------------------------------------------------------
    // Ghosts
    // -----------------------------------------------------------------------

    fn accepts_peer(&self, id: &str, scope: Option<&str>, level: Option<&str>) -> bool {
        id != self.config.client_id
            && scope.is_none_or(|s| s == self.scope)
            && level.is_none_or(|l| l == self.level.level())
    }

    fn on_roster(&mut self, roster: Roster, now_ms: u64) {
        for entry in roster.players {
            if !self.accepts_peer(&entry.id, entry.channel.as_deref(), entry.level.as_deref()) {
                continue;
            }
            let sample = Sample {
                t: roster.now.saturating_sub(entry.age_ms) as f64,
                pos: Vec3::from_array(entry.pos.to_array()),
                state: entry.state,
                rotation: entry.rotation,
                frozen: entry.frozen,
            };
            self.ghosts.push_sample(&entry.id, sample, now_ms);
        }
    }

    fn on_player_update(&mut self, update: PlayerUpdate, now_ms: u64) {
        if !self.accepts_peer(&update.id, update.channel.as_deref(), update.level.as_deref()) {
            return;
        }
        let t = update
            .now
            .map_or_else(|| self.clock.server_now(now_ms), |now| now as f64);
        let sample = Sample {
            t,
            pos: Vec3::from_array(update.pos.to_array()),
            state: update.state,
            rotation: update.rotation,
            frozen: update.frozen,
        };
        self.ghosts.push_sample(&update.id, sample, now_ms);
    }

    /// Interpolated poses of every ghost for a frame drawn at `now_ms`.
    pub fn render_ghosts(&mut self, now_ms: u64) -> Vec<(String, Pose)> {
        let render_time = self.ghosts.render_time(now_ms, self.clock.offset_ms());
        self.ghosts.render(render_time)
    }

    /// Last known poses of ghosts matching `predicate`, e.g. rolling ghosts
    /// for hazard collision checks.
    pub fn ghosts_matching(
        &self,
        predicate: impl FnMut(&str, &Pose) -> bool,
    ) -> Vec<(String, Pose)> {
        self.ghosts.ghosts_matching(predicate)
    }

    /// Decide whether a despawning ghost's position is on screen.
    pub fn set_visibility_filter(&mut self, is_visible: impl Fn(Vec3) -> bool + Send + 'static) {
        self.is_visible = Box::new(is_visible);
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    fn on_batch<Op: SessionDomain>(&mut self, batch: ChannelBatch<Op>, snapshot: bool, now_ms: u64) {
        if let Some(level) = batch.level.as_deref().filter(|l| *l != self.level.level()) {
            tracing::debug!(
                domain = %Op::DOMAIN,
                level,
                active = %self.level.level(),
                "Dropping batch for another level"
            );
            return;
        }

        if snapshot {
            self.apply_snapshot(batch.version, &batch.ops, SnapshotSource::Live);
            return;
        }

        match Op::channel(&mut self.channels).apply_ops(batch.version, &batch.ops) {
            ApplyOutcome::Applied(touched) => {
                self.spawn_remote(&batch.ops);
                Op::changed(self, touched);
                self.data_applied::<Op>(SnapshotSource::Live);
            }
            // Versions from an offline document need not match the server's.
            ApplyOutcome::Stale if self.offline_domains.contains(&Op::DOMAIN) => {
                if !self.full_resync_sent {
                    self.request_full_resync(now_ms);
                }
            }
            ApplyOutcome::Stale => {}
            ApplyOutcome::Gap { current } => {
                let resync = Resync {
                    domain: Op::DOMAIN,
                    level: self.level.level().to_string(),
                    version: current,
                };
                self.send(ClientMessage::Resync(resync), now_ms);
            }
        }
    }

    /// Ask the server for fresh snapshots of every domain on the active level.
    fn request_full_resync(&mut self, now_ms: u64) {
        tracing::info!(level = %self.level.level(), "Requesting full resync");
        self.full_resync_sent = true;
        let level = self.level.level().to_string();
        self.send(ClientMessage::ResyncAll(ResyncAll { level }), now_ms);
    }

    fn apply_snapshot<Op: SessionDomain>(&mut self, version: u64, ops: &[Op], source: SnapshotSource) {
        // Snapshots replace state wholesale; pending echoes inside them are settled.
        for key in ops.iter().filter_map(Op::echo_key) {
            self.echo.consume(&key);
        }
        let touched = Op::channel(&mut self.channels).apply_snapshot(version, ops);
        if source == SnapshotSource::Live {
            self.offline_domains.retain(|d| *d != Op::DOMAIN);
        }
        Op::changed(self, touched);
        self.data_applied::<Op>(source);
    }

    fn spawn_remote<Op: ChannelOp>(&mut self, ops: &[Op]) {
        for op in ops {
            if let Some(effect) = op.spawn_effect() {
                let echoed = op.echo_key().is_some_and(|key| self.echo.consume(&key));
                if !echoed {
                    self.emit(SyncEvent::Spawn(effect));
                }
            }
        }
    }

    fn data_applied<Op: ChannelOp>(&mut self, source: SnapshotSource) {
        if source == SnapshotSource::Live && Op::DOMAIN == Domain::Map {
            self.offline.live_map_data();
        }
        if self.level.data_applied().is_some() {
            self.self_dirty = true;
            let level = self.level.level().to_string();
            self.emit(SyncEvent::LevelReady { level, forced: false });
        }
    }

    /// Hand back the result of an [`Output::FetchOffline`] for `level`.
    ///
    /// Ignored if the level is no longer active or live map data arrived in
    /// the meantime; load errors are logged and dropped. Once a connection is
    /// open the server is asked for fresh snapshots of every domain.
    pub fn apply_offline_snapshot(
        &mut self,
        level: &str,
        result: Result<OfflineSnapshot, OfflineSnapshotError>,
        now_ms: u64,
    ) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(level, error = %err, "Offline snapshot unavailable");
                return;
            }
        };
        if level != self.level.level() {
            tracing::debug!(level, active = %self.level.level(), "Discarding offline snapshot for previous level");
            return;
        }
        if !self.offline.should_apply() {
            tracing::debug!(level, "Live data arrived first, discarding offline snapshot");
            return;
        }

        let version = snapshot.version;
        self.apply_snapshot(version, &snapshot.map, SnapshotSource::Offline);
        self.apply_snapshot(version, &snapshot.tiles, SnapshotSource::Offline);
        self.apply_snapshot(version, &snapshot.items, SnapshotSource::Offline);
        self.apply_snapshot(version, &snapshot.portals, SnapshotSource::Offline);
        self.offline_domains = Domain::ALL.to_vec();
        tracing::info!(level, version, "Applied offline snapshot");
        self.emit(SyncEvent::OfflineSnapshotApplied {
            level: level.to_string(),
            version,
        });
        if self.conn.is_open() {
            self.request_full_resync(now_ms);
        }
    }

    // -----------------------------------------------------------------------
    // Local edits
    // -----------------------------------------------------------------------

    /// Place or remove voxels.
    pub fn submit_map_edits(&mut self, ops: Vec<VoxelOp>, now_ms: u64) {
        self.submit_edits(ops, now_ms);
    }

    /// Set or clear floor tiles.
    pub fn submit_tile_edits(&mut self, ops: Vec<TileOp>, now_ms: u64) {
        self.submit_edits(ops, now_ms);
    }

    /// Place or pick up items.
    pub fn submit_item_edits(&mut self, ops: Vec<ItemOp>, now_ms: u64) {
        self.submit_edits(ops, now_ms);
    }

    /// Link or unlink portals.
    pub fn submit_portal_edits(&mut self, ops: Vec<PortalOp>, now_ms: u64) {
        self.submit_edits(ops, now_ms);
    }

    fn submit_edits<Op: SessionDomain>(&mut self, ops: Vec<Op>, now_ms: u64) {
        if ops.is_empty() {
            return;
        }

        for op in &ops {
            if let Some(key) = op.echo_key() {
                self.echo.record(key);
            }
            if let Some(effect) = op.spawn_effect() {
                self.emit(SyncEvent::Spawn(effect));
            }
        }

        let touched = Op::channel(&mut self.channels).apply_unversioned(&ops);
        Op::changed(self, touched);

        let msg = Op::edit_message(EditBatch {
            level: self.level.level().to_string(),
            ops,
        });
        if self.conn.is_open() {
            self.send(msg, now_ms);
        } else {
            tracing::debug!(kind = msg.kind(), "Not connected, queueing edit");
            self.outbox.push(msg);
        }
    }

    // -----------------------------------------------------------------------
    // Scope and level
    // -----------------------------------------------------------------------

    /// Move to another level with `baseline` as its static world.
    ///
    /// Every channel restarts at version 0, pending edits and echoes from the
    /// old level are dropped, and the local avatar is frozen until data for
    /// the new level arrives or the fallback deadline passes.
    pub fn switch_level(
        &mut self,
        level: &str,
        baseline: Baseline,
        now_ms: u64,
    ) -> Result<(), ConfigError> {
        validate_level(level)?;
        tracing::info!(from = %self.level.level(), to = level, "Switching level");

        self.outbox.clear();
        self.enter_level(level, baseline, now_ms);

        if self.conn.is_open() {
            self.send(
                ClientMessage::LevelChange(LevelChange {
                    level: level.to_string(),
                }),
                now_ms,
            );
        } else if self.offline.request(level) {
            self.outputs.push_back(Output::FetchOffline {
                level: level.to_string(),
            });
        }
        Ok(())
    }

    fn enter_level(&mut self, level: &str, baseline: Baseline, now_ms: u64) {
        self.level.begin(level, now_ms);

        self.channels.map.reset();
        let tiles = self.channels.tiles.reset();
        TileOp::changed(self, tiles);
        let items = self.channels.items.reset();
        ItemOp::changed(self, items);
        let portals = self.channels.portals.reset();
        PortalOp::changed(self, portals);

        let columns = self.world.set_baseline(baseline);
        if !columns.is_empty() {
            self.emit(SyncEvent::ColumnsRebuilt { columns });
        }

        self.echo.clear();
        self.ghosts.clear();
        self.offline_domains.clear();
        self.offline.arm(now_ms);
        self.self_dirty = true;
        self.emit(SyncEvent::LevelLoading {
            level: level.to_string(),
        });
    }

    /// Move to another session scope. Ghosts from the old scope are dropped
    /// and the identity is re-announced if connected.
    pub fn switch_scope(&mut self, scope: &str, now_ms: u64) -> Result<(), ConfigError> {
        validate_scope(scope)?;
        tracing::info!(from = %self.scope, to = scope, "Switching scope");

        self.scope = scope.to_string();
        self.ghosts.clear();
        if self.conn.is_open() {
            self.send_hello(now_ms);
            self.send_self_update(now_ms);
        }
        self.emit(SyncEvent::ScopeSwitched {
            scope: scope.to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local avatar
    // -----------------------------------------------------------------------

    /// Report the local avatar. Sent on the next tick, throttled.
    pub fn set_local_pose(
        &mut self,
        pos: Vec3,
        state: MovementState,
        rotation: Option<f32>,
        frozen: bool,
    ) {
        self.local = LocalPose {
            pos,
            state,
            rotation,
            frozen,
        };
        self.self_dirty = true;
    }

    fn self_update_due(&self, now_ms: u64) -> bool {
        self.self_dirty
            && self.conn.is_open()
            && self.last_self_update_at.is_none_or(|last| {
                now_ms.saturating_sub(last) >= self.config.self_update_interval_ms
            })
    }

    fn self_update(&self) -> PlayerUpdate {
        let rotation = match self.local.state {
            MovementState::Ball => self.local.rotation.map(normalize_degrees),
            MovementState::Upright => None,
        };
        PlayerUpdate {
            now: None,
            id: self.config.client_id.clone(),
            pos: WirePos::new(self.local.pos.x, self.local.pos.y, self.local.pos.z),
            state: self.local.state,
            channel: Some(self.scope.clone()),
            level: Some(self.level.level().to_string()),
            frozen: self.local.frozen || self.level.is_loading(),
            rotation,
        }
    }

    fn send_self_update(&mut self, now_ms: u64) {
        let update = self.self_update();
        self.send(ClientMessage::Update(update), now_ms);
        self.self_dirty = false;
        self.last_self_update_at = Some(now_ms);
    }

    fn send_hello(&mut self, now_ms: u64) {
        let hello = Hello {
            id: self.config.client_id.clone(),
            channel: self.scope.clone(),
            level: self.level.level().to_string(),
        };
        self.send(ClientMessage::Hello(hello), now_ms);
    }

    fn send(&mut self, msg: ClientMessage, now_ms: u64) {
        if !self.conn.is_open() {
            tracing::trace!(kind = msg.kind(), "Not connected, dropping message");
            return;
        }
        self.conn.record_send(now_ms);
        self.outputs.push_back(Output::Send(msg));
    }

    fn emit(&mut self, event: SyncEvent) {
        self.outputs.push_back(Output::Event(event));
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Identifier announced to the server.
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Active scope.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Active level.
    pub fn level(&self) -> &str {
        self.level.level()
    }

    /// Whether the local avatar must stay frozen.
    pub fn is_loading(&self) -> bool {
        self.level.is_loading()
    }

    /// Connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Merged world columns.
    pub fn world(&self) -> &WorldMergeEngine {
        &self.world
    }

    /// Raw voxel diff state.
    pub fn voxels(&self) -> &DiffSet<VoxelKey, VoxelKind> {
        self.channels.map.state()
    }

    /// Tile overrides.
    pub fn tiles(&self) -> &DiffSet<ColumnKey, u32> {
        self.channels.tiles.state()
    }

    /// Items on the active level.
    pub fn items(&self) -> &DiffSet<ItemKey, f32> {
        self.channels.items.state()
    }

    /// Portal links.
    pub fn portals(&self) -> &DiffSet<ColumnKey, String> {
        self.channels.portals.state()
    }

    /// Current version of one domain's channel.
    pub fn channel_version(&self, domain: Domain) -> u64 {
        match domain {
            Domain::Map => self.channels.map.version(),
            Domain::Tiles => self.channels.tiles.version(),
            Domain::Items => self.channels.items.version(),
            Domain::Portals => self.channels.portals.version(),
        }
    }

    /// Clock offset estimate.
    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    /// Round-trip estimate from ping/pong.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Edits waiting for the next open connection.
    pub fn pending_edits(&self) -> usize {
        self.outbox.len()
    }

    /// Local edits still waiting for their echo.
    pub fn pending_echoes(&self) -> usize {
        self.echo.len()
    }

    /// Number of live ghosts.
    pub fn ghost_count(&self) -> usize {
        self.ghosts.len()
    }
}

fn normalize_degrees(degrees: f32) -> f32 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}
