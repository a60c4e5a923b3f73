//! Outputs produced by [`SyncSession`](crate::session::SyncSession).
//!
//! The session never performs I/O. Everything it wants done (open a
//! connection, send a message, fetch an offline snapshot) and everything the
//! host may want to react to (rebuilt columns, spawn effects, lifecycle
//! changes) is queued as an [`Output`] and drained by the driver.

use std::time::Duration;

use glam::Vec3;
use warren_net::{ClientMessage, ItemKind, VoxelKind};

use crate::domain::{ColumnKey, ItemKey, VoxelKey};

/// Something the driver must do or may observe.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Open a new connection tagged with `generation`.
    Connect {
        /// Generation to tag transport events with.
        generation: u64,
    },
    /// Send a message on the open connection.
    Send(ClientMessage),
    /// Load the offline snapshot for `level` and hand it back via
    /// [`SyncSession::apply_offline_snapshot`](crate::session::SyncSession::apply_offline_snapshot).
    FetchOffline {
        /// Level to load.
        level: String,
    },
    /// Lifecycle or world-change notification.
    Event(SyncEvent),
}

/// Cosmetic effect for a newly placed thing. Emitted once per local edit and
/// once per remote add that is not an echo of a local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnEffect {
    /// A voxel cell was set.
    Voxel {
        /// Cell.
        key: VoxelKey,
        /// Type.
        kind: VoxelKind,
    },
    /// A floor tile was overridden.
    Tile {
        /// Cell.
        cell: ColumnKey,
        /// Tile identifier.
        tile: u32,
    },
    /// An item was placed.
    Item {
        /// Cell.
        cell: ColumnKey,
        /// Item kind.
        kind: ItemKind,
        /// Resting height.
        y: f32,
    },
    /// A portal was linked.
    Portal {
        /// Cell.
        cell: ColumnKey,
        /// Destination level.
        dest: String,
    },
}

/// Lifecycle and world-change notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The connection opened and the identity announcement went out.
    Connected,
    /// The connection closed; a retry is scheduled.
    Disconnected {
        /// Delay before the next attempt.
        retry_in: Duration,
    },
    /// The session moved to another scope.
    ScopeSwitched {
        /// New scope.
        scope: String,
    },
    /// A level switch started; the local avatar is frozen.
    LevelLoading {
        /// Level being loaded.
        level: String,
    },
    /// Loading ended; the local avatar may move.
    LevelReady {
        /// Active level.
        level: String,
        /// `true` if the fallback deadline ended loading without data.
        forced: bool,
    },
    /// These columns have new spans.
    ColumnsRebuilt {
        /// Rebuilt columns, sorted.
        columns: Vec<ColumnKey>,
    },
    /// Tile overrides changed at these cells.
    TilesChanged {
        /// Cells, sorted and de-duplicated.
        cells: Vec<ColumnKey>,
    },
    /// These items changed.
    ItemsChanged {
        /// Item keys.
        keys: Vec<ItemKey>,
    },
    /// Portal links changed at these cells.
    PortalsChanged {
        /// Cells, sorted and de-duplicated.
        cells: Vec<ColumnKey>,
    },
    /// Play a placement effect.
    Spawn(SpawnEffect),
    /// A visible ghost went silent and was removed; play the despawn effect.
    GhostDespawned {
        /// Ghost identifier.
        id: String,
        /// Last rendered position.
        position: Vec3,
    },
    /// An offline snapshot was applied in place of live data.
    OfflineSnapshotApplied {
        /// Level.
        level: String,
        /// Snapshot version.
        version: u64,
    },
}
