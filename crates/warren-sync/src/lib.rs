//! Client-side world synchronization: versioned diff channels, the voxel
//! column merge, ghost interpolation, echo suppression, level switching with
//! an offline fallback, and the [`SyncSession`] that owns them all.

pub mod channel;
pub mod clock;
pub mod domain;
pub mod echo;
pub mod events;
pub mod level;
pub mod merge;
pub mod offline;
pub mod outbox;
pub mod replicator;
pub mod session;

pub use channel::{ApplyOutcome, CellState, DiffChannel, DiffSet};
pub use clock::{ClockSync, RttEstimator};
pub use domain::{ChannelOp, ColumnKey, DiffOp, ItemKey, VoxelKey};
pub use echo::{EchoKey, LocalEchoSuppressor};
pub use events::{Output, SpawnEffect, SyncEvent};
pub use level::{LevelSwitchCoordinator, LoadingEnd, OfflineFallback};
pub use merge::{Baseline, Span, SpanClass, WorldMergeEngine};
pub use offline::{OfflineSnapshot, OfflineSnapshotError, snapshot_path};
pub use outbox::Outbox;
pub use replicator::{Despawned, EntityReplicator, Pose, ReplicatorConfig, Sample};
pub use session::{MIN_CLIENT_ID_LEN, SessionConfig, SyncSession, generate_client_id};
