//! Keys and values for the four world-state domains.
//!
//! Each wire op type implements [`ChannelOp`], which is how a generic
//! [`DiffChannel`](crate::channel::DiffChannel) learns its key and value
//! types and how local edits produce echo-suppression keys.

use warren_net::{Domain, ItemKind, ItemOp, PortalOp, TileOp, VoxelKind, VoxelOp};

use crate::echo::EchoKey;
use crate::events::SpawnEffect;

/// A single grid column `(gx, gy)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnKey {
    /// Grid X.
    pub gx: i32,
    /// Grid Y.
    pub gy: i32,
}

impl ColumnKey {
    /// Construct a column key.
    pub const fn new(gx: i32, gy: i32) -> Self {
        Self { gx, gy }
    }
}

/// A single voxel cell `(gx, gy, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelKey {
    /// Grid X.
    pub gx: i32,
    /// Grid Y.
    pub gy: i32,
    /// Height index.
    pub y: i32,
}

impl VoxelKey {
    /// Construct a voxel key.
    pub const fn new(gx: i32, gy: i32, y: i32) -> Self {
        Self { gx, gy, y }
    }

    /// Column containing this cell.
    pub fn column(&self) -> ColumnKey {
        ColumnKey::new(self.gx, self.gy)
    }
}

/// Identity of a placed item. Two items of the same kind and payload cannot
/// share a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    /// Grid X.
    pub gx: i32,
    /// Grid Y.
    pub gy: i32,
    /// Item kind.
    pub kind: ItemKind,
    /// Payload text.
    pub payload: Option<String>,
}

/// One entry of a diff op after it has been split into key and value.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp<K, V> {
    /// Set `K` to `V`.
    Add(K, V),
    /// Clear `K`.
    Remove(K),
}

impl<K, V> DiffOp<K, V> {
    /// Key the op addresses.
    pub fn key(&self) -> &K {
        match self {
            DiffOp::Add(key, _) | DiffOp::Remove(key) => key,
        }
    }
}

/// A wire op that can be applied to a [`DiffChannel`](crate::channel::DiffChannel).
pub trait ChannelOp: Clone {
    /// Materialized-state key.
    type Key: Clone + Eq + std::hash::Hash + std::fmt::Debug;
    /// Materialized-state value.
    type Value: Clone + PartialEq + std::fmt::Debug;

    /// Domain this op belongs to.
    const DOMAIN: Domain;

    /// Whether the domain layers over a baseline, so removing a key the
    /// channel never held must be remembered.
    const OVER_BASELINE: bool = false;

    /// Split into key and value.
    fn to_diff(&self) -> DiffOp<Self::Key, Self::Value>;

    /// Suppression key for an add op. `None` for removals.
    fn echo_key(&self) -> Option<EchoKey>;

    /// Placement effect for an add op. `None` for removals.
    fn spawn_effect(&self) -> Option<SpawnEffect>;
}

impl ChannelOp for VoxelOp {
    type Key = VoxelKey;
    type Value = VoxelKind;

    const DOMAIN: Domain = Domain::Map;
    const OVER_BASELINE: bool = true;

    fn to_diff(&self) -> DiffOp<VoxelKey, VoxelKind> {
        match *self {
            VoxelOp::Add { gx, gy, y, t } => DiffOp::Add(VoxelKey::new(gx, gy, y), t),
            VoxelOp::Remove { gx, gy, y } => DiffOp::Remove(VoxelKey::new(gx, gy, y)),
        }
    }

    fn echo_key(&self) -> Option<EchoKey> {
        match *self {
            VoxelOp::Add { gx, gy, y, t } => Some(EchoKey::new(
                Domain::Map,
                gx,
                gy,
                Some(y),
                t.as_str().to_string(),
            )),
            VoxelOp::Remove { .. } => None,
        }
    }

    fn spawn_effect(&self) -> Option<SpawnEffect> {
        match *self {
            VoxelOp::Add { gx, gy, y, t } => Some(SpawnEffect::Voxel {
                key: VoxelKey::new(gx, gy, y),
                kind: t,
            }),
            VoxelOp::Remove { .. } => None,
        }
    }
}

impl ChannelOp for TileOp {
    type Key = ColumnKey;
    type Value = u32;

    const DOMAIN: Domain = Domain::Tiles;

    fn to_diff(&self) -> DiffOp<ColumnKey, u32> {
        match *self {
            TileOp::Add { gx, gy, tile } => DiffOp::Add(ColumnKey::new(gx, gy), tile),
            TileOp::Remove { gx, gy } => DiffOp::Remove(ColumnKey::new(gx, gy)),
        }
    }

    fn echo_key(&self) -> Option<EchoKey> {
        match *self {
            TileOp::Add { gx, gy, tile } => Some(EchoKey::new(
                Domain::Tiles,
                gx,
                gy,
                None,
                tile.to_string(),
            )),
            TileOp::Remove { .. } => None,
        }
    }

    fn spawn_effect(&self) -> Option<SpawnEffect> {
        match *self {
            TileOp::Add { gx, gy, tile } => Some(SpawnEffect::Tile {
                cell: ColumnKey::new(gx, gy),
                tile,
            }),
            TileOp::Remove { .. } => None,
        }
    }
}

impl ChannelOp for PortalOp {
    type Key = ColumnKey;
    type Value = String;

    const DOMAIN: Domain = Domain::Portals;

    fn to_diff(&self) -> DiffOp<ColumnKey, String> {
        match self {
            PortalOp::Add { gx, gy, dest } => DiffOp::Add(ColumnKey::new(*gx, *gy), dest.clone()),
            PortalOp::Remove { gx, gy } => DiffOp::Remove(ColumnKey::new(*gx, *gy)),
        }
    }

    fn echo_key(&self) -> Option<EchoKey> {
        match self {
            PortalOp::Add { gx, gy, dest } => Some(EchoKey::new(
                Domain::Portals,
                *gx,
                *gy,
                None,
                dest.clone(),
            )),
            PortalOp::Remove { .. } => None,
        }
    }

    fn spawn_effect(&self) -> Option<SpawnEffect> {
        match self {
            PortalOp::Add { gx, gy, dest } => Some(SpawnEffect::Portal {
                cell: ColumnKey::new(*gx, *gy),
                dest: dest.clone(),
            }),
            PortalOp::Remove { .. } => None,
        }
    }
}

impl ChannelOp for ItemOp {
    type Key = ItemKey;
    type Value = f32;

    const DOMAIN: Domain = Domain::Items;

    fn to_diff(&self) -> DiffOp<ItemKey, f32> {
        match self {
            ItemOp::Add {
                gx,
                gy,
                y,
                kind,
                payload,
            } => DiffOp::Add(
                ItemKey {
                    gx: *gx,
                    gy: *gy,
                    kind: *kind,
                    payload: payload.clone(),
                },
                *y,
            ),
            ItemOp::Remove {
                gx,
                gy,
                kind,
                payload,
            } => DiffOp::Remove(ItemKey {
                gx: *gx,
                gy: *gy,
                kind: *kind,
                payload: payload.clone(),
            }),
        }
    }

    fn echo_key(&self) -> Option<EchoKey> {
        match self {
            ItemOp::Add {
                gx,
                gy,
                kind,
                payload,
                ..
            } => Some(EchoKey::new(
                Domain::Items,
                *gx,
                *gy,
                None,
                item_value(*kind, payload.as_deref()),
            )),
            ItemOp::Remove { .. } => None,
        }
    }

    fn spawn_effect(&self) -> Option<SpawnEffect> {
        match self {
            ItemOp::Add { gx, gy, y, kind, .. } => Some(SpawnEffect::Item {
                cell: ColumnKey::new(*gx, *gy),
                kind: *kind,
                y: *y,
            }),
            ItemOp::Remove { .. } => None,
        }
    }
}

fn item_value(kind: ItemKind, payload: Option<&str>) -> String {
    match (kind, payload) {
        (ItemKind::Purple, _) => "purple".to_string(),
        (ItemKind::Payload, Some(text)) => format!("payload:{text}"),
        (ItemKind::Payload, None) => "payload".to_string(),
    }
}
