//! Wire message types and JSON encoding.
//!
//! Every message on the connection is one JSON text envelope whose `type`
//! field selects the variant. Inbound decoding distinguishes three failures:
//! text that is not JSON at all, a `type` this client does not know (the
//! auxiliary request/response traffic lands here), and a known `type` whose
//! fields are missing or ill-typed.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared payload types
// ---------------------------------------------------------------------------

/// World-space position as sent on the wire. `z` defaults to 0 when omitted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WirePos {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate (height).
    #[serde(default)]
    pub z: f32,
}

impl WirePos {
    /// Construct a position.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Components as an array.
    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Discrete avatar movement state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MovementState {
    /// Upright, walking avatar.
    #[default]
    #[serde(rename = "good")]
    Upright,
    /// Rolling ball form. Carries a rotation on the wire.
    #[serde(rename = "ball")]
    Ball,
}

/// The four versioned world-state domains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Per-cell voxel diffs.
    Map,
    /// Floor-tile overrides.
    Tiles,
    /// Placed items.
    Items,
    /// Portal links.
    Portals,
}

impl Domain {
    /// All domains in a fixed order.
    pub const ALL: [Domain; 4] = [Domain::Map, Domain::Tiles, Domain::Items, Domain::Portals];

    /// Stable lowercase name, matching the wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Map => "map",
            Domain::Tiles => "tiles",
            Domain::Items => "items",
            Domain::Portals => "portals",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Voxel cell type tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VoxelKind {
    /// Plain solid block.
    Normal,
    /// Solid block that hurts on contact.
    Hazard,
    /// Thin fence marker.
    Fence,
    /// Fence that hurts on contact.
    HazardFence,
    /// Pass-through portal cell.
    Portal,
    /// Lock marker.
    Lock,
    /// Solid block that cannot be climbed.
    NoClimb,
    /// Half-height block.
    Slab,
}

impl VoxelKind {
    /// Stable lowercase name, matching the wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            VoxelKind::Normal => "normal",
            VoxelKind::Hazard => "hazard",
            VoxelKind::Fence => "fence",
            VoxelKind::HazardFence => "hazard_fence",
            VoxelKind::Portal => "portal",
            VoxelKind::Lock => "lock",
            VoxelKind::NoClimb => "no_climb",
            VoxelKind::Slab => "slab",
        }
    }
}

/// Kind of a placed item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Item carrying a text payload.
    Payload,
    /// Purple collectible.
    Purple,
}

// ---------------------------------------------------------------------------
// Per-domain ops
// ---------------------------------------------------------------------------

/// Voxel diff op keyed by `(gx, gy, y)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VoxelOp {
    /// Set the cell to `t`.
    Add {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
        /// Height index.
        y: i32,
        /// Cell type.
        t: VoxelKind,
    },
    /// Clear the cell.
    Remove {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
        /// Height index.
        y: i32,
    },
}

/// Floor-tile override op keyed by `(gx, gy)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TileOp {
    /// Override the tile at the cell.
    Add {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
        /// Tile identifier.
        tile: u32,
    },
    /// Drop the override.
    Remove {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
    },
}

/// Item op keyed by `(gx, gy, kind, payload)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ItemOp {
    /// Place an item.
    Add {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
        /// Height the item rests at.
        y: f32,
        /// Item kind.
        kind: ItemKind,
        /// Payload text for [`ItemKind::Payload`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    /// Remove an item.
    Remove {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
        /// Item kind.
        kind: ItemKind,
        /// Payload text for [`ItemKind::Payload`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
}

/// Portal op keyed by `(gx, gy)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PortalOp {
    /// Link the cell to a destination level.
    Add {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
        /// Destination identifier.
        dest: String,
    },
    /// Unlink the cell.
    Remove {
        /// Grid X.
        gx: i32,
        /// Grid Y.
        gy: i32,
    },
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// One participant in a roster message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Participant identifier.
    pub id: String,
    /// Last reported position.
    pub pos: WirePos,
    /// Movement state.
    pub state: MovementState,
    /// How long ago (server ms) the server last heard from this participant.
    #[serde(default)]
    pub age_ms: u64,
    /// Scope of the participant.
    #[serde(default)]
    pub channel: Option<String>,
    /// Level of the participant.
    #[serde(default)]
    pub level: Option<String>,
    /// Frozen flag.
    #[serde(default)]
    pub frozen: bool,
    /// Rotation in degrees, only in ball state.
    #[serde(default)]
    pub rotation: Option<f32>,
}

/// Roster of other participants in the same scope and level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Roster {
    /// Server clock (ms) when the roster was built.
    pub now: u64,
    /// Server-side liveness TTL (ms).
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Participants, excluding the recipient.
    #[serde(default)]
    pub players: Vec<RosterEntry>,
}

/// A single participant's state. Inbound from the server it carries `now`;
/// outbound it is the client's own self-state announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerUpdate {
    /// Server clock (ms) when relayed. Absent on outbound updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<u64>,
    /// Participant identifier.
    pub id: String,
    /// Position.
    pub pos: WirePos,
    /// Movement state.
    pub state: MovementState,
    /// Scope.
    #[serde(default)]
    pub channel: Option<String>,
    /// Level.
    #[serde(default)]
    pub level: Option<String>,
    /// Frozen flag, omitted when false.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub frozen: bool,
    /// Rotation in degrees, only in ball state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
}

/// Liveness response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    /// Server clock (ms).
    pub now: u64,
}

/// A versioned batch of ops for one domain, either a snapshot or an increment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelBatch<Op> {
    /// Version this batch brings the channel to.
    pub version: u64,
    /// Level the batch belongs to, when the server tags it.
    #[serde(default)]
    pub level: Option<String>,
    /// Ops in application order.
    #[serde(default = "Vec::new")]
    pub ops: Vec<Op>,
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Roster of other participants.
    Snapshot(Roster),
    /// One participant's live update.
    Update(PlayerUpdate),
    /// Liveness response.
    Pong(Pong),
    /// Authoritative voxel state.
    MapSnapshot(ChannelBatch<VoxelOp>),
    /// Incremental voxel ops.
    MapOps(ChannelBatch<VoxelOp>),
    /// Authoritative tile overrides.
    TileSnapshot(ChannelBatch<TileOp>),
    /// Incremental tile ops.
    TileOps(ChannelBatch<TileOp>),
    /// Authoritative item list.
    ItemSnapshot(ChannelBatch<ItemOp>),
    /// Incremental item ops.
    ItemOps(ChannelBatch<ItemOp>),
    /// Authoritative portal links.
    PortalSnapshot(ChannelBatch<PortalOp>),
    /// Incremental portal ops.
    PortalOps(ChannelBatch<PortalOp>),
}

/// `type` tags accepted by [`decode_server_message`].
pub const SERVER_MESSAGE_TYPES: [&str; 11] = [
    "snapshot",
    "update",
    "pong",
    "map_snapshot",
    "map_ops",
    "tile_snapshot",
    "tile_ops",
    "item_snapshot",
    "item_ops",
    "portal_snapshot",
    "portal_ops",
];

impl ServerMessage {
    /// Remote timestamp carried by the message, if any.
    pub fn remote_time(&self) -> Option<u64> {
        match self {
            ServerMessage::Snapshot(roster) => Some(roster.now),
            ServerMessage::Update(update) => update.now,
            ServerMessage::Pong(pong) => Some(pong.now),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Identity and scope announcement, sent first on every connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    /// Client identifier.
    pub id: String,
    /// Scope.
    pub channel: String,
    /// Level.
    pub level: String,
}

/// Liveness ping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// Local clock (ms) at send time.
    pub now: u64,
}

/// Request for a fresh snapshot of one domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resync {
    /// Domain to resync.
    pub domain: Domain,
    /// Level the request applies to.
    pub level: String,
    /// Last version the client applied.
    pub version: u64,
}

/// Request for fresh snapshots of every domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResyncAll {
    /// Level the request applies to.
    pub level: String,
}

/// Request to move to another level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelChange {
    /// Destination level.
    pub level: String,
}

/// A batch of locally originated edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditBatch<Op> {
    /// Level the edits apply to.
    pub level: String,
    /// Ops in submission order.
    pub ops: Vec<Op>,
}

/// Messages the client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identity and scope announcement.
    Hello(Hello),
    /// Self-state update.
    Update(PlayerUpdate),
    /// Liveness ping.
    Ping(Ping),
    /// Per-domain resync request.
    Resync(Resync),
    /// Forced resync of every domain.
    ResyncAll(ResyncAll),
    /// Level change request.
    LevelChange(LevelChange),
    /// Local voxel edits.
    MapEdit(EditBatch<VoxelOp>),
    /// Local tile edits.
    TileEdit(EditBatch<TileOp>),
    /// Local item edits.
    ItemEdit(EditBatch<ItemOp>),
    /// Local portal edits.
    PortalEdit(EditBatch<PortalOp>),
}

impl ClientMessage {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "hello",
            ClientMessage::Update(_) => "update",
            ClientMessage::Ping(_) => "ping",
            ClientMessage::Resync(_) => "resync",
            ClientMessage::ResyncAll(_) => "resync_all",
            ClientMessage::LevelChange(_) => "level_change",
            ClientMessage::MapEdit(_) => "map_edit",
            ClientMessage::TileEdit(_) => "tile_edit",
            ClientMessage::ItemEdit(_) => "item_edit",
            ClientMessage::PortalEdit(_) => "portal_edit",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The text was empty.
    #[error("empty message")]
    EmptyPayload,

    /// The text is not a JSON object with a string `type` field.
    #[error("message has no type tag")]
    MissingType,

    /// The `type` is not one this client understands.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// JSON syntax error or a known type with bad fields.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Encode a [`ClientMessage`] as a compact JSON envelope.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, MessageError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a JSON envelope into a [`ServerMessage`].
pub fn decode_server_message(text: &str) -> Result<ServerMessage, MessageError> {
    if text.trim().is_empty() {
        return Err(MessageError::EmptyPayload);
    }

    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(MessageError::MissingType)?;

    if !SERVER_MESSAGE_TYPES.contains(&kind) {
        return Err(MessageError::UnknownType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
