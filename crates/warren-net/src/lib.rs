//! Websocket networking: wire envelopes, reconnect backoff, the connection
//! lifecycle state machine, and the transport task that moves text frames.

pub mod connection;
pub mod messages;
pub mod reconnection;
pub mod ws_client;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, DueTimers};
pub use messages::{
    ChannelBatch, ClientMessage, Domain, EditBatch, Hello, ItemKind, ItemOp, LevelChange,
    MessageError, MovementState, Ping, PlayerUpdate, Pong, PortalOp, Resync, ResyncAll, Roster,
    RosterEntry, ServerMessage, TileOp, VoxelKind, VoxelOp, WirePos, decode_server_message,
    encode_client_message,
};
pub use reconnection::{Backoff, BackoffConfig};
pub use ws_client::{TransportError, TransportEvent, WsConnection, parse_endpoint};
