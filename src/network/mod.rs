//! Peer-to-peer wire layer
//!
//! Message types, the frame codec and the thread-per-connection transport
//! shared by the harness peers and the regtest node.

pub mod codec;
pub mod connection;
pub mod message;

pub use codec::{FrameCodec, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use connection::{dispatch, Connection, ConnectionOptions, MessageHandler, Outbound};
pub use message::{
    GetBlocksMessage, InvItem, InvType, Message, MessageKind, VersionMessage,
    MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION,
};
