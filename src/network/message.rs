use crate::core::{Block, BlockHash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version advertised in our `version` message
pub const PROTOCOL_VERSION: u32 = 70016;

/// Oldest remote version we complete a handshake with
pub const MIN_PEER_PROTO_VERSION: u32 = 31800;

/// Upper bound for inventory vectors in one message
pub const MAX_INV_SIZE: usize = 50_000;

/// What an inventory entry points at
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum InvType {
    Tx,
    Block,
}

/// Announcement/request of one object by identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: BlockHash,
}

impl InvItem {
    pub fn block(hash: BlockHash) -> InvItem {
        InvItem {
            inv_type: InvType::Block,
            hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    /// Random per-connection (or per-node) value, used to detect self-connections
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u64,
}

/// Block locator request: the responder announces the blocks that follow
/// the first locator hash it knows, up to `stop` (or its tip).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetBlocksMessage {
    pub locator: Vec<BlockHash>,
    pub stop: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(GetBlocksMessage),
    Block(Block),
}

/// The fixed set of commands the codec understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    Version,
    Verack,
    Ping,
    Pong,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    Block,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Version,
        MessageKind::Verack,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Inv,
        MessageKind::GetData,
        MessageKind::NotFound,
        MessageKind::GetBlocks,
        MessageKind::Block,
    ];

    pub fn command(&self) -> &'static str {
        match self {
            MessageKind::Version => "version",
            MessageKind::Verack => "verack",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Inv => "inv",
            MessageKind::GetData => "getdata",
            MessageKind::NotFound => "notfound",
            MessageKind::GetBlocks => "getblocks",
            MessageKind::Block => "block",
        }
    }

    pub fn from_command(command: &str) -> Option<MessageKind> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.command() == command)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Version(_) => MessageKind::Version,
            Message::Verack => MessageKind::Verack,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Inv(_) => MessageKind::Inv,
            Message::GetData(_) => MessageKind::GetData,
            Message::NotFound(_) => MessageKind::NotFound,
            Message::GetBlocks(_) => MessageKind::GetBlocks,
            Message::Block(_) => MessageKind::Block,
        }
    }

    /// `getdata` for a list of blocks
    pub fn get_blocks_data(hashes: &[BlockHash]) -> Message {
        Message::GetData(hashes.iter().copied().map(InvItem::block).collect())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Version(v) => write!(
                f,
                "version(version={}, height={}, agent={})",
                v.version, v.start_height, v.user_agent
            ),
            Message::Verack => write!(f, "verack"),
            Message::Ping(nonce) => write!(f, "ping({nonce})"),
            Message::Pong(nonce) => write!(f, "pong({nonce})"),
            Message::Inv(items) => write!(f, "inv({} items)", items.len()),
            Message::GetData(items) => write!(f, "getdata({} items)", items.len()),
            Message::NotFound(items) => write!(f, "notfound({} items)", items.len()),
            Message::GetBlocks(req) => write!(f, "getblocks({} locator hashes)", req.locator.len()),
            Message::Block(block) => write!(f, "block({}, height={})", block.hash(), block.get_height()),
        }
    }
}
