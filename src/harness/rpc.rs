use crate::core::{Block, BlockHash};
use crate::error::Result;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// What `getblock` reports about one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub height: u64,
    pub time: i64,
    pub previous: BlockHash,
    /// Lowercase hex
    pub merkle_root: String,
    pub nonce: u32,
    pub difficulty: u32,
    pub tx_count: usize,
}

impl BlockInfo {
    pub fn from_block(block: &Block) -> BlockInfo {
        let header = block.header();
        BlockInfo {
            hash: block.hash(),
            height: header.height,
            time: header.time,
            previous: header.prev_hash,
            merkle_root: HEXLOWER.encode(&header.merkle_root),
            nonce: header.nonce,
            difficulty: header.difficulty,
            tx_count: block.get_transactions().len(),
        }
    }
}

/// The RPC surface the harness needs from a node-under-test.
///
/// Failures the node reports come back as `HarnessError::Rpc`.
pub trait NodeRpc: Send + Sync {
    /// Mine `count` blocks on the node's own tip
    fn generate(&self, count: u32) -> Result<Vec<BlockHash>>;

    fn get_block_count(&self) -> Result<u64>;

    fn get_best_block_hash(&self) -> Result<BlockHash>;

    /// Id of the active-chain block at `height`
    fn get_block_hash(&self, height: u64) -> Result<BlockHash>;

    fn get_block(&self, hash: &BlockHash) -> Result<BlockInfo>;

    /// Block until the node's height reaches `height` or `timeout` elapses,
    /// then return the height it has at that point.
    fn wait_for_block_height(&self, height: u64, timeout: Duration) -> Result<u64>;

    /// Ask the node to open an outbound connection to `endpoint`
    fn add_peer(&self, endpoint: SocketAddr) -> Result<()>;
}
