use crate::core::merkle::transactions_root;
use crate::core::proof_of_work::NONCE_SPACE;
use crate::core::{block_subsidy, Block, BlockHash, BlockHeader, ProofOfWork, Transaction, TEST_ADDRESS};
use crate::error::Result;
use log::info;

pub const BLOCK_VERSION: u32 = 1;

/// Regtest genesis timestamp shared by every node
pub const GENESIS_TIME: i64 = 1_296_688_602;

const GENESIS_EXTRA_NONCE: &[u8] = b"relay-harness genesis";

/// Builds and solves blocks without involving any node's mining logic, so
/// the caller controls content and timing exactly.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    difficulty: u32,
    payout_address: String,
    extra_nonce: Vec<u8>,
    start_nonce: u32,
    max_attempts: u64,
}

impl BlockBuilder {
    pub fn new(difficulty: u32) -> BlockBuilder {
        BlockBuilder {
            difficulty,
            payout_address: TEST_ADDRESS.to_string(),
            extra_nonce: Vec::new(),
            start_nonce: 0,
            max_attempts: NONCE_SPACE,
        }
    }

    pub fn with_payout_address(mut self, address: &str) -> Self {
        self.payout_address = address.to_string();
        self
    }

    /// Extra coinbase bytes, e.g. to make two blocks at the same height differ
    pub fn with_extra_nonce(mut self, extra_nonce: &[u8]) -> Self {
        self.extra_nonce = extra_nonce.to_vec();
        self
    }

    pub fn with_start_nonce(mut self, start_nonce: u32) -> Self {
        self.start_nonce = start_nonce;
        self
    }

    /// Bound the proof-of-work search; the default is the full nonce space
    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Build a block on top of `parent_hash` and solve its proof-of-work
    pub fn build(&self, parent_hash: BlockHash, height: u64, time: i64) -> Result<Block> {
        let coinbase = Transaction::new_coinbase(
            height,
            &self.payout_address,
            block_subsidy(height),
            &self.extra_nonce,
        )?;
        let transactions = vec![coinbase];

        let mut header = BlockHeader {
            version: BLOCK_VERSION,
            prev_hash: parent_hash,
            merkle_root: transactions_root(&transactions)?,
            time,
            height,
            difficulty: self.difficulty,
            nonce: self.start_nonce,
        };

        ProofOfWork::new(self.difficulty).solve(&mut header, self.max_attempts)?;
        Block::new(header, transactions)
    }

    /// The deterministic genesis block for a difficulty; every node built with
    /// the same difficulty agrees on it.
    pub fn genesis(difficulty: u32) -> Result<Block> {
        let block = BlockBuilder::new(difficulty)
            .with_extra_nonce(GENESIS_EXTRA_NONCE)
            .build(BlockHash::ZERO, 0, GENESIS_TIME)?;
        info!("Genesis block for difficulty {difficulty}: {}", block.hash());
        Ok(block)
    }
}
