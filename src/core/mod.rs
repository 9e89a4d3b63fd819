//! Core block model
//!
//! Blocks, coinbase transactions, merkle roots, proof-of-work and the block
//! builder the harness uses to produce blocks outside any node.

pub mod block;
pub mod builder;
pub mod merkle;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;

pub use block::{Block, BlockHash, BlockHeader, HEADER_SIZE};
pub use builder::{BlockBuilder, BLOCK_VERSION, GENESIS_TIME};
pub use merkle::{merkle_root, transactions_root};
pub use monetary::{block_subsidy, INITIAL_BLOCK_REWARD, SATOSHIS_PER_COIN};
pub use proof_of_work::{ProofOfWork, NONCE_SPACE};
pub use transaction::{TXInput, TXOutput, Transaction, TEST_ADDRESS};
