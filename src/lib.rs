//! # Relay Harness - Block Propagation Tests over the Peer Protocol
//!
//! A harness that checks blocks relay correctly across a small network of
//! peer-to-peer nodes: blocks built outside any node are pushed in over the
//! wire, one more is mined through RPC, and every node must end up with the
//! same duplicate-free chain.
//!
//! ## How the Code Is Organized
//! - `network/`: wire messages, the frame codec and thread-per-connection
//!   peer connections
//! - `harness/`: harness peers, the shared lock and condition-wait, the
//!   multi-node orchestrator and the block relay scenario
//! - `core/`: blocks, coinbase transactions, proof-of-work and the block
//!   builder
//! - `regtest/`: an in-process node-under-test with an in-memory chain
//! - `config/`: harness settings from defaults, TOML and env vars
//! - `utils/`: hashing and bincode helpers
//! - `cli/`: the `relay-harness` command line
//!
//! ## Where to Start
//! 1. `harness/scenario.rs` for the test sequence itself
//! 2. `harness/peer.rs` and `harness/lock.rs` for how receipts are recorded
//!    and waited on
//! 3. `network/connection.rs` for the handshake and the receive loop
//! 4. `regtest/relay.rs` for what a node does with inv/getdata/block

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod harness;
pub mod network;
pub mod regtest;
pub mod utils;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::HarnessConfig;
pub use core::{Block, BlockBuilder, BlockHash, BlockHeader, ProofOfWork, Transaction};
pub use error::{HarnessError, Result};
pub use harness::{
    BlockInfo, BlockRelayScenario, HarnessPeerHandle, InvPolicy, Network, NodeRpc, P2pLock,
    ScenarioError, ScenarioReport, Stage,
};
pub use network::{Connection, ConnectionOptions, FrameCodec, Message, MessageHandler};
pub use regtest::{start_network, RegtestNode};
pub use utils::{current_timestamp, sha256d};
