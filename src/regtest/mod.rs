//! In-process regtest node
//!
//! A minimal relay node that keeps its chain in memory, speaks the same wire
//! protocol as the harness peers and is controlled through [`NodeRpc`]
//! directly. It validates what relay needs (linkage, height, proof-of-work)
//! and nothing more.
//!
//! [`NodeRpc`]: crate::harness::NodeRpc

pub mod chain;
pub mod node;
pub mod relay;

pub use chain::{AcceptOutcome, Chain, ChainState};
pub use node::{start_network, RegtestNode};
pub use relay::{RelayHandler, RelayState, MAX_BLOCKS_PER_INV};
