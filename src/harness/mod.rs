//! Peer-protocol test harness
//!
//! Harness peers that connect to nodes-under-test over the wire protocol,
//! the shared lock and condition-wait they record into, the multi-node
//! orchestrator and the block relay scenario built on top of them.

pub mod lock;
pub mod network;
pub mod peer;
pub mod rpc;
pub mod scenario;

pub use lock::{HarnessPeerId, HarnessState, P2pLock, PeerStats, DEFAULT_POLL_INTERVAL};
pub use network::{Network, NodeHandle, TopologyLink};
pub use peer::{HarnessPeerHandle, InvPolicy};
pub use rpc::{BlockInfo, NodeRpc};
pub use scenario::{
    BlockRelayScenario, NodeHeight, ScenarioError, ScenarioReport, Stage, StageRecord,
};
