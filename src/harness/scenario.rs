//! The block relay scenario
//!
//! Builds a short chain outside any node, pushes it into node0 over the wire,
//! lets it propagate through node1 to node2, injects one RPC-generated block
//! on node1 and then checks from node2's side that every block is relayed
//! exactly once and that all three nodes agree on the chain.

use crate::core::{BlockBuilder, BlockHash};
use crate::error::{HarnessError, Result};
use crate::harness::lock::{HarnessPeerId, PeerStats};
use crate::harness::network::Network;
use crate::harness::peer::{HarnessPeerHandle, InvPolicy};
use crate::harness::rpc::BlockInfo;
use crate::network::Message;
use log::info;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Nodes taking part, in topology order node0 <-> node1 <-> node2
const PARTICIPANTS: [usize; 3] = [0, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Setup,
    ChainBuilt,
    FirstSync,
    SecondaryConnect,
    ExternalBlockInjected,
    FinalSync,
    Verified,
}

impl Stage {
    pub const SEQUENCE: [Stage; 7] = [
        Stage::Setup,
        Stage::ChainBuilt,
        Stage::FirstSync,
        Stage::SecondaryConnect,
        Stage::ExternalBlockInjected,
        Stage::FinalSync,
        Stage::Verified,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::ChainBuilt => "chain-built",
            Stage::FirstSync => "first-sync",
            Stage::SecondaryConnect => "secondary-connect",
            Stage::ExternalBlockInjected => "external-block-injected",
            Stage::FinalSync => "final-sync",
            Stage::Verified => "verified",
        };
        f.write_str(name)
    }
}

/// The first failure of a scenario and the stage it happened in
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioError {
    pub stage: Stage,
    pub source: HarnessError,
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scenario failed during {}: {}", self.stage, self.source)
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHeight {
    pub node: String,
    pub height: u64,
}

/// What a successful run observed
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub expected_height: u64,
    pub heights: Vec<NodeHeight>,
    /// Every block the scenario tracked, in chain order
    pub blocks: Vec<BlockHash>,
    pub generated_block: BlockInfo,
    pub stages: Vec<StageRecord>,
}

pub struct BlockRelayScenario<'a> {
    network: &'a mut Network,
    manual_blocks: u64,
    difficulty: u32,
    wait_timeout: Duration,
    sync_timeout: Duration,
    messaging: Option<HarnessPeerId>,
    receiving: Option<HarnessPeerId>,
    blocks: Vec<BlockHash>,
    generated: Option<BlockInfo>,
    heights: Vec<NodeHeight>,
    stages: Vec<StageRecord>,
}

impl<'a> BlockRelayScenario<'a> {
    pub fn new(network: &'a mut Network) -> BlockRelayScenario<'a> {
        let config = network.config().clone();
        BlockRelayScenario {
            network,
            manual_blocks: config.manual_blocks,
            difficulty: config.difficulty,
            wait_timeout: config.wait_timeout(),
            sync_timeout: config.sync_timeout(),
            messaging: None,
            receiving: None,
            blocks: Vec::new(),
            generated: None,
            heights: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Height of node1 once the manual chain is in place
    fn manual_tip_height(&self) -> u64 {
        1 + self.manual_blocks
    }

    /// Height every node must reach after the generated block
    pub fn expected_height(&self) -> u64 {
        self.manual_tip_height() + 1
    }

    pub fn run(mut self) -> std::result::Result<ScenarioReport, ScenarioError> {
        for stage in Stage::SEQUENCE {
            info!("Stage {stage}");
            let started = Instant::now();
            self.enter(stage)
                .map_err(|source| ScenarioError { stage, source })?;
            self.stages.push(StageRecord {
                stage,
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }

        let generated_block = self.generated.take().ok_or_else(|| ScenarioError {
            stage: Stage::Verified,
            source: HarnessError::Assertion("No generated block was recorded".to_string()),
        })?;
        Ok(ScenarioReport {
            expected_height: self.expected_height(),
            heights: self.heights,
            blocks: self.blocks,
            generated_block,
            stages: self.stages,
        })
    }

    fn enter(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Setup => self.setup(),
            Stage::ChainBuilt => self.build_chain(),
            Stage::FirstSync => self.first_sync(),
            Stage::SecondaryConnect => self.secondary_connect(),
            Stage::ExternalBlockInjected => self.inject_generated_block(),
            Stage::FinalSync => self.final_sync(),
            Stage::Verified => self.verify_relay(),
        }
    }

    fn setup(&mut self) -> Result<()> {
        if self.network.node_count() < PARTICIPANTS.len() {
            return Err(HarnessError::Topology(format!(
                "Block relay needs {} nodes, network has {}",
                PARTICIPANTS.len(),
                self.network.node_count()
            )));
        }
        self.network.connect(0, 1)?;
        self.messaging = Some(self.network.add_harness_peer(0, InvPolicy::Ignore)?);

        // Leave initial block download so node0 relays what it gets
        let generated = self.network.rpc(0)?.generate(1)?;
        self.blocks.extend(generated);
        self.network.sync_blocks(&PARTICIPANTS[..2], self.sync_timeout)
    }

    fn build_chain(&mut self) -> Result<()> {
        let rpc = self.network.rpc(0)?;
        let mut tip = rpc.get_best_block_hash()?;
        let mut time = rpc.get_block(&tip)?.time + 1;
        let mut height = rpc.get_block_count()?;

        info!("Create {} blocks on top of {tip}", self.manual_blocks);
        let builder = BlockBuilder::new(self.difficulty);
        let messaging = self.messaging.ok_or_else(|| {
            HarnessError::Topology("No harness peer attached to node0".to_string())
        })?;
        let peer = self.network.harness_peer(0, messaging)?;
        for _ in 0..self.manual_blocks {
            let block = builder.build(tip, height + 1, time)?;
            tip = block.hash();
            peer.send(Message::Block(block))?;
            self.blocks.push(tip);
            time += 1;
            height += 1;
        }
        Ok(())
    }

    fn first_sync(&mut self) -> Result<()> {
        let target = self.manual_tip_height();
        info!("Wait for node1 to reach height {target} using RPC");
        let height = self
            .network
            .rpc(1)?
            .wait_for_block_height(target, self.sync_timeout)?;
        if height < target {
            return Err(HarnessError::Convergence {
                target: format!("height {target}"),
                lagging: vec![format!("{} (height {height})", self.network.node(1)?.name())],
            });
        }
        Ok(())
    }

    fn secondary_connect(&mut self) -> Result<()> {
        info!("Connect node1 and node2");
        self.network.connect(1, 2)?;
        self.network.sync_blocks(&PARTICIPANTS, self.sync_timeout)?;

        self.network.disconnect_all_harness_peers(0)?;
        self.messaging = None;
        self.receiving = Some(self.network.add_harness_peer(2, InvPolicy::Ignore)?);

        info!("Check that node2 relays all {} blocks to us", self.blocks.len());
        self.request_and_check_all()
    }

    fn inject_generated_block(&mut self) -> Result<()> {
        let rpc = self.network.rpc(1)?;
        let hash = rpc.generate(1)?.first().copied().ok_or_else(|| {
            HarnessError::Rpc("generate(1) on node1 returned no block".to_string())
        })?;
        info!("node1 generated block {hash}");
        self.blocks.push(hash);
        self.generated = Some(rpc.get_block(&hash)?);
        Ok(())
    }

    fn final_sync(&mut self) -> Result<()> {
        self.network.sync_blocks(&PARTICIPANTS, self.sync_timeout)?;

        let expected = self.expected_height();
        self.heights.clear();
        for index in PARTICIPANTS {
            let node = self.network.node(index)?;
            let height = node.rpc().get_block_count()?;
            info!("{} height: {height}", node.name());
            self.heights.push(NodeHeight {
                node: node.name().to_string(),
                height,
            });
        }
        // Every node individually, not just the first pair
        let off: Vec<String> = self
            .heights
            .iter()
            .filter(|h| h.height != expected)
            .map(|h| format!("{} (height {})", h.node, h.height))
            .collect();
        if !off.is_empty() {
            return Err(HarnessError::Assertion(format!(
                "Expected every node at height {expected}, found {}",
                off.join(", ")
            )));
        }

        let hash = self
            .generated
            .as_ref()
            .map(|info| info.hash)
            .ok_or_else(|| HarnessError::Assertion("No generated block was recorded".to_string()))?;
        let from_node1 = self.network.rpc(1)?.get_block(&hash)?;
        let from_node2 = self.network.rpc(2)?.get_block(&hash)?;
        if from_node1 != from_node2 {
            return Err(HarnessError::Assertion(format!(
                "node1 and node2 disagree on block {hash}: {from_node1:?} vs {from_node2:?}"
            )));
        }
        Ok(())
    }

    fn verify_relay(&mut self) -> Result<()> {
        info!(
            "Check that node2 relays all {} blocks, including the generated one",
            self.blocks.len()
        );
        // Reset before asking again so no late frame lands in the new map
        self.peer(2, self.receiving)?.clear_receipts();
        self.request_and_check_all()?;
        self.network
            .assert_chains_match(&PARTICIPANTS, self.expected_height())
    }

    fn request_and_check_all(&self) -> Result<()> {
        let peer = self.peer(2, self.receiving)?;
        let stats = peer.fetch_blocks(&self.blocks, self.wait_timeout)?;
        check_each_received_once(&stats, &self.blocks)
    }

    fn peer(&self, node: usize, id: Option<HarnessPeerId>) -> Result<&HarnessPeerHandle> {
        let id = id.ok_or_else(|| {
            HarnessError::Topology(format!("No harness peer attached to node{node}"))
        })?;
        self.network.harness_peer(node, id)
    }
}

fn check_each_received_once(stats: &PeerStats, blocks: &[BlockHash]) -> Result<()> {
    if stats.block_receipts.len() != blocks.len() {
        return Err(HarnessError::Assertion(format!(
            "Expected {} distinct blocks, received {}",
            blocks.len(),
            stats.block_receipts.len()
        )));
    }
    let duplicates = stats.duplicates();
    if let Some((hash, count)) = duplicates.first() {
        return Err(HarnessError::Assertion(format!(
            "Block {hash} received {count} times ({} blocks not received exactly once)",
            duplicates.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    #[test]
    fn test_too_few_nodes_fails_in_setup() {
        let mut network = Network::new(HarnessConfig::default());
        let err = BlockRelayScenario::new(&mut network).run().unwrap_err();
        assert_eq!(err.stage, Stage::Setup);
        assert!(matches!(err.source, HarnessError::Topology(_)));
        assert!(err.to_string().starts_with("Scenario failed during setup"));
    }

    #[test]
    fn test_expected_height_follows_manual_block_count() {
        let config = HarnessConfig {
            manual_blocks: 4,
            ..HarnessConfig::default()
        };
        let mut network = Network::new(config);
        assert_eq!(BlockRelayScenario::new(&mut network).expected_height(), 6);

        let mut network = Network::new(HarnessConfig::default());
        assert_eq!(BlockRelayScenario::new(&mut network).expected_height(), 12);
    }

    #[test]
    fn test_duplicate_receipt_is_reported() {
        let a = BlockHash([1u8; 32]);
        let b = BlockHash([2u8; 32]);
        let mut stats = PeerStats::default();
        stats.block_receipts.insert(a, 1);
        stats.block_receipts.insert(b, 2);

        assert!(matches!(
            check_each_received_once(&stats, &[a, b]),
            Err(HarnessError::Assertion(msg)) if msg.contains(&b.to_hex())
        ));
        stats.block_receipts.insert(b, 1);
        assert!(check_each_received_once(&stats, &[a, b]).is_ok());
        assert!(check_each_received_once(&stats, &[a]).is_err());
    }
}
