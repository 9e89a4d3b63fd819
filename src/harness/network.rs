use crate::config::HarnessConfig;
use crate::core::BlockHash;
use crate::error::{HarnessError, Result};
use crate::harness::lock::{HarnessPeerId, P2pLock};
use crate::harness::peer::{HarnessPeerHandle, InvPolicy};
use crate::harness::rpc::NodeRpc;
use crate::network::ConnectionOptions;
use log::{debug, info};
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// One node-under-test as the harness sees it
pub struct NodeHandle {
    name: String,
    rpc: Arc<dyn NodeRpc>,
    p2p_addr: SocketAddr,
    harness_peers: Vec<HarnessPeerHandle>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rpc(&self) -> &dyn NodeRpc {
        self.rpc.as_ref()
    }

    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    pub fn harness_peers(&self) -> &[HarnessPeerHandle] {
        &self.harness_peers
    }
}

/// Undirected node-to-node link, stored with the lower index first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopologyLink(usize, usize);

impl TopologyLink {
    pub fn new(a: usize, b: usize) -> TopologyLink {
        if a <= b {
            TopologyLink(a, b)
        } else {
            TopologyLink(b, a)
        }
    }

    pub fn endpoints(&self) -> (usize, usize) {
        (self.0, self.1)
    }

    fn other(&self, node: usize) -> Option<usize> {
        if self.0 == node {
            Some(self.1)
        } else if self.1 == node {
            Some(self.0)
        } else {
            None
        }
    }
}

/// The nodes under test, the links between them and the harness peers
/// attached to them
pub struct Network {
    lock: P2pLock,
    nodes: Vec<NodeHandle>,
    links: BTreeSet<TopologyLink>,
    config: HarnessConfig,
}

impl Network {
    pub fn new(config: HarnessConfig) -> Network {
        Network {
            lock: P2pLock::new(config.poll_interval()),
            nodes: Vec::new(),
            links: BTreeSet::new(),
            config,
        }
    }

    pub fn lock(&self) -> &P2pLock {
        &self.lock
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn add_node(&mut self, name: &str, rpc: Arc<dyn NodeRpc>, p2p_addr: SocketAddr) -> usize {
        self.nodes.push(NodeHandle {
            name: name.to_string(),
            rpc,
            p2p_addr,
            harness_peers: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> Result<&NodeHandle> {
        self.nodes
            .get(index)
            .ok_or_else(|| HarnessError::Topology(format!("Unknown node index {index}")))
    }

    fn node_mut(&mut self, index: usize) -> Result<&mut NodeHandle> {
        self.nodes
            .get_mut(index)
            .ok_or_else(|| HarnessError::Topology(format!("Unknown node index {index}")))
    }

    pub fn rpc(&self, index: usize) -> Result<&dyn NodeRpc> {
        Ok(self.node(index)?.rpc())
    }

    /// Link node `a` to node `b` by having `a` dial `b`'s wire endpoint
    pub fn connect(&mut self, a: usize, b: usize) -> Result<()> {
        if a == b {
            return Err(HarnessError::Topology(format!(
                "Cannot connect node {a} to itself"
            )));
        }
        let target = self.node(b)?.p2p_addr();
        let source = self.node(a)?;
        info!("Connecting {} to {} at {target}", source.name(), self.node(b)?.name());
        source.rpc().add_peer(target)?;
        self.links.insert(TopologyLink::new(a, b));
        Ok(())
    }

    pub fn links(&self) -> impl Iterator<Item = &TopologyLink> {
        self.links.iter()
    }

    pub fn linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&TopologyLink::new(a, b))
    }

    /// Every node reachable from `node` over recorded links, sorted
    pub fn component_of(&self, node: usize) -> Result<Vec<usize>> {
        self.node(node)?;
        let mut seen = BTreeSet::from([node]);
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            for next in self.links.iter().filter_map(|link| link.other(current)) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Attach a new harness peer to `node`; the node handle owns it
    pub fn add_harness_peer(&mut self, node: usize, policy: InvPolicy) -> Result<HarnessPeerId> {
        let options = ConnectionOptions::from_config(&self.config);
        let endpoint = self.node(node)?.p2p_addr();
        let peer = HarnessPeerHandle::connect(&self.lock, endpoint, &options, policy)?;
        let id = peer.id();
        self.node_mut(node)?.harness_peers.push(peer);
        Ok(id)
    }

    pub fn harness_peer(&self, node: usize, id: HarnessPeerId) -> Result<&HarnessPeerHandle> {
        let handle = self.node(node)?;
        handle
            .harness_peers
            .iter()
            .find(|peer| peer.id() == id)
            .ok_or_else(|| {
                HarnessError::Topology(format!(
                    "{} has no harness peer with id {id}",
                    handle.name()
                ))
            })
    }

    /// Tear down the harness connections of `node`; node-to-node links stay
    pub fn disconnect_all_harness_peers(&mut self, node: usize) -> Result<()> {
        let handle = self.node_mut(node)?;
        let peers: Vec<HarnessPeerHandle> = handle.harness_peers.drain(..).collect();
        info!("Disconnecting {} harness peer(s) from {}", peers.len(), handle.name);
        // Each handle disconnects and drops its stats as it goes out of scope
        drop(peers);
        Ok(())
    }

    /// Poll until every listed node reports a height of at least `target`
    pub fn await_height(&self, nodes: &[usize], target: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut lagging = Vec::new();
            for &index in nodes {
                let node = self.node(index)?;
                let height = node.rpc().get_block_count()?;
                if height < target {
                    lagging.push(format!("{} (height {height})", node.name()));
                }
            }
            if lagging.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Convergence {
                    target: format!("height {target}"),
                    lagging,
                });
            }
            debug!("Waiting for height {target}: {}", lagging.join(", "));
            self.sleep_until(deadline);
        }
    }

    /// Poll until every listed node reports the same best block
    pub fn sync_blocks(&self, nodes: &[usize], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut tips: Vec<(&str, BlockHash, u64)> = Vec::with_capacity(nodes.len());
            for &index in nodes {
                let node = self.node(index)?;
                let rpc = node.rpc();
                tips.push((node.name(), rpc.get_best_block_hash()?, rpc.get_block_count()?));
            }
            let Some(&(_, first, _)) = tips.first() else {
                return Ok(());
            };
            if tips.iter().all(|(_, tip, _)| *tip == first) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                // Report everyone not on the most advanced tip
                let best = tips.iter().map(|(_, _, h)| *h).max().unwrap_or(0);
                let leader = tips
                    .iter()
                    .find(|(_, _, h)| *h == best)
                    .map(|(_, tip, _)| *tip)
                    .unwrap_or(first);
                let lagging = tips
                    .iter()
                    .filter(|(_, tip, _)| *tip != leader)
                    .map(|(name, tip, height)| format!("{name} (height {height}, tip {tip})"))
                    .collect();
                return Err(HarnessError::Convergence {
                    target: format!("best block {leader}"),
                    lagging,
                });
            }
            self.sleep_until(deadline);
        }
    }

    /// Check that the listed nodes agree on the block id at every height
    /// from genesis up to `height`
    pub fn assert_chains_match(&self, nodes: &[usize], height: u64) -> Result<()> {
        let Some((&reference, others)) = nodes.split_first() else {
            return Ok(());
        };
        let reference = self.node(reference)?;
        for h in 0..=height {
            let expected = reference.rpc().get_block_hash(h)?;
            for &index in others {
                let node = self.node(index)?;
                let actual = node.rpc().get_block_hash(h)?;
                if actual != expected {
                    return Err(HarnessError::Assertion(format!(
                        "Chains diverge at height {h}: {} has {expected}, {} has {actual}",
                        reference.name(),
                        node.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn sleep_until(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(self.lock.poll_interval().min(remaining));
    }
}
