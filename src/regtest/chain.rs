use crate::core::{Block, BlockBuilder, BlockHash, ProofOfWork};
use crate::error::{HarnessError, Result};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound on blocks held while their parent is unknown
const MAX_ORPHANS: usize = 256;

/// Result of offering a block to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Stored, together with any orphans it unlocked, in connection order
    Connected(Vec<BlockHash>),
    AlreadyKnown,
    /// Parent unknown; held until the parent arrives
    Orphan { missing_parent: BlockHash },
}

/// In-memory block tree with a longest-chain active view
#[derive(Debug)]
pub struct ChainState {
    difficulty: u32,
    blocks: HashMap<BlockHash, Block>,
    /// Active chain, indexed by height
    active: Vec<BlockHash>,
    /// Parent hash -> blocks waiting for it
    orphans: HashMap<BlockHash, Vec<Block>>,
}

impl ChainState {
    pub fn new(difficulty: u32) -> Result<ChainState> {
        let genesis = BlockBuilder::genesis(difficulty)?;
        let hash = genesis.hash();
        Ok(ChainState {
            difficulty,
            blocks: HashMap::from([(hash, genesis)]),
            active: vec![hash],
            orphans: HashMap::new(),
        })
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn height(&self) -> u64 {
        self.active.len() as u64 - 1
    }

    pub fn tip(&self) -> BlockHash {
        self.active[self.active.len() - 1]
    }

    pub fn tip_block(&self) -> Option<&Block> {
        self.blocks.get(&self.tip())
    }

    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.active.get(h))
            .copied()
    }

    pub fn block(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash) || self.is_orphan(hash)
    }

    fn is_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans
            .values()
            .any(|waiting| waiting.iter().any(|b| b.hash() == *hash))
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    /// Active-chain hashes following the first locator entry we know, up to
    /// and including `stop` (or the tip), at most `limit` of them
    pub fn hashes_after(&self, locator: &[BlockHash], stop: &BlockHash, limit: usize) -> Vec<BlockHash> {
        let start = locator
            .iter()
            .find_map(|hash| self.active_height(hash))
            .unwrap_or(0);
        let mut hashes = Vec::new();
        for hash in self.active.iter().skip(start + 1).take(limit) {
            hashes.push(*hash);
            if hash == stop {
                break;
            }
        }
        hashes
    }

    fn active_height(&self, hash: &BlockHash) -> Option<usize> {
        let block = self.blocks.get(hash)?;
        let height = usize::try_from(block.get_height()).ok()?;
        (self.active.get(height) == Some(hash)).then_some(height)
    }

    /// Relay-level validation only: structure, proof-of-work, linkage, height
    pub fn accept(&mut self, block: Block) -> Result<AcceptOutcome> {
        let hash = block.hash();
        if self.contains(&hash) {
            return Ok(AcceptOutcome::AlreadyKnown);
        }
        self.check(&block)?;

        let parent = block.get_prev_hash();
        if !self.blocks.contains_key(&parent) {
            if self.orphan_count() >= MAX_ORPHANS {
                return Err(HarnessError::InvalidBlock(format!(
                    "Orphan pool full, dropping {hash}"
                )));
            }
            debug!("Holding orphan {hash} until {parent} arrives");
            self.orphans.entry(parent).or_default().push(block);
            return Ok(AcceptOutcome::Orphan {
                missing_parent: parent,
            });
        }

        let mut connected = Vec::new();
        let mut pending = vec![block];
        while let Some(block) = pending.pop() {
            let hash = block.hash();
            if let Err(e) = self.connect(block) {
                // An invalid orphan only drops itself and its descendants
                if connected.is_empty() {
                    return Err(e);
                }
                debug!("Dropping orphan {hash}: {e}");
                continue;
            }
            connected.push(hash);
            if let Some(children) = self.orphans.remove(&hash) {
                pending.extend(children);
            }
        }
        Ok(AcceptOutcome::Connected(connected))
    }

    fn check(&self, block: &Block) -> Result<()> {
        block.check_structure()?;
        if block.get_difficulty() != self.difficulty {
            return Err(HarnessError::InvalidBlock(format!(
                "Block {} has difficulty {}, network requires {}",
                block.hash(),
                block.get_difficulty(),
                self.difficulty
            )));
        }
        if !ProofOfWork::validate(block.header()) {
            return Err(HarnessError::InvalidBlock(format!(
                "Block {} does not meet its proof-of-work target",
                block.hash()
            )));
        }
        Ok(())
    }

    fn connect(&mut self, block: Block) -> Result<()> {
        let hash = block.hash();
        let parent = self.blocks.get(&block.get_prev_hash()).ok_or_else(|| {
            HarnessError::InvalidBlock(format!("Parent of {hash} is unknown"))
        })?;
        if block.get_height() != parent.get_height() + 1 {
            return Err(HarnessError::InvalidBlock(format!(
                "Block {hash} claims height {} on a parent at height {}",
                block.get_height(),
                parent.get_height()
            )));
        }

        let height = block.get_height();
        self.blocks.insert(hash, block);
        if height > self.height() {
            self.activate(hash)?;
            info!("New tip {hash} at height {height}");
        }
        Ok(())
    }

    /// Make `tip` the active chain, rewinding to the fork point if needed
    fn activate(&mut self, tip: BlockHash) -> Result<()> {
        let mut branch = Vec::new();
        let mut cursor = tip;
        while self.active_height(&cursor).is_none() {
            let block = self.blocks.get(&cursor).ok_or_else(|| {
                HarnessError::InvalidBlock(format!("Block {cursor} missing from the block tree"))
            })?;
            branch.push(cursor);
            cursor = block.get_prev_hash();
        }
        let fork = self.active_height(&cursor).unwrap_or(0);
        if fork + 1 < self.active.len() {
            info!(
                "Reorganizing: {} block(s) disconnected above height {fork}",
                self.active.len() - fork - 1
            );
        }
        self.active.truncate(fork + 1);
        self.active.extend(branch.into_iter().rev());
        Ok(())
    }
}

/// Shared chain with a condition variable for height waits
#[derive(Debug)]
pub struct Chain {
    state: Mutex<ChainState>,
    grown: Condvar,
}

impl Chain {
    pub fn new(difficulty: u32) -> Result<Chain> {
        Ok(Chain {
            state: Mutex::new(ChainState::new(difficulty)?),
            grown: Condvar::new(),
        })
    }

    pub fn read(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accept(&self, block: Block) -> Result<AcceptOutcome> {
        let outcome = self.read().accept(block)?;
        if matches!(outcome, AcceptOutcome::Connected(_)) {
            self.grown.notify_all();
        }
        Ok(outcome)
    }

    /// Wait until the active height is at least `height`; returns the
    /// height at the time the wait ended
    pub fn wait_for_height(&self, height: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut state = self.read();
        while state.height() < height {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            state = self
                .grown
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        state.height()
    }
}
