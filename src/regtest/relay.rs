use crate::core::{Block, BlockHash};
use crate::error::HarnessError;
use crate::network::{
    GetBlocksMessage, InvItem, InvType, Message, MessageHandler, Outbound, VersionMessage,
};
use crate::regtest::chain::{AcceptOutcome, Chain};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Most block hashes announced in answer to one `getblocks`
pub const MAX_BLOCKS_PER_INV: usize = 500;

/// State shared by every connection of one regtest node
pub struct RelayState {
    name: String,
    chain: Chain,
    peers: Mutex<HashMap<u64, Outbound>>,
    in_flight: Mutex<HashSet<BlockHash>>,
    next_conn_id: AtomicU64,
}

impl RelayState {
    pub fn new(name: &str, chain: Chain) -> RelayState {
        RelayState {
            name: name.to_string(),
            chain,
            peers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// A handler for one new connection of this node
    pub fn handler(self: &Arc<Self>) -> RelayHandler {
        RelayHandler {
            conn_id: self.next_conn_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(self),
            requested: HashSet::new(),
        }
    }

    /// Announce blocks to every connected peer except `source`
    pub fn announce(&self, hashes: &[BlockHash], source: Option<u64>) {
        if hashes.is_empty() {
            return;
        }
        let items: Vec<InvItem> = hashes.iter().copied().map(InvItem::block).collect();
        let peers: Vec<(u64, Outbound)> = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, out)| (*id, out.clone()))
            .collect();
        for (id, out) in peers {
            if Some(id) == source {
                continue;
            }
            if let Err(e) = out.send(Message::Inv(items.clone())) {
                debug!("{}: could not announce to {}: {e}", self.name, out.peer_addr());
            }
        }
    }

    fn register(&self, conn_id: u64, out: &Outbound) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, out.clone());
    }

    fn unregister(&self, conn_id: u64) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
    }

    /// Mark blocks as requested; returns the ones not already in flight
    fn start_download(&self, hashes: Vec<BlockHash>) -> Vec<BlockHash> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        hashes.into_iter().filter(|h| in_flight.insert(*h)).collect()
    }

    fn finish_download(&self, hash: &BlockHash) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
    }

    fn locator(&self) -> Vec<BlockHash> {
        vec![self.chain.read().tip()]
    }
}

/// Node-side message handling for one connection: fetch what peers
/// announce, serve what they request and pass new blocks on
pub struct RelayHandler {
    conn_id: u64,
    state: Arc<RelayState>,
    /// Blocks asked of this peer and not yet delivered
    requested: HashSet<BlockHash>,
}

impl RelayHandler {
    fn request_missing_parent(&self, out: &Outbound) {
        let request = GetBlocksMessage {
            locator: self.state.locator(),
            stop: BlockHash::ZERO,
        };
        if let Err(e) = out.send(Message::GetBlocks(request)) {
            debug!("{}: {e}", self.state.name);
        }
    }
}

impl MessageHandler for RelayHandler {
    fn on_open(&mut self, out: &Outbound, remote: &VersionMessage) {
        self.state.register(self.conn_id, out);
        let (height, tip) = {
            let chain = self.state.chain.read();
            (chain.height(), chain.tip())
        };
        // Covers blocks found between the handshake and registration
        if height > 0 {
            if let Err(e) = out.send(Message::Inv(vec![InvItem::block(tip)])) {
                debug!("{}: {e}", self.state.name);
            }
        }
        if remote.start_height > height {
            debug!(
                "{}: {} is ahead ({} > {height}), asking for blocks",
                self.state.name,
                out.peer_addr(),
                remote.start_height
            );
            self.request_missing_parent(out);
        }
    }

    fn on_inv(&mut self, out: &Outbound, items: &[InvItem]) {
        let unknown: Vec<BlockHash> = {
            let chain = self.state.chain.read();
            items
                .iter()
                .filter(|item| item.inv_type == InvType::Block && !chain.contains(&item.hash))
                .map(|item| item.hash)
                .collect()
        };
        let wanted = self.state.start_download(unknown);
        if wanted.is_empty() {
            return;
        }
        if let Err(e) = out.send(Message::get_blocks_data(&wanted)) {
            warn!("{}: {e}", self.state.name);
            for hash in &wanted {
                self.state.finish_download(hash);
            }
            return;
        }
        self.requested.extend(wanted);
    }

    fn on_getdata(&mut self, out: &Outbound, items: &[InvItem]) {
        let mut found: Vec<Block> = Vec::new();
        let mut missing: Vec<InvItem> = Vec::new();
        {
            let chain = self.state.chain.read();
            for item in items {
                match (item.inv_type, chain.block(&item.hash)) {
                    (InvType::Block, Some(block)) => found.push(block.clone()),
                    _ => missing.push(*item),
                }
            }
        }
        for block in found {
            if let Err(e) = out.send(Message::Block(block)) {
                debug!("{}: {e}", self.state.name);
                return;
            }
        }
        if !missing.is_empty() {
            let _ = out.send(Message::NotFound(missing));
        }
    }

    fn on_notfound(&mut self, _out: &Outbound, items: &[InvItem]) {
        for item in items {
            if self.requested.remove(&item.hash) {
                self.state.finish_download(&item.hash);
            }
        }
    }

    fn on_getblocks(&mut self, out: &Outbound, request: &GetBlocksMessage) {
        let hashes = self.state.chain.read().hashes_after(
            &request.locator,
            &request.stop,
            MAX_BLOCKS_PER_INV,
        );
        if hashes.is_empty() {
            return;
        }
        let items = hashes.into_iter().map(InvItem::block).collect();
        if let Err(e) = out.send(Message::Inv(items)) {
            debug!("{}: {e}", self.state.name);
        }
    }

    fn on_block(&mut self, out: &Outbound, block: &Block) {
        let hash = block.hash();
        if self.requested.remove(&hash) {
            self.state.finish_download(&hash);
        }
        match self.state.chain.accept(block.clone()) {
            Ok(AcceptOutcome::Connected(hashes)) => {
                info!(
                    "{}: accepted {} block(s) from {}",
                    self.state.name,
                    hashes.len(),
                    out.peer_addr()
                );
                self.state.announce(&hashes, Some(self.conn_id));
            }
            Ok(AcceptOutcome::AlreadyKnown) => {
                debug!("{}: already have {hash}", self.state.name);
            }
            Ok(AcceptOutcome::Orphan { missing_parent }) => {
                debug!(
                    "{}: {hash} is an orphan, missing {missing_parent}",
                    self.state.name
                );
                self.request_missing_parent(out);
            }
            Err(e) => warn!("{}: rejected block from {}: {e}", self.state.name, out.peer_addr()),
        }
    }

    fn on_close(&mut self, error: Option<&HarnessError>) {
        self.state.unregister(self.conn_id);
        // Let other peers serve what this one never delivered
        for hash in self.requested.drain() {
            self.state.finish_download(&hash);
        }
        if let Some(e) = error {
            debug!("{}: connection {} closed: {e}", self.state.name, self.conn_id);
        }
    }
}
