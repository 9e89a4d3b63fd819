use crate::core::{Block, BlockHash};
use crate::error::{HarnessError, Result};
use crate::harness::lock::{HarnessPeerId, P2pLock, PeerStats};
use crate::network::{
    dispatch, Connection, ConnectionOptions, InvItem, InvType, Message, MessageHandler, Outbound,
};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;

/// How a harness peer reacts to block announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvPolicy {
    /// Record the `inv` and do nothing else
    #[default]
    Ignore,
    /// Answer announced blocks with `getdata`
    RequestBlocks,
}

/// Receive-side half of a harness peer. Every inbound frame is recorded in
/// the shared state before it is routed to the per-kind callbacks.
struct HarnessPeer {
    id: HarnessPeerId,
    lock: P2pLock,
    policy: InvPolicy,
}

impl MessageHandler for HarnessPeer {
    fn on_message(&mut self, out: &Outbound, message: &Message) {
        let kind = message.kind();
        self.lock.update(|state| {
            let stats = state.peer_mut(self.id);
            *stats.message_counts.entry(kind).or_insert(0) += 1;
            stats.last_messages.insert(kind, message.clone());
        });
        dispatch(self, out, message);
    }

    fn on_inv(&mut self, out: &Outbound, items: &[InvItem]) {
        if self.policy != InvPolicy::RequestBlocks {
            return;
        }
        let wanted: Vec<InvItem> = items
            .iter()
            .filter(|item| item.inv_type == InvType::Block)
            .copied()
            .collect();
        if wanted.is_empty() {
            return;
        }
        if let Err(e) = out.send(Message::GetData(wanted)) {
            warn!("Harness peer {} could not request announced blocks: {e}", self.id);
        }
    }

    fn on_pong(&mut self, _out: &Outbound, nonce: u64) {
        self.lock.update(|state| state.peer_mut(self.id).last_pong = Some(nonce));
    }

    fn on_block(&mut self, _out: &Outbound, block: &Block) {
        let hash = block.hash();
        let count = self.lock.update(|state| {
            let receipts = &mut state.peer_mut(self.id).block_receipts;
            let count = receipts.entry(hash).or_insert(0);
            *count += 1;
            *count
        });
        debug!("Harness peer {} received block {hash} ({count}x)", self.id);
    }

    fn on_close(&mut self, error: Option<&HarnessError>) {
        self.lock.update(|state| {
            let stats = state.peer_mut(self.id);
            stats.connected = false;
            if let Some(e) = error {
                stats.error = Some(e.clone());
            }
        });
    }
}

/// A harness-originated connection to one node, owned by that node's handle
pub struct HarnessPeerHandle {
    id: HarnessPeerId,
    lock: P2pLock,
    connection: Connection,
}

impl HarnessPeerHandle {
    /// Register a fresh peer slot in the shared state and connect it
    pub fn connect(
        lock: &P2pLock,
        endpoint: SocketAddr,
        options: &ConnectionOptions,
        policy: InvPolicy,
    ) -> Result<HarnessPeerHandle> {
        let id = lock.update(|state| {
            let id = state.register_peer();
            state.peer_mut(id).connected = true;
            id
        });
        let handler = HarnessPeer {
            id,
            lock: lock.clone(),
            policy,
        };
        match Connection::connect(endpoint, options, handler) {
            Ok(connection) => {
                info!("Harness peer {id} connected to {endpoint}");
                Ok(HarnessPeerHandle {
                    id,
                    lock: lock.clone(),
                    connection,
                })
            }
            Err(e) => {
                lock.update(|state| state.remove_peer(id));
                Err(e)
            }
        }
    }

    pub fn id(&self) -> HarnessPeerId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// The node's advertised chain height at handshake time
    pub fn remote_start_height(&self) -> u64 {
        self.connection.remote_version().start_height
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.connection.send(message)
    }

    /// One `getdata` naming every hash, in order
    pub fn request_blocks(&self, hashes: &[BlockHash]) -> Result<()> {
        self.send(Message::get_blocks_data(hashes))
    }

    /// Copy of this peer's bookkeeping, taken under the lock
    pub fn snapshot(&self) -> PeerStats {
        self.lock
            .with(|state| state.peer(self.id).cloned())
            .unwrap_or_default()
    }

    pub fn clear_receipts(&self) {
        self.lock
            .update(|state| state.peer_mut(self.id).block_receipts.clear());
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
            && self
                .lock
                .with(|state| state.peer(self.id).map(|p| p.connected))
                .unwrap_or(false)
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Wait for a predicate over this peer's stats. Fails early with a
    /// connection error once the connection has died.
    pub fn wait_until<P>(&self, description: &str, timeout: Duration, mut predicate: P) -> Result<()>
    where
        P: FnMut(&PeerStats) -> bool,
    {
        let id = self.id;
        self.lock.try_wait_until(description, timeout, |state| {
            let stats = state.peer(id).ok_or_else(|| {
                HarnessError::Connection(format!("Harness peer {id} is not registered"))
            })?;
            if predicate(stats) {
                return Ok(true);
            }
            match (&stats.error, stats.connected) {
                (Some(e), _) => Err(HarnessError::Connection(format!(
                    "Harness peer {id} lost its connection while waiting for {description}: {e}"
                ))),
                (None, false) => Err(HarnessError::Connection(format!(
                    "Harness peer {id} was disconnected while waiting for {description}"
                ))),
                (None, true) => Ok(false),
            }
        })
    }

    /// Wait until the set of received blocks is exactly `hashes`
    pub fn wait_for_blocks(&self, hashes: &[BlockHash], timeout: Duration) -> Result<()> {
        let description = format!("receipt of exactly {} blocks", hashes.len());
        self.wait_until(&description, timeout, |stats| stats.received_exactly(hashes))
    }

    /// Request `hashes`, wait until each has arrived, then round-trip a ping
    /// so that any repeated block frame sent before the pong is counted too.
    pub fn fetch_blocks(&self, hashes: &[BlockHash], timeout: Duration) -> Result<PeerStats> {
        self.request_blocks(hashes)?;
        self.wait_for_blocks(hashes, timeout)?;
        self.sync_with_ping(timeout)?;
        Ok(self.snapshot())
    }

    /// Round-trip a ping; once the matching pong arrives the node has
    /// processed everything sent before it on this connection.
    pub fn sync_with_ping(&self, timeout: Duration) -> Result<()> {
        let nonce: u64 = rand::random();
        self.send(Message::Ping(nonce))?;
        self.wait_until(&format!("pong({nonce})"), timeout, |stats| {
            stats.last_pong == Some(nonce)
        })
    }
}

impl Drop for HarnessPeerHandle {
    // Disconnect first: the receive thread's close callback would otherwise
    // recreate the entry after it is removed.
    fn drop(&mut self) {
        self.connection.disconnect();
        let id = self.id;
        self.lock.update(|state| {
            state.remove_peer(id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::core::BlockBuilder;
    use crate::network::{FrameCodec, MessageKind, VersionMessage, PROTOCOL_VERSION};
    use std::io::{BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    const MAGIC: u32 = 0xDAB5_BFFA;

    fn options() -> ConnectionOptions {
        ConnectionOptions::from_config(&HarnessConfig::default())
    }

    /// Minimal scripted node: completes the handshake, then runs `script`
    fn scripted_node<F>(script: F) -> SocketAddr
    where
        F: FnOnce(&FrameCodec, &mut BufReader<std::net::TcpStream>, &mut std::net::TcpStream)
            + Send
            + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let codec = FrameCodec::new(MAGIC);
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            match codec.read_message(&mut reader).unwrap() {
                Some(Message::Version(_)) => {}
                other => panic!("expected version, got {other:?}"),
            }
            let version = VersionMessage {
                version: PROTOCOL_VERSION,
                services: 1,
                timestamp: 0,
                nonce: 7,
                user_agent: "/scripted/".to_string(),
                start_height: 0,
            };
            codec.write_message(&mut writer, &Message::Version(version)).unwrap();
            codec.write_message(&mut writer, &Message::Verack).unwrap();
            match codec.read_message(&mut reader).unwrap() {
                Some(Message::Verack) => {}
                other => panic!("expected verack, got {other:?}"),
            }
            script(&codec, &mut reader, &mut writer);
        });
        addr
    }

    #[test]
    fn test_block_receipts_are_counted_per_hash() {
        let genesis = BlockBuilder::genesis(1).unwrap();
        let block = BlockBuilder::new(1).build(genesis.hash(), 1, 10).unwrap();
        let sent = block.clone();
        let addr = scripted_node(move |codec, reader, writer| {
            codec.write_message(writer, &Message::Block(sent.clone())).unwrap();
            codec.write_message(writer, &Message::Block(sent)).unwrap();
            // hold the socket open until the peer goes away
            let _ = codec.read_message(reader);
        });

        let lock = P2pLock::new(Duration::from_millis(5));
        let peer = HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        peer.wait_until("two block frames", Duration::from_secs(5), |s| {
            s.receipt_count(&block.hash()) == 2
        })
        .unwrap();

        let stats = peer.snapshot();
        assert_eq!(stats.message_count(MessageKind::Block), 2);
        assert_eq!(stats.duplicates(), vec![(block.hash(), 2)]);
        assert!(matches!(stats.last_message(MessageKind::Block), Some(Message::Block(b)) if *b == block));

        peer.clear_receipts();
        assert!(peer.snapshot().block_receipts.is_empty());
    }

    #[test]
    fn test_request_blocks_policy_answers_inv() {
        let hash = BlockHash([9u8; 32]);
        let (tx, rx) = std::sync::mpsc::channel();
        let addr = scripted_node(move |codec, reader, writer| {
            codec
                .write_message(writer, &Message::Inv(vec![InvItem::block(hash)]))
                .unwrap();
            if let Ok(Some(message)) = codec.read_message(reader) {
                tx.send(message).unwrap();
            }
        });

        let lock = P2pLock::default();
        let _peer =
            HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::RequestBlocks).unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply, Message::get_blocks_data(&[hash]));
    }

    #[test]
    fn test_sync_with_ping_waits_for_matching_pong() {
        let addr = scripted_node(|codec, reader, writer| {
            while let Ok(Some(message)) = codec.read_message(reader) {
                if let Message::Ping(nonce) = message {
                    codec.write_message(writer, &Message::Pong(nonce)).unwrap();
                }
            }
        });

        let lock = P2pLock::default();
        let peer = HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        peer.sync_with_ping(Duration::from_secs(5)).unwrap();
        assert_eq!(peer.snapshot().message_count(MessageKind::Pong), 1);
    }

    #[test]
    fn test_fetch_blocks_counts_repeated_reply() {
        let genesis = BlockBuilder::genesis(1).unwrap();
        let block = BlockBuilder::new(1).build(genesis.hash(), 1, 10).unwrap();
        let hash = block.hash();
        let addr = scripted_node(move |codec, reader, writer| {
            while let Ok(Some(message)) = codec.read_message(reader) {
                match message {
                    Message::GetData(_) => {
                        codec.write_message(writer, &Message::Block(block.clone())).unwrap();
                        // a short pause so the first copy is seen before the second
                        thread::sleep(Duration::from_millis(50));
                        codec.write_message(writer, &Message::Block(block.clone())).unwrap();
                    }
                    Message::Ping(nonce) => {
                        codec.write_message(writer, &Message::Pong(nonce)).unwrap();
                    }
                    _ => {}
                }
            }
        });

        let lock = P2pLock::new(Duration::from_millis(5));
        let peer = HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        let stats = peer.fetch_blocks(&[hash], Duration::from_secs(5)).unwrap();
        assert_eq!(stats.receipt_count(&hash), 2);
        assert_eq!(stats.duplicates(), vec![(hash, 2)]);
    }

    #[test]
    fn test_waiter_fails_when_connection_dies() {
        let addr = scripted_node(|_, _, writer| {
            let _ = writer.shutdown(std::net::Shutdown::Both);
        });

        let lock = P2pLock::new(Duration::from_millis(5));
        let peer = HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        let result = peer.wait_for_blocks(&[BlockHash([1u8; 32])], Duration::from_secs(5));
        assert!(matches!(result, Err(HarnessError::Connection(_))), "{result:?}");
        assert!(!peer.is_connected());
    }

    #[test]
    fn test_corrupt_frame_reaches_waiter_as_connection_error() {
        let addr = scripted_node(|codec, reader, writer| {
            let mut bytes = codec.encode(&Message::Ping(1)).unwrap();
            // first checksum byte
            bytes[20] ^= 0xFF;
            writer.write_all(&bytes).unwrap();
            while let Ok(Some(_)) = codec.read_message(reader) {}
        });

        let lock = P2pLock::new(Duration::from_millis(5));
        let peer = HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        let result = peer.wait_for_blocks(&[BlockHash([1u8; 32])], Duration::from_secs(5));
        assert!(
            matches!(&result, Err(HarnessError::Connection(msg)) if msg.contains("Framing error")),
            "{result:?}"
        );
        assert!(matches!(peer.snapshot().error, Some(HarnessError::Framing(_))));
        assert!(!peer.is_connected());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let addr = scripted_node(|codec, reader, _| while let Ok(Some(_)) = codec.read_message(reader) {});

        let lock = P2pLock::default();
        let mut peer =
            HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        assert!(peer.is_connected());
        peer.disconnect();
        peer.disconnect();
        assert!(!peer.is_connected());
        assert!(peer.send(Message::Ping(1)).is_err());
        // a local close records no error
        assert_eq!(peer.snapshot().error, None);
    }

    #[test]
    fn test_dropping_handle_removes_its_stats() {
        let addr = scripted_node(|codec, reader, _| while let Ok(Some(_)) = codec.read_message(reader) {});

        let lock = P2pLock::default();
        let peer = HarnessPeerHandle::connect(&lock, addr, &options(), InvPolicy::Ignore).unwrap();
        let id = peer.id();
        assert!(lock.with(|state| state.peer(id).is_some()));

        drop(peer);
        assert!(lock.with(|state| state.peer(id).is_none()));
        assert!(lock.with(|state| state.peer_ids().is_empty()));
    }
}
