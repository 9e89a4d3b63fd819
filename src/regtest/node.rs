use crate::config::HarnessConfig;
use crate::core::{BlockBuilder, BlockHash};
use crate::error::{HarnessError, Result};
use crate::harness::{BlockInfo, Network, NodeRpc};
use crate::network::{Connection, ConnectionOptions};
use crate::regtest::chain::{AcceptOutcome, Chain};
use crate::regtest::relay::RelayState;
use crate::utils::current_timestamp;
use log::{error, info, warn};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

const NODE_USER_AGENT: &str = "/relay-harness-regtest:0.1.0/";

/// Services bit advertised by a node that serves full blocks
const NODE_NETWORK: u64 = 1;

/// An in-process node-under-test: an in-memory chain behind a real wire
/// protocol listener, driven through [`NodeRpc`] instead of a daemon
pub struct RegtestNode {
    state: Arc<RelayState>,
    p2p_addr: SocketAddr,
    options: ConnectionOptions,
    difficulty: u32,
    connections: Arc<Mutex<Vec<Connection>>>,
    stopping: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl RegtestNode {
    /// Bind an ephemeral port on the configured host and start accepting
    pub fn start(name: &str, config: &HarnessConfig) -> Result<RegtestNode> {
        let chain = Chain::new(config.difficulty)?;
        let state = Arc::new(RelayState::new(name, chain));

        let bind_addr = format!("{}:0", config.bind_host);
        let listener = TcpListener::bind(&bind_addr)
            .map_err(|e| HarnessError::Io(format!("{name}: failed to bind {bind_addr}: {e}")))?;
        let p2p_addr = listener.local_addr()?;

        let mut options = ConnectionOptions::from_config(config);
        options.user_agent = NODE_USER_AGENT.to_string();
        options.services = NODE_NETWORK;

        let connections = Arc::new(Mutex::new(Vec::new()));
        let stopping = Arc::new(AtomicBool::new(false));
        let acceptor = spawn_acceptor(
            listener,
            Arc::clone(&state),
            options.clone(),
            Arc::clone(&connections),
            Arc::clone(&stopping),
        )?;

        info!("{name} listening on {p2p_addr}");
        Ok(RegtestNode {
            state,
            p2p_addr,
            options,
            difficulty: config.difficulty,
            connections,
            stopping,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    /// Live peer connections, inbound and outbound
    pub fn peer_count(&self) -> usize {
        self.state.peer_count()
    }

    /// Stop accepting and close every connection; safe to call repeatedly
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down {}", self.name());
        // Unblock the accept loop
        let _ = TcpStream::connect_timeout(&self.p2p_addr, Duration::from_secs(1));
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.join();
        }

        let connections: Vec<Connection> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut connection in connections {
            connection.disconnect();
        }
    }

    fn options(&self) -> ConnectionOptions {
        let height = self.state.chain().read().height();
        self.options.clone().with_start_height(height)
    }
}

/// Start `count` regtest nodes named `node0..` and register them with a new
/// harness network. No links are made; the caller decides the topology.
pub fn start_network(count: usize, config: &HarnessConfig) -> Result<(Network, Vec<Arc<RegtestNode>>)> {
    let mut network = Network::new(config.clone());
    let mut nodes = Vec::with_capacity(count);
    for index in 0..count {
        let node = Arc::new(RegtestNode::start(&format!("node{index}"), config)?);
        network.add_node(node.name(), node.clone(), node.p2p_addr());
        nodes.push(node);
    }
    Ok((network, nodes))
}

impl Drop for RegtestNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_acceptor(
    listener: TcpListener,
    state: Arc<RelayState>,
    options: ConnectionOptions,
    connections: Arc<Mutex<Vec<Connection>>>,
    stopping: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-accept", state.name()))
        .spawn(move || {
            for stream in listener.incoming() {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("{}: error accepting connection: {e}", state.name());
                        continue;
                    }
                };

                // Handshake off the accept loop so a silent peer cannot stall it
                let state = Arc::clone(&state);
                let options = options
                    .clone()
                    .with_start_height(state.chain().read().height());
                let connections = Arc::clone(&connections);
                let stopping = Arc::clone(&stopping);
                thread::spawn(move || {
                    match Connection::accept(stream, &options, state.handler()) {
                        Ok(connection) => {
                            if stopping.load(Ordering::SeqCst) {
                                return;
                            }
                            store(&connections, connection);
                        }
                        Err(e) => warn!("{}: inbound handshake failed: {e}", state.name()),
                    }
                });
            }
        })
        .map_err(|e| HarnessError::Io(format!("Failed to spawn accept thread: {e}")))
}

fn store(connections: &Mutex<Vec<Connection>>, connection: Connection) {
    let mut connections = connections.lock().unwrap_or_else(PoisonError::into_inner);
    connections.retain(Connection::is_connected);
    connections.push(connection);
}

impl NodeRpc for RegtestNode {
    fn generate(&self, count: u32) -> Result<Vec<BlockHash>> {
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (parent, height, parent_time) = {
                let chain = self.state.chain().read();
                let tip = chain
                    .tip_block()
                    .ok_or_else(|| HarnessError::Rpc(format!("{}: tip block missing", self.name())))?;
                (tip.hash(), tip.get_height() + 1, tip.get_time())
            };
            let time = current_timestamp()?.max(parent_time + 1);
            let extra_nonce = Uuid::new_v4();
            let block = BlockBuilder::new(self.difficulty)
                .with_extra_nonce(extra_nonce.as_bytes())
                .build(parent, height, time)?;
            let hash = block.hash();

            match self.state.chain().accept(block) {
                Ok(AcceptOutcome::Connected(connected)) => {
                    info!("{} generated block {hash} at height {height}", self.name());
                    self.state.announce(&connected, None);
                }
                Ok(other) => {
                    return Err(HarnessError::Rpc(format!(
                        "{}: generated block {hash} was not connected: {other:?}",
                        self.name()
                    )))
                }
                Err(e) => return Err(HarnessError::Rpc(e.to_string())),
            }
            hashes.push(hash);
        }
        Ok(hashes)
    }

    fn get_block_count(&self) -> Result<u64> {
        Ok(self.state.chain().read().height())
    }

    fn get_best_block_hash(&self) -> Result<BlockHash> {
        Ok(self.state.chain().read().tip())
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash> {
        self.state
            .chain()
            .read()
            .hash_at(height)
            .ok_or_else(|| HarnessError::Rpc(format!("Block height {height} out of range")))
    }

    fn get_block(&self, hash: &BlockHash) -> Result<BlockInfo> {
        self.state
            .chain()
            .read()
            .block(hash)
            .map(BlockInfo::from_block)
            .ok_or_else(|| HarnessError::Rpc(format!("Block {hash} not found")))
    }

    fn wait_for_block_height(&self, height: u64, timeout: Duration) -> Result<u64> {
        Ok(self.state.chain().wait_for_height(height, timeout))
    }

    fn add_peer(&self, endpoint: SocketAddr) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(HarnessError::Rpc(format!("{} is shutting down", self.name())));
        }
        let connection = Connection::connect(endpoint, &self.options(), self.state.handler())
            .map_err(|e| HarnessError::Rpc(format!("{}: addnode {endpoint} failed: {e}", self.name())))?;
        store(&self.connections, connection);
        Ok(())
    }
}
