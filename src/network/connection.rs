use crate::config::HarnessConfig;
use crate::core::Block;
use crate::error::{HarnessError, Result};
use crate::network::codec::FrameCodec;
use crate::network::message::{
    GetBlocksMessage, InvItem, Message, VersionMessage, MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION,
};
use crate::utils::current_timestamp;
use log::{debug, info, warn};
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TCP_WRITE_TIMEOUT: u64 = 5000;

/// Network services we advertise (none: we serve no blocks of our own)
const NODE_NONE: u64 = 0;

/// Settings for establishing one connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub magic: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub user_agent: String,
    pub services: u64,
    pub start_height: u64,
    /// Identifies the local side so a connection to ourselves is refused
    pub nonce: u64,
}

impl ConnectionOptions {
    pub fn from_config(config: &HarnessConfig) -> ConnectionOptions {
        ConnectionOptions {
            magic: config.network_magic,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            user_agent: config.user_agent.clone(),
            services: NODE_NONE,
            start_height: 0,
            nonce: rand::random(),
        }
    }

    pub fn with_start_height(mut self, start_height: u64) -> Self {
        self.start_height = start_height;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    fn version_message(&self) -> Result<VersionMessage> {
        Ok(VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.services,
            timestamp: current_timestamp()?,
            nonce: self.nonce,
            user_agent: self.user_agent.clone(),
            start_height: self.start_height,
        })
    }
}

/// Callbacks for inbound messages, one per message kind.
///
/// The receive loop calls `on_message` for every decoded frame; the default
/// routes it through [`dispatch`]. Implementors override only the kinds they
/// care about.
pub trait MessageHandler: Send + 'static {
    /// Called on the receive thread once the handshake has completed
    fn on_open(&mut self, _out: &Outbound, _remote: &VersionMessage) {}

    fn on_message(&mut self, out: &Outbound, message: &Message) {
        dispatch(self, out, message);
    }

    fn on_version(&mut self, _out: &Outbound, _version: &VersionMessage) {}

    fn on_verack(&mut self, _out: &Outbound) {}

    fn on_ping(&mut self, out: &Outbound, nonce: u64) {
        if let Err(e) = out.send(Message::Pong(nonce)) {
            debug!("Could not answer ping from {}: {e}", out.peer_addr());
        }
    }

    fn on_pong(&mut self, _out: &Outbound, _nonce: u64) {}

    fn on_inv(&mut self, _out: &Outbound, _items: &[InvItem]) {}

    fn on_getdata(&mut self, _out: &Outbound, _items: &[InvItem]) {}

    fn on_notfound(&mut self, _out: &Outbound, _items: &[InvItem]) {}

    fn on_getblocks(&mut self, _out: &Outbound, _request: &GetBlocksMessage) {}

    fn on_block(&mut self, _out: &Outbound, _block: &Block) {}

    /// Called once when the receive loop ends. `None` means we closed it.
    fn on_close(&mut self, _error: Option<&HarnessError>) {}
}

/// Route a message to the handler method for its kind
pub fn dispatch<H: MessageHandler + ?Sized>(handler: &mut H, out: &Outbound, message: &Message) {
    match message {
        Message::Version(version) => handler.on_version(out, version),
        Message::Verack => handler.on_verack(out),
        Message::Ping(nonce) => handler.on_ping(out, *nonce),
        Message::Pong(nonce) => handler.on_pong(out, *nonce),
        Message::Inv(items) => handler.on_inv(out, items),
        Message::GetData(items) => handler.on_getdata(out, items),
        Message::NotFound(items) => handler.on_notfound(out, items),
        Message::GetBlocks(request) => handler.on_getblocks(out, request),
        Message::Block(block) => handler.on_block(out, block),
    }
}

struct Shared {
    peer_addr: SocketAddr,
    closed: AtomicBool,
    stream: TcpStream,
}

impl Shared {
    /// Mark closed and shut the socket; true only for the first caller
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        true
    }
}

/// Cloneable send capability for one connection
#[derive(Clone)]
pub struct Outbound {
    queue: Sender<Option<Message>>,
    shared: Arc<Shared>,
}

impl Outbound {
    /// Queue a message for the writer thread and return immediately
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(HarnessError::Connection(format!(
                "Connection to {} is closed, dropping {}",
                self.shared.peer_addr,
                message.kind()
            )));
        }
        self.queue.send(Some(message)).map_err(|_| {
            HarnessError::Connection(format!(
                "Writer for {} has stopped",
                self.shared.peer_addr
            ))
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the connection from inside a handler
    pub fn close(&self) {
        if self.shared.close() {
            let _ = self.queue.send(None);
        }
    }
}

/// One TCP stream to a node with its own receive and writer threads
pub struct Connection {
    remote_version: VersionMessage,
    outbound: Outbound,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Dial `endpoint` and run the version/verack handshake
    pub fn connect<H: MessageHandler>(
        endpoint: SocketAddr,
        options: &ConnectionOptions,
        handler: H,
    ) -> Result<Connection> {
        let stream = TcpStream::connect_timeout(&endpoint, options.connect_timeout).map_err(|e| {
            HarnessError::Handshake(format!("Failed to connect to {endpoint}: {e}"))
        })?;
        Self::establish(stream, endpoint, options, handler, true)
    }

    /// Run the responder side of the handshake on an accepted stream
    pub fn accept<H: MessageHandler>(
        stream: TcpStream,
        options: &ConnectionOptions,
        handler: H,
    ) -> Result<Connection> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| HarnessError::Handshake(format!("Failed to get peer address: {e}")))?;
        Self::establish(stream, peer_addr, options, handler, false)
    }

    fn establish<H: MessageHandler>(
        stream: TcpStream,
        peer_addr: SocketAddr,
        options: &ConnectionOptions,
        handler: H,
        initiator: bool,
    ) -> Result<Connection> {
        let codec = FrameCodec::new(options.magic);
        let _ = stream.set_nodelay(true);
        stream
            .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
            .map_err(|e| HarnessError::Handshake(format!("Failed to set write timeout: {e}")))?;

        let read_half = stream
            .try_clone()
            .map_err(|e| HarnessError::Handshake(format!("Failed to clone stream: {e}")))?;
        let mut reader = BufReader::new(read_half);
        let mut write_half = stream
            .try_clone()
            .map_err(|e| HarnessError::Handshake(format!("Failed to clone stream: {e}")))?;

        let remote_version = match handshake(
            &codec,
            &mut reader,
            &mut write_half,
            options,
            peer_addr,
            initiator,
        ) {
            Ok(version) => version,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(e);
            }
        };

        reader
            .get_ref()
            .set_read_timeout(None)
            .map_err(|e| HarnessError::Connection(format!("Failed to clear read timeout: {e}")))?;

        info!(
            "Connected to {peer_addr} ({}, version {}, height {})",
            remote_version.user_agent, remote_version.version, remote_version.start_height
        );

        let shared = Arc::new(Shared {
            peer_addr,
            closed: AtomicBool::new(false),
            stream,
        });
        let (queue, pending) = mpsc::channel();
        let outbound = Outbound { queue, shared };

        let writer = spawn_writer(codec, write_half, pending, outbound.shared.clone())?;
        let reader = spawn_reader(codec, reader, handler, outbound.clone(), remote_version.clone())?;

        Ok(Connection {
            remote_version,
            outbound,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Fire-and-forget send; ordering on this connection is preserved
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound.send(message)
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.outbound.peer_addr()
    }

    pub fn remote_version(&self) -> &VersionMessage {
        &self.remote_version
    }

    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Close the stream and wait for both threads; safe to call repeatedly
    pub fn disconnect(&mut self) {
        if self.outbound.shared.close() {
            info!("Disconnecting from {}", self.peer_addr());
        }
        let _ = self.outbound.queue.send(None);

        if let Some(reader) = self.reader.take() {
            // Dropped from inside its own handler: the loop exits on its own
            if reader.thread().id() != thread::current().id() {
                let _ = reader.join();
            }
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn handshake(
    codec: &FrameCodec,
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
    options: &ConnectionOptions,
    peer_addr: SocketAddr,
    initiator: bool,
) -> Result<VersionMessage> {
    let ours = options.version_message()?;
    let deadline = Instant::now() + options.handshake_timeout;

    if initiator {
        codec
            .write_message(writer, &Message::Version(ours.clone()))
            .map_err(|e| HarnessError::Handshake(e.to_string()))?;
    }

    let mut remote: Option<VersionMessage> = None;
    let mut got_verack = false;

    while remote.is_none() || !got_verack {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HarnessError::Handshake(format!(
                "Timed out after {}ms waiting for {} from {peer_addr}",
                options.handshake_timeout.as_millis(),
                if remote.is_none() { "version" } else { "verack" }
            )));
        }
        reader
            .get_ref()
            .set_read_timeout(Some(remaining))
            .map_err(|e| HarnessError::Handshake(format!("Failed to set read timeout: {e}")))?;

        let message = match codec.read_message(reader) {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(HarnessError::Handshake(format!(
                    "{peer_addr} closed the connection during handshake"
                )))
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(HarnessError::Handshake(format!(
                        "Timed out after {}ms during handshake with {peer_addr}",
                        options.handshake_timeout.as_millis()
                    )));
                }
                return Err(HarnessError::Handshake(format!(
                    "Handshake with {peer_addr} failed: {e}"
                )));
            }
        };

        match message {
            Message::Version(version) if remote.is_none() => {
                if version.version < MIN_PEER_PROTO_VERSION {
                    return Err(HarnessError::Handshake(format!(
                        "{peer_addr} uses obsolete protocol version {}",
                        version.version
                    )));
                }
                if version.nonce == options.nonce {
                    return Err(HarnessError::Handshake(format!(
                        "Connected to self at {peer_addr}"
                    )));
                }
                if !initiator {
                    codec
                        .write_message(writer, &Message::Version(ours.clone()))
                        .map_err(|e| HarnessError::Handshake(e.to_string()))?;
                }
                codec
                    .write_message(writer, &Message::Verack)
                    .map_err(|e| HarnessError::Handshake(e.to_string()))?;
                remote = Some(version);
            }
            Message::Verack if !got_verack => got_verack = true,
            other => {
                return Err(HarnessError::Handshake(format!(
                    "Unexpected {} from {peer_addr} during handshake",
                    other.kind()
                )))
            }
        }
    }

    remote.ok_or_else(|| HarnessError::Handshake("No version received".to_string()))
}

fn spawn_writer(
    codec: FrameCodec,
    mut stream: TcpStream,
    pending: Receiver<Option<Message>>,
    shared: Arc<Shared>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("peer-send-{}", shared.peer_addr))
        .spawn(move || {
            while let Ok(Some(message)) = pending.recv() {
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                debug!("Sending to {}: {message}", shared.peer_addr);
                if let Err(e) = codec.write_message(&mut stream, &message) {
                    warn!("{e}");
                    shared.close();
                    break;
                }
            }
        })
        .map_err(|e| HarnessError::Connection(format!("Failed to spawn writer thread: {e}")))
}

fn spawn_reader<H: MessageHandler>(
    codec: FrameCodec,
    mut reader: BufReader<TcpStream>,
    mut handler: H,
    out: Outbound,
    remote_version: VersionMessage,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("peer-recv-{}", out.peer_addr()))
        .spawn(move || {
            let peer_addr = out.peer_addr();
            handler.on_open(&out, &remote_version);

            let failure = loop {
                match codec.read_message(&mut reader) {
                    Ok(Some(message)) => {
                        debug!("Received from {peer_addr}: {message}");
                        handler.on_message(&out, &message);
                    }
                    Ok(None) => {
                        break HarnessError::Connection(format!("{peer_addr} closed the connection"))
                    }
                    Err(e) => break e,
                }
            };

            // A read failure after a local disconnect is just the shutdown
            let remote_initiated = out.shared.close();
            let _ = out.queue.send(None);
            if remote_initiated {
                warn!("Connection to {peer_addr} lost: {failure}");
                handler.on_close(Some(&failure));
            } else {
                handler.on_close(None);
            }
        })
        .map_err(|e| HarnessError::Connection(format!("Failed to spawn receive thread: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const MAGIC: u32 = 0xDAB5_BFFA;

    struct Silent;

    impl MessageHandler for Silent {}

    /// Listener that reads our `version` and answers with `reply`
    fn responder(reply: Message) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let codec = FrameCodec::new(MAGIC);
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            if let Ok(Some(Message::Version(_))) = codec.read_message(&mut reader) {
                codec.write_message(&mut writer, &reply).unwrap();
                // keep the socket open until the initiator hangs up
                let _ = codec.read_message(&mut reader);
            }
        });
        addr
    }

    fn handshake_error(reply: Message) -> HarnessError {
        let options = ConnectionOptions::from_config(&HarnessConfig::default());
        match Connection::connect(responder(reply), &options, Silent) {
            Ok(_) => panic!("handshake unexpectedly succeeded"),
            Err(e) => e,
        }
    }

    fn remote_version(version: u32) -> VersionMessage {
        VersionMessage {
            version,
            services: 1,
            timestamp: 0,
            nonce: 7,
            user_agent: "/responder/".to_string(),
            start_height: 0,
        }
    }

    #[test]
    fn test_obsolete_remote_version_fails_handshake() {
        let err = handshake_error(Message::Version(remote_version(100)));
        assert!(
            matches!(&err, HarnessError::Handshake(msg) if msg.contains("obsolete protocol version 100")),
            "{err:?}"
        );
    }

    #[test]
    fn test_message_before_version_fails_handshake() {
        let err = handshake_error(Message::Ping(1));
        assert!(
            matches!(&err, HarnessError::Handshake(msg) if msg.contains("Unexpected ping")),
            "{err:?}"
        );
    }

    #[test]
    fn test_minimum_remote_version_is_accepted() {
        let options = ConnectionOptions::from_config(&HarnessConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let codec = FrameCodec::new(MAGIC);
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let _ = codec.read_message(&mut reader);
            let version = Message::Version(remote_version(MIN_PEER_PROTO_VERSION));
            codec.write_message(&mut writer, &version).unwrap();
            codec.write_message(&mut writer, &Message::Verack).unwrap();
            while let Ok(Some(_)) = codec.read_message(&mut reader) {}
        });

        let mut connection = Connection::connect(addr, &options, Silent).unwrap();
        assert_eq!(connection.remote_version().version, MIN_PEER_PROTO_VERSION);
        connection.disconnect();
    }
}
