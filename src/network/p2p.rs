//! TCP gossip transport.
//!
//! A single `Swarm` task owns the peer table. Every connection, inbound or
//! dialed, first swaps `Hello` frames (protocol version and chain id) and is
//! dropped on mismatch. An accepted link gets a reader task that forwards
//! decoded messages to the swarm and a writer task draining a bounded outbox,
//! so a slow peer only ever fills its own queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::constants::{
    MAX_NETWORK_MESSAGE_BYTES, PEER_CONNECT_TIMEOUT_MS, PEER_MSG_BURST, PEER_MSG_RATE_LIMIT,
    PROTOCOL_VERSION,
};
use crate::network::protocol::{decode_message, encode_message};
use crate::network::{Message, PeerId};
use crate::Hash;

/// Limit for the `Hello` frame, read before the peer is known.
const MAX_HELLO_BYTES: usize = 64 * 1024;

/// Handshakes allowed in flight at once.
const MAX_PENDING_HANDSHAKES: usize = 16;

/// Capacity of the command, event and per-peer outbox channels.
const CHANNEL_CAPACITY: usize = 256;

/// Errors from P2P operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum P2pError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),
    #[error("shutdown")]
    Shutdown,
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        P2pError::ConnectionFailed(e.to_string())
    }
}

/// Requests from the node to the swarm.
pub enum P2pCommand {
    Connect(SocketAddr),
    SendTo(PeerId, Message),
    /// Send to every peer except `exclude` (usually the one it came from).
    Broadcast {
        message: Message,
        exclude: Option<PeerId>,
    },
    PeerCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Notifications from the swarm to the node.
#[derive(Debug)]
pub enum P2pEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    MessageReceived { from: PeerId, message: Box<Message> },
}

/// Cloneable front end of the swarm task.
#[derive(Clone)]
pub struct P2pHandle {
    command_tx: mpsc::Sender<P2pCommand>,
}

#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub listen_addr: SocketAddr,
    pub max_peers: usize,
    pub our_peer_id: PeerId,
    pub chain_id: Hash,
    /// Advertised in `Hello` so peers can dial back.
    pub listen_port: u16,
}

impl P2pHandle {
    /// Wrap an existing command channel (used by tests that stand in for the swarm).
    pub fn from_sender(command_tx: mpsc::Sender<P2pCommand>) -> Self {
        P2pHandle { command_tx }
    }

    async fn command(&self, command: P2pCommand) -> Result<(), P2pError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<(), P2pError> {
        self.command(P2pCommand::Connect(addr)).await
    }

    pub async fn send_to(&self, peer_id: PeerId, msg: Message) -> Result<(), P2pError> {
        self.command(P2pCommand::SendTo(peer_id, msg)).await
    }

    pub async fn broadcast(&self, msg: Message, exclude: Option<PeerId>) -> Result<(), P2pError> {
        self.command(P2pCommand::Broadcast {
            message: msg,
            exclude,
        })
        .await
    }

    pub async fn peer_count(&self) -> Result<usize, P2pError> {
        let (reply, count) = oneshot::channel();
        self.command(P2pCommand::PeerCount(reply)).await?;
        count.await.map_err(|_| P2pError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<(), P2pError> {
        self.command(P2pCommand::Shutdown).await
    }
}

/// What `start` hands back to the node.
pub struct P2pStartResult {
    pub handle: P2pHandle,
    pub events: mpsc::Receiver<P2pEvent>,
    /// The bound address (differs from the configured one for port 0).
    pub local_addr: SocketAddr,
}

/// Bind the listener and spawn the swarm task.
pub async fn start(config: P2pConfig) -> Result<P2pStartResult, P2pError> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let local_addr = listener.local_addr()?;

    let (command_tx, commands) = mpsc::channel(CHANNEL_CAPACITY);
    let (events_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
    let (links_tx, links) = mpsc::channel(CHANNEL_CAPACITY);

    let swarm = Swarm {
        config,
        peers: HashMap::new(),
        links_tx,
        handshakes: Arc::new(Semaphore::new(MAX_PENDING_HANDSHAKES)),
        events: events_tx,
    };
    tokio::spawn(swarm.run(listener, commands, links));

    Ok(P2pStartResult {
        handle: P2pHandle { command_tx },
        events,
        local_addr,
    })
}

// ── Swarm ──

struct PeerLink {
    addr: SocketAddr,
    outbox: mpsc::Sender<Message>,
}

/// Reports from per-connection tasks.
enum LinkEvent {
    Up {
        peer_id: PeerId,
        addr: SocketAddr,
        outbox: mpsc::Sender<Message>,
    },
    Inbound {
        from: PeerId,
        message: Box<Message>,
    },
    Down(PeerId),
}

enum Dial {
    Accepted(TcpStream),
    Outbound,
}

struct Swarm {
    config: P2pConfig,
    peers: HashMap<PeerId, PeerLink>,
    links_tx: mpsc::Sender<LinkEvent>,
    handshakes: Arc<Semaphore>,
    events: mpsc::Sender<P2pEvent>,
}

impl Swarm {
    async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::Receiver<P2pCommand>,
        mut links: mpsc::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.open_link(Dial::Accepted(stream), addr),
                    Err(e) => tracing::debug!(error = %e, "accept failed"),
                },
                Some(command) = commands.recv() => {
                    if !self.on_command(command) {
                        break;
                    }
                }
                Some(event) = links.recv() => self.on_link_event(event).await,
            }
        }
        tracing::debug!(peers = self.peers.len(), "p2p swarm stopped");
    }

    fn is_full(&self) -> bool {
        self.peers.len() >= self.config.max_peers
    }

    /// Handshake in the background; the link reports back through `links_tx`.
    fn open_link(&self, dial: Dial, addr: SocketAddr) {
        if self.is_full() {
            return;
        }
        let config = self.config.clone();
        let links_tx = self.links_tx.clone();
        let handshakes = Arc::clone(&self.handshakes);
        tokio::spawn(async move {
            let Ok(_permit) = handshakes.acquire_owned().await else {
                return;
            };
            let stream = match dial {
                Dial::Accepted(stream) => Ok(stream),
                Dial::Outbound => dial_peer(addr).await,
            };
            let result = match stream {
                Ok(stream) => establish(stream, addr, &config, links_tx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!(addr = %addr, error = %e, "peer link not established");
            }
        });
    }

    /// Queue a message for one peer without waiting on its socket.
    fn deliver(peer_id: &PeerId, link: &PeerLink, message: Message) {
        if let Err(e) = link.outbox.try_send(message) {
            tracing::debug!(peer = %hex::encode(&peer_id[..8]), error = %e, "peer outbox full");
        }
    }

    /// Returns false once the swarm should stop.
    fn on_command(&mut self, command: P2pCommand) -> bool {
        match command {
            P2pCommand::Connect(addr) => self.open_link(Dial::Outbound, addr),
            P2pCommand::SendTo(peer_id, message) => {
                if let Some(link) = self.peers.get(&peer_id) {
                    Self::deliver(&peer_id, link, message);
                }
            }
            P2pCommand::Broadcast { message, exclude } => {
                for (peer_id, link) in &self.peers {
                    if exclude != Some(*peer_id) {
                        Self::deliver(peer_id, link, message.clone());
                    }
                }
            }
            P2pCommand::PeerCount(reply) => {
                let _ = reply.send(self.peers.len());
            }
            P2pCommand::Shutdown => return false,
        }
        true
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up {
                peer_id,
                addr,
                outbox,
            } => {
                if peer_id == self.config.our_peer_id {
                    tracing::debug!(addr = %addr, "dropped connection to self");
                    return;
                }
                if self.is_full() || self.peers.contains_key(&peer_id) {
                    return;
                }
                tracing::info!(peer = %hex::encode(&peer_id[..8]), addr = %addr, "peer connected");
                self.peers.insert(peer_id, PeerLink { addr, outbox });
                let _ = self.events.send(P2pEvent::PeerConnected(peer_id)).await;
            }
            LinkEvent::Inbound { from, message } => {
                let _ = self
                    .events
                    .send(P2pEvent::MessageReceived { from, message })
                    .await;
            }
            LinkEvent::Down(peer_id) => {
                if let Some(link) = self.peers.remove(&peer_id) {
                    tracing::info!(peer = %hex::encode(&peer_id[..8]), addr = %link.addr, "peer disconnected");
                    let _ = self.events.send(P2pEvent::PeerDisconnected(peer_id)).await;
                }
            }
        }
    }
}

// ── Links ──

fn connect_timeout() -> Duration {
    Duration::from_millis(PEER_CONNECT_TIMEOUT_MS)
}

async fn dial_peer(addr: SocketAddr) -> Result<TcpStream, P2pError> {
    match tokio::time::timeout(connect_timeout(), TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(P2pError::ConnectionFailed("connect timeout".into())),
    }
}

/// Send our `Hello` and check theirs. Both ends write first, so it does not
/// matter who dialed.
async fn exchange_hello(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    config: &P2pConfig,
) -> Result<PeerId, P2pError> {
    let hello = Message::Hello {
        version: PROTOCOL_VERSION,
        chain_id: config.chain_id,
        peer_id: config.our_peer_id,
        listen_port: config.listen_port,
    };
    write_frame(writer, &hello).await?;
    let Message::Hello {
        version,
        chain_id,
        peer_id,
        ..
    } = read_frame(reader, MAX_HELLO_BYTES).await?
    else {
        return Err(P2pError::InvalidHandshake("expected hello"));
    };
    if version != PROTOCOL_VERSION {
        return Err(P2pError::InvalidHandshake("protocol version mismatch"));
    }
    if chain_id != config.chain_id {
        return Err(P2pError::InvalidHandshake("peer is on another chain"));
    }
    Ok(peer_id)
}

/// Handshake, register the link with the swarm, then start its tasks.
async fn establish(
    stream: TcpStream,
    addr: SocketAddr,
    config: &P2pConfig,
    links_tx: mpsc::Sender<LinkEvent>,
) -> Result<(), P2pError> {
    let (mut reader, mut writer) = stream.into_split();
    let peer_id = tokio::time::timeout(
        connect_timeout(),
        exchange_hello(&mut reader, &mut writer, config),
    )
    .await
    .map_err(|_| P2pError::ConnectionFailed("handshake timeout".into()))??;

    let (outbox, outbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
    links_tx
        .send(LinkEvent::Up {
            peer_id,
            addr,
            outbox,
        })
        .await
        .map_err(|_| P2pError::Shutdown)?;

    tokio::spawn(read_loop(peer_id, reader, links_tx.clone()));
    tokio::spawn(write_loop(peer_id, writer, outbox_rx, links_tx));
    Ok(())
}

/// Forward inbound frames until the socket fails. Frames past the peer's
/// rate budget are dropped.
async fn read_loop(peer_id: PeerId, mut reader: OwnedReadHalf, links_tx: mpsc::Sender<LinkEvent>) {
    let mut budget = TokenBucket::new(PEER_MSG_BURST, PEER_MSG_RATE_LIMIT);
    loop {
        let message = match read_frame(&mut reader, MAX_NETWORK_MESSAGE_BYTES).await {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(peer = %hex::encode(&peer_id[..8]), error = %e, "read failed");
                let _ = links_tx.send(LinkEvent::Down(peer_id)).await;
                return;
            }
        };
        if !budget.take() {
            tracing::debug!(peer = %hex::encode(&peer_id[..8]), "rate limit exceeded, dropping message");
            continue;
        }
        let event = LinkEvent::Inbound {
            from: peer_id,
            message: Box::new(message),
        };
        if links_tx.send(event).await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    peer_id: PeerId,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Message>,
    links_tx: mpsc::Sender<LinkEvent>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            tracing::debug!(peer = %hex::encode(&peer_id[..8]), error = %e, "write failed");
            let _ = links_tx.send(LinkEvent::Down(peer_id)).await;
            return;
        }
    }
}

/// Per-peer message budget: `capacity` messages up front, refilled at
/// `refill_per_sec`.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        TokenBucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            refilled_at: Instant::now(),
        }
    }

    fn take(&mut self) -> bool {
        let now = Instant::now();
        let earned = now.duration_since(self.refilled_at).as_secs_f64() * self.refill_per_sec;
        self.tokens = (self.tokens + earned).min(self.capacity);
        self.refilled_at = now;
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

// ── Frames ──

/// Read one length-prefixed frame, refusing lengths above `max_len` before
/// allocating.
async fn read_frame(reader: &mut OwnedReadHalf, max_len: usize) -> Result<Message, P2pError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(P2pError::ConnectionFailed(format!("frame of {} bytes too large", len)));
    }
    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[4..]).await?;
    decode_message(&frame).ok_or_else(|| P2pError::ConnectionFailed("undecodable frame".into()))
}

async fn write_frame(writer: &mut OwnedWriteHalf, message: &Message) -> Result<(), P2pError> {
    let frame = encode_message(message).map_err(|e| P2pError::SendFailed(e.to_string()))?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| P2pError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| P2pError::SendFailed(e.to_string()))
}
