//! Node orchestrator tying together the consensus engine, P2P and storage.
//!
//! Incoming messages are deduplicated against a two-generation seen-set and
//! routed to one queue per topic; the main loop drains those queues, ticks
//! the engine, and periodically polls peers to detect that it fell behind.
//! Everything the engine emits is broadcast, and only messages the engine
//! accepted are re-gossiped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::storage::{SledStorage, StorageError};
use crate::chain::{Blockchain, ChainError};
use crate::consensus::engine::Engine;
use crate::crypto::keys::SigningKeypair;
use crate::genesis::{GenesisConfig, GenesisError};
use crate::network::p2p::{self, P2pConfig, P2pEvent, P2pHandle};
use crate::network::{Message, PeerId, Topic};
use crate::Hash;

/// Maximum number of entries in one generation of the seen-message set.
const SEEN_MESSAGES_CAPACITY: usize = 10_000;

/// Capacity of each per-topic inbound queue.
const TOPIC_QUEUE_CAPACITY: usize = 1_024;

/// Shared node state accessible from RPC handlers.
pub struct NodeState {
    pub engine: Engine,
    /// Time the node was started (for status reporting).
    pub node_start_time: Instant,
}

/// Node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub data_dir: PathBuf,
    pub rpc_addr: SocketAddr,
    pub keypair: SigningKeypair,
    /// If true, propose and approve blocks when on the committee.
    pub validator: bool,
    pub max_peers: usize,
    pub genesis: GenesisConfig,
}

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("genesis error: {0}")]
    Genesis(#[from] GenesisError),
    #[error("P2P error: {0}")]
    P2p(#[from] crate::network::p2p::P2pError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Name of the validator key file inside the data directory.
const KEY_FILE: &str = "validator.key";

/// Key file layout: `[public key length: u32 LE][public key][secret key]`.
fn encode_key_file(keypair: &SigningKeypair) -> Vec<u8> {
    let public = keypair.public.as_bytes();
    let secret = &keypair.secret.0;
    let mut bytes = Vec::with_capacity(4 + public.len() + secret.len());
    bytes.extend_from_slice(&(public.len() as u32).to_le_bytes());
    bytes.extend_from_slice(public);
    bytes.extend_from_slice(secret);
    bytes
}

fn decode_key_file(bytes: &[u8]) -> Result<SigningKeypair, std::io::Error> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());
    let (prefix, rest) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| invalid("key file too short"))?;
    let public_len = u32::from_le_bytes(*prefix) as usize;
    if rest.len() < public_len {
        return Err(invalid("key file truncated"));
    }
    let (public, secret) = rest.split_at(public_len);
    SigningKeypair::from_bytes(public.to_vec(), secret.to_vec())
        .ok_or_else(|| invalid("key file holds malformed key material"))
}

/// Load `validator.key` from `data_dir`, creating the directory and a fresh
/// key (readable only by the owner) on first run.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<SigningKeypair, std::io::Error> {
    let path = data_dir.join(KEY_FILE);
    if path.exists() {
        let keypair = decode_key_file(&std::fs::read(&path)?)?;
        tracing::info!(address = %keypair.address(), "loaded validator key");
        return Ok(keypair);
    }

    std::fs::create_dir_all(data_dir)?;
    let keypair = SigningKeypair::generate();
    std::fs::write(&path, encode_key_file(&keypair))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!(address = %keypair.address(), path = %path.display(), "generated validator key");
    Ok(keypair)
}

// ── Gossip deduplication ──

/// Generational seen-set: when the current generation fills up it becomes
/// the previous one, so memory stays bounded while recent digests are kept.
struct SeenCache {
    current: HashSet<Hash>,
    prev: HashSet<Hash>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        SeenCache {
            current: HashSet::new(),
            prev: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, digest: &Hash) -> bool {
        self.current.contains(digest) || self.prev.contains(digest)
    }

    /// Record a digest. Returns false if it was already present.
    fn insert(&mut self, digest: Hash) -> bool {
        if self.contains(&digest) {
            return false;
        }
        self.current.insert(digest);
        if self.current.len() > self.capacity {
            std::mem::swap(&mut self.current, &mut self.prev);
            self.current.clear();
        }
        true
    }
}

// ── Per-topic queues ──

type Inbound = (PeerId, Message);

struct TopicQueues {
    transactions: mpsc::Sender<Inbound>,
    proposals: mpsc::Sender<Inbound>,
    approvals: mpsc::Sender<Inbound>,
    sync: mpsc::Sender<Inbound>,
}

struct TopicReceivers {
    transactions: mpsc::Receiver<Inbound>,
    proposals: mpsc::Receiver<Inbound>,
    approvals: mpsc::Receiver<Inbound>,
    sync: mpsc::Receiver<Inbound>,
}

fn topic_queues(capacity: usize) -> (TopicQueues, TopicReceivers) {
    let (transactions, transactions_rx) = mpsc::channel(capacity);
    let (proposals, proposals_rx) = mpsc::channel(capacity);
    let (approvals, approvals_rx) = mpsc::channel(capacity);
    let (sync, sync_rx) = mpsc::channel(capacity);
    (
        TopicQueues {
            transactions,
            proposals,
            approvals,
            sync,
        },
        TopicReceivers {
            transactions: transactions_rx,
            proposals: proposals_rx,
            approvals: approvals_rx,
            sync: sync_rx,
        },
    )
}

impl TopicQueues {
    /// Queue for a topic; the handshake is consumed by the P2P layer.
    fn sender(&self, topic: Topic) -> Option<&mpsc::Sender<Inbound>> {
        match topic {
            Topic::Handshake => None,
            Topic::Transactions => Some(&self.transactions),
            Topic::Proposals => Some(&self.proposals),
            Topic::Approvals => Some(&self.approvals),
            Topic::Sync => Some(&self.sync),
        }
    }
}

// ── Node ──

/// The node orchestrator.
pub struct Node {
    state: Arc<RwLock<NodeState>>,
    p2p: P2pHandle,
    event_rx: mpsc::Receiver<P2pEvent>,
    local_addr: SocketAddr,
    queues: TopicQueues,
    receivers: Option<TopicReceivers>,
    seen: SeenCache,
}

impl Node {
    /// Open storage, rebuild the chain from genesis plus stored blocks,
    /// start P2P and dial the bootstrap peers.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let storage = SledStorage::open(&config.data_dir)?;
        let chain = Blockchain::from_genesis(&config.genesis, Box::new(storage))?;
        let chain_id = *chain.chain_id();
        tracing::info!(
            chain = %hex::encode(&chain_id[..8]),
            height = chain.height(),
            tip = %chain.tip_hash(),
            "chain loaded"
        );

        let keypair = config.validator.then(|| config.keypair.clone());
        let engine = Engine::new(chain, keypair);
        if config.validator {
            tracing::info!(
                address = %config.keypair.address(),
                committee_member = engine.is_committee_member(),
                "running as validator"
            );
        }

        let p2p_config = P2pConfig {
            listen_addr: config.listen_addr,
            max_peers: config.max_peers,
            our_peer_id: rand::random(),
            chain_id,
            listen_port: config.listen_addr.port(),
        };
        let started = p2p::start(p2p_config).await?;
        tracing::info!(addr = %started.local_addr, "P2P listening");

        for peer in &config.bootstrap_peers {
            if let Err(e) = started.handle.connect(*peer).await {
                tracing::warn!(peer = %peer, error = %e, "failed to dial bootstrap peer");
            }
        }

        let (queues, receivers) = topic_queues(TOPIC_QUEUE_CAPACITY);
        Ok(Node {
            state: Arc::new(RwLock::new(NodeState {
                engine,
                node_start_time: Instant::now(),
            })),
            p2p: started.handle,
            event_rx: started.events,
            local_addr: started.local_addr,
            queues,
            receivers: Some(receivers),
            seen: SeenCache::new(SEEN_MESSAGES_CAPACITY),
        })
    }

    /// Get a shared reference to the node state (for RPC).
    pub fn state(&self) -> Arc<RwLock<NodeState>> {
        Arc::clone(&self.state)
    }

    /// Get a handle to the P2P layer (for RPC).
    pub fn p2p_handle(&self) -> P2pHandle {
        self.p2p.clone()
    }

    /// The bound P2P address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the main event loop until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let Some(mut rx) = self.receivers.take() else {
            tracing::error!("node event loop already started");
            return;
        };
        let mut tick_interval = tokio::time::interval(Duration::from_millis(
            crate::constants::TICK_INTERVAL_MS,
        ));
        let mut sync_interval = tokio::time::interval(Duration::from_millis(
            crate::constants::SYNC_POLL_INTERVAL_MS,
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown signal received");
                    self.shutdown().await;
                    break;
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_p2p_event(event).await;
                }
                Some((from, message)) = rx.proposals.recv() => {
                    self.handle_proposal(from, message).await;
                }
                Some((from, message)) = rx.approvals.recv() => {
                    self.handle_approval(from, message).await;
                }
                Some((from, message)) = rx.transactions.recv() => {
                    self.handle_transaction(from, message).await;
                }
                Some((from, message)) = rx.sync.recv() => {
                    self.handle_sync(from, message).await;
                }
                _ = tick_interval.tick() => {
                    let out = {
                        let mut state = self.state.write().await;
                        state.engine.tick(crate::now_ms())
                    };
                    self.broadcast_all(out, None).await;
                }
                _ = sync_interval.tick() => {
                    let _ = self.p2p.broadcast(Message::GetStatus, None).await;
                }
            }
        }
    }

    /// Flush storage and stop P2P.
    async fn shutdown(&self) {
        let state = self.state.read().await;
        if let Err(e) = state.engine.chain().flush() {
            tracing::error!(error = %e, "failed to flush storage on shutdown");
        }
        drop(state);
        let _ = self.p2p.shutdown().await;
        tracing::info!("node shutdown complete");
    }

    async fn handle_p2p_event(&mut self, event: P2pEvent) {
        match event {
            P2pEvent::PeerConnected(peer_id) => {
                let _ = self.p2p.send_to(peer_id, Message::GetStatus).await;
            }
            P2pEvent::PeerDisconnected(_) => {}
            P2pEvent::MessageReceived { from, message } => self.route(from, *message),
        }
    }

    /// Drop repeats, then hand the message to its topic queue.
    fn route(&mut self, from: PeerId, message: Message) {
        let topic = message.topic();
        let Some(queue) = self.queues.sender(topic) else {
            return;
        };
        if message.is_gossip() && !self.seen.insert(message.digest()) {
            return;
        }
        if let Err(e) = queue.try_send((from, message)) {
            tracing::debug!(topic = ?topic, error = %e, "topic queue full, dropping message");
        }
    }

    /// Broadcast messages, remembering their digests so echoes are dropped.
    async fn broadcast_all(&mut self, messages: Vec<Message>, exclude: Option<PeerId>) {
        for message in messages {
            self.seen.insert(message.digest());
            let _ = self.p2p.broadcast(message, exclude).await;
        }
    }

    async fn handle_transaction(&mut self, from: PeerId, message: Message) {
        let Message::NewTransaction(tx) = message else {
            return;
        };
        let result = {
            let mut state = self.state.write().await;
            state.engine.submit_transaction(tx.clone())
        };
        match result {
            Ok(_) => {
                let _ = self
                    .p2p
                    .broadcast(Message::NewTransaction(tx), Some(from))
                    .await;
            }
            Err(e) => tracing::debug!(tx = %tx.hash, error = %e, "rejected transaction"),
        }
    }

    async fn handle_proposal(&mut self, from: PeerId, message: Message) {
        let Message::Proposal(block) = message else {
            return;
        };
        let result = {
            let mut state = self.state.write().await;
            state.engine.on_proposal((*block).clone(), crate::now_ms())
        };
        match result {
            Ok(out) => {
                let _ = self.p2p.broadcast(Message::Proposal(block), Some(from)).await;
                self.broadcast_all(out, None).await;
            }
            Err(e) => {
                tracing::debug!(height = block.height(), hash = %block.header_hash, error = %e, "rejected proposal")
            }
        }
    }

    async fn handle_approval(&mut self, from: PeerId, message: Message) {
        let Message::Approval(approval) = message else {
            return;
        };
        let result = {
            let mut state = self.state.write().await;
            state.engine.on_approval(approval.clone(), crate::now_ms())
        };
        match result {
            // Only signature-checked approvals come back as Ok.
            Ok(out) => {
                let _ = self.p2p.broadcast(Message::Approval(approval), Some(from)).await;
                self.broadcast_all(out, None).await;
            }
            Err(e) => tracing::debug!(height = approval.height, error = %e, "rejected approval"),
        }
    }

    async fn handle_sync(&mut self, from: PeerId, message: Message) {
        match message {
            Message::FinalizedBlock { block, certificate } => {
                let (height, result) = {
                    let mut state = self.state.write().await;
                    let height = state.engine.chain().height();
                    if block.height() > height + 1 {
                        (height, None)
                    } else {
                        let r = state.engine.on_finalized_block(*block, certificate, crate::now_ms());
                        (height, Some(r))
                    }
                };
                match result {
                    None => self.request_blocks(from, height + 1).await,
                    Some(Ok(out)) => self.broadcast_all(out, Some(from)).await,
                    Some(Err(e)) => tracing::debug!(error = %e, "rejected finalized block"),
                }
            }
            Message::GetStatus => {
                let reply = {
                    let state = self.state.read().await;
                    let chain = state.engine.chain();
                    Message::StatusResponse {
                        height: chain.height(),
                        tip_hash: chain.tip_hash(),
                    }
                };
                let _ = self.p2p.send_to(from, reply).await;
            }
            Message::StatusResponse { height, .. } => {
                let ours = self.state.read().await.engine.chain().height();
                if height > ours {
                    tracing::info!(ours, theirs = height, "behind peer, requesting blocks");
                    self.request_blocks(from, ours + 1).await;
                }
            }
            Message::GetBlocks { from_height, limit } => {
                let limit = limit.min(crate::constants::SYNC_BATCH_SIZE) as usize;
                let blocks = {
                    let state = self.state.read().await;
                    state.engine.chain().blocks_from(from_height, limit)
                };
                if !blocks.is_empty() {
                    let _ = self.p2p.send_to(from, Message::BlocksResponse(blocks)).await;
                }
            }
            Message::BlocksResponse(blocks) => {
                if blocks.is_empty() {
                    return;
                }
                let (result, height) = {
                    let mut state = self.state.write().await;
                    let r = state.engine.import_blocks(blocks, crate::now_ms());
                    (r, state.engine.chain().height())
                };
                match result {
                    Ok(0) => {}
                    Ok(applied) => {
                        tracing::info!(applied, height, "imported finalized blocks");
                        self.request_blocks(from, height + 1).await;
                    }
                    Err(e) => tracing::warn!(error = %e, height, "block sync failed"),
                }
            }
            _ => {}
        }
    }

    async fn request_blocks(&self, peer: PeerId, from_height: u64) {
        let request = Message::GetBlocks {
            from_height,
            limit: crate::constants::SYNC_BATCH_SIZE,
        };
        let _ = self.p2p.send_to(peer, request).await;
    }
}
