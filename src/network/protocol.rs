//! Network protocol message definitions for Tally P2P communication.
//!
//! Every frame is a 4-byte little-endian length followed by a bincode
//! payload. The transport is plaintext TCP; peers identify each other only
//! by the chain id in the `Hello` handshake.

use serde::{Deserialize, Serialize};

use crate::consensus::approval::{Approval, Certificate};
use crate::consensus::block::{Block, BlockHash};
use crate::transaction::Transaction;
use crate::Hash;

/// A random per-process peer identifier.
pub type PeerId = Hash;

/// Network protocol messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ── Handshake ──
    Hello {
        version: u32,
        chain_id: Hash,
        peer_id: PeerId,
        listen_port: u16,
    },

    // ── Transaction Pool ──
    NewTransaction(Transaction),

    // ── Consensus ──
    /// A signed block proposal for the next height.
    Proposal(Box<Block>),
    /// A committee member's approval of a proposal.
    Approval(Approval),
    /// A block together with the certificate that finalized it.
    FinalizedBlock {
        block: Box<Block>,
        certificate: Certificate,
    },

    // ── Sync ──
    GetStatus,
    StatusResponse { height: u64, tip_hash: BlockHash },
    /// Request finalized blocks starting at `from_height`.
    GetBlocks { from_height: u64, limit: u32 },
    BlocksResponse(Vec<(Block, Certificate)>),
}

/// Dispatch queue a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Handshake,
    Transactions,
    Proposals,
    Approvals,
    Sync,
}

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Message::Hello { .. } => Topic::Handshake,
            Message::NewTransaction(_) => Topic::Transactions,
            Message::Proposal(_) => Topic::Proposals,
            Message::Approval(_) => Topic::Approvals,
            Message::FinalizedBlock { .. }
            | Message::GetStatus
            | Message::StatusResponse { .. }
            | Message::GetBlocks { .. }
            | Message::BlocksResponse(_) => Topic::Sync,
        }
    }

    /// Whether the message should be relayed to other peers once accepted.
    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            Message::NewTransaction(_)
                | Message::Proposal(_)
                | Message::Approval(_)
                | Message::FinalizedBlock { .. }
        )
    }

    /// Content digest used for gossip deduplication.
    pub fn digest(&self) -> Hash {
        match crate::serialize(self) {
            Ok(bytes) => crate::hash_domain(b"tally.gossip", &bytes),
            Err(_) => [0u8; 32],
        }
    }
}

/// Network errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
}

/// Frame a message: little-endian `u32` payload length, then the payload.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload =
        crate::serialize(msg).map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse one frame. `None` for anything malformed, truncated or oversized;
/// bytes after the declared payload are ignored.
pub fn decode_message(frame: &[u8]) -> Option<Message> {
    let (prefix, body) = frame.split_first_chunk::<4>()?;
    let len = u32::from_le_bytes(*prefix) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    crate::deserialize(body.get(..len)?).ok()
}
