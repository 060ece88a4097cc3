//! # Tally
//!
//! A delegated-proof-of-stake blockchain node:
//! - **Validator registry**: stake, delegated stake, reputation and liveness
//! - **Rotating committees**: re-derived deterministically every epoch
//! - **Round-robin proposers**: a pure function of height and committee
//! - **Quorum finality**: a block is final once ≥2/3 of committee weight approves it
//! - **Replayable state**: every block commits to the account and registry roots
//!   that any node reproduces by replaying its transactions

pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod genesis;
pub mod network;
pub mod node;
pub mod registry;
pub mod state;
pub mod transaction;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol constants
pub mod constants {
    /// Default number of heights per epoch.
    pub const EPOCH_LENGTH: u64 = 10;
    /// Upper bound for the committee size.
    pub const MAX_COMMITTEE_SIZE: usize = 21;
    /// Default maximum number of transactions per block.
    pub const MAX_TXS_PER_BLOCK: usize = 1_000;
    /// Default minimum spacing between a block and its parent (ms).
    pub const BLOCK_INTERVAL_MS: u64 = 1_000;
    /// Default time a round may wait for quorum before it is abandoned (ms).
    pub const ROUND_TIMEOUT_MS: u64 = 10_000;
    /// Maximum allowed future drift for block timestamps (ms).
    pub const MAX_TIMESTAMP_DRIFT_MS: u64 = 60_000;

    /// Reputation is clamped to `[-REPUTATION_BOUND, REPUTATION_BOUND]`.
    /// A validator that reaches the lower bound is deactivated.
    pub const REPUTATION_BOUND: i64 = 1_000;
    /// Default reputation penalty for a committee member found inactive at epoch end.
    pub const INACTIVITY_PENALTY: i64 = 10;
    /// Default reputation reward for a committee member that participated.
    pub const PARTICIPATION_REWARD: i64 = 1;

    /// Minimum transaction fee (in base units).
    pub const MIN_TX_FEE: u64 = 1;

    /// Maximum number of transactions in the pool
    pub const MEMPOOL_MAX_TXS: usize = 10_000;

    /// Maximum number of unknown blocks for which approvals are buffered.
    pub const MAX_ORPHAN_APPROVAL_BLOCKS: usize = 64;
    /// Maximum number of unknown blocks one validator may hold approvals for.
    pub const MAX_ORPHAN_APPROVALS_PER_VALIDATOR: usize = 4;

    /// Maximum network message size (16 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Default P2P listen port
    pub const DEFAULT_P2P_PORT: u16 = 9832;
    /// Default RPC listen port
    pub const DEFAULT_RPC_PORT: u16 = 9833;
    /// Maximum number of connected peers
    pub const MAX_PEERS: usize = 64;
    /// Peer connection timeout in milliseconds
    pub const PEER_CONNECT_TIMEOUT_MS: u64 = 5_000;
    /// Per-peer message burst allowance.
    pub const PEER_MSG_BURST: f64 = 200.0;
    /// Per-peer sustained message rate (messages per second).
    pub const PEER_MSG_RATE_LIMIT: f64 = 100.0;
    /// Wire protocol version carried in the handshake.
    pub const PROTOCOL_VERSION: u32 = 1;

    /// Maximum number of finalized blocks returned per sync request.
    pub const SYNC_BATCH_SIZE: u32 = 100;
    /// Interval between status polls used to detect that we fell behind (ms).
    pub const SYNC_POLL_INTERVAL_MS: u64 = 5_000;
    /// Consensus engine tick interval (ms).
    pub const TICK_INTERVAL_MS: u64 = 100;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Account and validator identifier, derived from a signing public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

/// Error parsing a hex-encoded address.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("address must be 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| AddressParseError::Hex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressParseError::Length(bytes.len()))?;
        Ok(Address(arr))
    }
}

/// BLAKE3 in key-derivation mode, keyed by a protocol domain string.
///
/// Domains are ASCII literals such as `b"tally.block.header"`; a non-UTF-8
/// domain maps to `"tally.invalid"` instead of panicking.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let context = std::str::from_utf8(domain).unwrap_or("tally.invalid");
    blake3::derive_key(context, data)
}

/// Digest equality without early exit. Lengths are compared first and in
/// the clear; every caller passes 32-byte roots.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Canonical encoding for hashing, storage and the wire: bincode with the
/// legacy fixed-int configuration.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Inverse of [`serialize`]. Oversized inputs are refused outright and the
/// decoder may not allocate past `MAX_NETWORK_MESSAGE_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    const LIMIT: usize = constants::MAX_NETWORK_MESSAGE_BYTES;
    if bytes.len() > LIMIT {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let config = bincode::config::legacy().with_limit::<LIMIT>();
    bincode::serde::decode_from_slice(bytes, config).map(|(val, _)| val)
}

/// Milliseconds since the UNIX epoch; 0 if the clock is before it.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
