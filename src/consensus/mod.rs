//! # Delegated-proof-of-stake consensus
//!
//! ## Design
//!
//! 1. **Weighted committees**: every validator has an effective weight
//!    (own stake + delegated stake + bounded reputation). At each epoch
//!    boundary the top-K validators by weight form the committee.
//!
//! 2. **Deterministic proposers**: the proposer for `(height, round)` is
//!    `committee[(height + round) mod len]`. No node keeps a cursor, so no
//!    node can disagree about whose turn it is.
//!
//! 3. **Replayed validation**: committee members re-execute every proposal
//!    against their own canonical state and approve only if the header's
//!    roots match byte-for-byte.
//!
//! 4. **Weighted quorum**: a block is final once approvals covering at least
//!    ⌈2/3⌉ of committee weight are collected. The first block to reach
//!    quorum at a height wins; competing quorums are rejected.
//!
//! ## Flow per height
//!
//! ```text
//!   proposer_for(h, r) builds block  ->  Proposal
//!   committee validates + replays    ->  Approval (one per member per (h, r))
//!   aggregator reaches quorum        ->  Certificate
//!   chain commits atomically         ->  FinalizedBlock, pool pruned
//!   epoch end                        ->  reputation update, committee re-selected
//! ```
//!
//! If a round sees no quorum within the round timeout, every node abandons
//! it and moves to round `r + 1`, handing the turn to the next member.

pub mod approval;
pub mod block;
pub mod committee;
pub mod engine;
pub mod schedule;

use crate::Address;

/// Reasons a proposal, approval or certificate is rejected.
///
/// All of these are local: the offending message is dropped and the
/// canonical chain is untouched.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("wrong proposer: expected {expected:?}, got {got:?}")]
    BadProposer { expected: Address, got: Address },
    #[error("invalid signature")]
    BadSignature,
    #[error("{0} does not match replayed state")]
    StateMismatch(&'static str),
    #[error("previous hash does not match local tip")]
    ChainMismatch,
    #[error("non-contiguous height: expected {expected}, got {got}")]
    NonContiguousHeight { expected: u64, got: u64 },
    #[error("committee snapshot does not match local committee")]
    CommitteeMismatch,
    #[error("invalid certificate: {0}")]
    BadCertificate(String),
    #[error("transaction {index} invalid: {reason}")]
    InvalidTransaction { index: usize, reason: String },
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("stale round {got} (current {current})")]
    StaleRound { current: u32, got: u32 },
    #[error("{0:?} is not a committee member")]
    NotCommitteeMember(Address),
    #[error("height {0} already finalized")]
    HeightAlreadyFinalized(u64),
    #[error("committee is empty")]
    EmptyCommittee,
    #[error("timestamp out of range")]
    TimestampOutOfRange,
    #[error("too many transactions: {count} (max {max})")]
    TooManyTransactions { count: usize, max: usize },
}
