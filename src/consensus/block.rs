//! Blocks: construction by the proposer and validation by the committee.
//!
//! Both sides run the same state transition on a clone of the canonical
//! state: liveness bookkeeping for the proposer and the signers of the
//! previous block's certificate, then the transactions in order, then the
//! epoch-end reputation update. A validator approves only if every root it
//! recomputes matches the header exactly.
//!
//! The producer skips transactions that fail against the tentative state
//! (they stay in the pool). A validator rejects a block containing any
//! invalid transaction, since an honest producer would have skipped it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::consensus::approval::Certificate;
use crate::consensus::committee::Committee;
use crate::consensus::{schedule, ConsensusError};
use crate::constants::MAX_TIMESTAMP_DRIFT_MS;
use crate::crypto::keys::{Signature, SigningKeypair};
use crate::crypto::merkle;
use crate::genesis::ConsensusParams;
use crate::state::ChainState;
use crate::transaction::Transaction;
use crate::{Address, Hash};

/// Hash of a block header.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub Hash);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(&self.0[..8]))
    }
}

/// The signed part of a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    /// Proposal round at this height; selects the proposer together with height.
    pub round: u32,
    pub previous_hash: BlockHash,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub proposer: Address,
    pub transaction_root: Hash,
    /// Account ledger root after this block.
    pub state_root: Hash,
    /// Validator registry root after this block.
    pub registry_root: Hash,
    pub committee_hash: Hash,
    /// Hash of `last_certificate`, zero if absent.
    pub certificate_hash: Hash,
}

impl BlockHeader {
    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = blake3::Hasher::new_derive_key("tally.block.header");
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&self.round.to_le_bytes());
        hasher.update(&self.previous_hash.0);
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.proposer.0);
        hasher.update(&self.transaction_root);
        hasher.update(&self.state_root);
        hasher.update(&self.registry_root);
        hasher.update(&self.committee_hash);
        hasher.update(&self.certificate_hash);
        BlockHash(*hasher.finalize().as_bytes())
    }
}

/// A block, proposed or finalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub header_hash: BlockHash,
    pub transactions: Vec<Transaction>,
    /// The committee valid for this height.
    pub committee: Committee,
    /// Approvals for the previous block: a quorum, plus any that arrived
    /// after it (absent for heights 0 and 1).
    pub last_certificate: Option<Certificate>,
    /// Proposer signature; empty for genesis.
    pub signature: Signature,
}

impl Block {
    /// The height-0 block every node derives from the genesis file.
    pub fn genesis(timestamp: u64, state: &ChainState, committee: Committee) -> Self {
        let proposer = schedule::current_proposer(&committee, 0).unwrap_or_default();
        let header = BlockHeader {
            height: 0,
            round: 0,
            previous_hash: BlockHash::default(),
            timestamp,
            proposer,
            transaction_root: merkle::EMPTY_ROOT,
            state_root: state.state_root(),
            registry_root: state.registry_root(),
            committee_hash: committee.hash(),
            certificate_hash: [0u8; 32],
        };
        Block {
            header_hash: header.compute_hash(),
            header,
            transactions: Vec::new(),
            committee,
            last_certificate: None,
            signature: Signature::empty(),
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> BlockHash {
        self.header_hash
    }

    /// Merkle root over transaction hashes in block order.
    pub fn compute_transaction_root(&self) -> Hash {
        transaction_root(&self.transactions)
    }
}

pub fn transaction_root(transactions: &[Transaction]) -> Hash {
    let hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash.0).collect();
    merkle::merkle_root(&hashes)
}

/// Data the proposer signs (chain-bound).
fn proposal_sign_data(chain_id: &Hash, header_hash: &BlockHash) -> Vec<u8> {
    let mut data = Vec::with_capacity(14 + 64);
    data.extend_from_slice(b"tally.proposal");
    data.extend_from_slice(chain_id);
    data.extend_from_slice(&header_hash.0);
    data
}

fn certificate_hash(cert: Option<&Certificate>) -> Hash {
    cert.map(Certificate::hash).unwrap_or([0u8; 32])
}

/// A read-only view of the canonical tip that a new block extends.
#[derive(Clone, Copy)]
pub struct ChainTip<'a> {
    pub block: &'a Block,
    /// Certificate that finalized `block`; `None` for genesis.
    pub certificate: Option<&'a Certificate>,
    pub state: &'a ChainState,
    /// Committee for the next height.
    pub committee: &'a Committee,
    pub params: &'a ConsensusParams,
    pub chain_id: &'a Hash,
}

impl ChainTip<'_> {
    pub fn next_height(&self) -> u64 {
        self.block.header.height + 1
    }
}

/// Build and sign a proposal for the next height in `round`.
///
/// Candidates are tried in the given order; invalid ones are skipped.
/// Returns the block and the tentative state after it.
pub fn build_block(
    tip: &ChainTip<'_>,
    keypair: &SigningKeypair,
    round: u32,
    timestamp: u64,
    candidates: impl IntoIterator<Item = Transaction>,
) -> Result<(Block, ChainState), ConsensusError> {
    let height = tip.next_height();
    let proposer = keypair.address();
    let expected = schedule::proposer_for(tip.committee, height, round)
        .ok_or(ConsensusError::EmptyCommittee)?;
    if expected != proposer {
        return Err(ConsensusError::BadProposer {
            expected,
            got: proposer,
        });
    }

    let last_certificate = tip.certificate.cloned();
    let signers = last_certificate
        .as_ref()
        .map(Certificate::signers)
        .unwrap_or_default();

    let mut state = tip.state.clone();
    state
        .begin_block(height, &proposer, &signers)
        .map_err(|e| ConsensusError::Malformed(e.to_string()))?;

    let mut transactions = Vec::new();
    for tx in candidates {
        if transactions.len() >= tip.params.max_txs_per_block {
            break;
        }
        if let Err(e) = tx.validate_structure(tip.chain_id) {
            tracing::debug!(tx = ?tx.hash, error = %e, "skipping invalid transaction");
            continue;
        }
        match state.apply_transaction(&tx, &proposer) {
            Ok(()) => transactions.push(tx),
            Err(e) => tracing::debug!(tx = ?tx.hash, error = %e, "skipping transaction"),
        }
    }

    state
        .end_block(height, &tip.committee.addresses(), tip.params)
        .map_err(|e| ConsensusError::Malformed(e.to_string()))?;

    let header = BlockHeader {
        height,
        round,
        previous_hash: tip.block.header_hash,
        timestamp: timestamp.max(tip.block.header.timestamp),
        proposer,
        transaction_root: transaction_root(&transactions),
        state_root: state.state_root(),
        registry_root: state.registry_root(),
        committee_hash: tip.committee.hash(),
        certificate_hash: certificate_hash(last_certificate.as_ref()),
    };
    let header_hash = header.compute_hash();
    let signature = keypair.sign(&proposal_sign_data(tip.chain_id, &header_hash));

    let block = Block {
        header,
        header_hash,
        transactions,
        committee: tip.committee.clone(),
        last_certificate,
        signature,
    };
    Ok((block, state))
}

/// Validate a proposal against the tip it claims to extend.
///
/// `now_ms` bounds how far in the future the timestamp may be; pass `None`
/// when replaying already-finalized blocks. On success returns the
/// tentative state after the block. Never mutates canonical state.
pub fn validate_proposal(
    tip: &ChainTip<'_>,
    block: &Block,
    now_ms: Option<u64>,
) -> Result<ChainState, ConsensusError> {
    let header = &block.header;

    if header.compute_hash() != block.header_hash {
        return Err(ConsensusError::Malformed("header hash mismatch".into()));
    }
    let expected_height = tip.next_height();
    if header.height != expected_height {
        return Err(ConsensusError::NonContiguousHeight {
            expected: expected_height,
            got: header.height,
        });
    }
    if header.previous_hash != tip.block.header_hash {
        return Err(ConsensusError::ChainMismatch);
    }
    if block.committee != *tip.committee || header.committee_hash != tip.committee.hash() {
        return Err(ConsensusError::CommitteeMismatch);
    }

    let expected = schedule::proposer_for(tip.committee, header.height, header.round)
        .ok_or(ConsensusError::EmptyCommittee)?;
    if header.proposer != expected {
        return Err(ConsensusError::BadProposer {
            expected,
            got: header.proposer,
        });
    }
    let public_key = tip
        .state
        .registry()
        .public_key(&header.proposer)
        .ok_or(ConsensusError::NotCommitteeMember(header.proposer))?;
    if !public_key.verify(
        &proposal_sign_data(tip.chain_id, &block.header_hash),
        &block.signature,
    ) {
        return Err(ConsensusError::BadSignature);
    }

    if header.timestamp < tip.block.header.timestamp {
        return Err(ConsensusError::TimestampOutOfRange);
    }
    if let Some(now) = now_ms {
        if header.timestamp > now.saturating_add(MAX_TIMESTAMP_DRIFT_MS) {
            return Err(ConsensusError::TimestampOutOfRange);
        }
    }
    if block.transactions.len() > tip.params.max_txs_per_block {
        return Err(ConsensusError::TooManyTransactions {
            count: block.transactions.len(),
            max: tip.params.max_txs_per_block,
        });
    }

    let signers = verify_last_certificate(tip, block)?;

    if !crate::constant_time_eq(&block.compute_transaction_root(), &header.transaction_root) {
        return Err(ConsensusError::StateMismatch("transaction root"));
    }

    let mut state = tip.state.clone();
    state
        .begin_block(header.height, &header.proposer, &signers)
        .map_err(|e| ConsensusError::Malformed(e.to_string()))?;
    for (index, tx) in block.transactions.iter().enumerate() {
        tx.validate_structure(tip.chain_id)
            .map_err(|e| ConsensusError::InvalidTransaction {
                index,
                reason: e.to_string(),
            })?;
        state
            .apply_transaction(tx, &header.proposer)
            .map_err(|e| ConsensusError::InvalidTransaction {
                index,
                reason: e.to_string(),
            })?;
    }
    state
        .end_block(header.height, &tip.committee.addresses(), tip.params)
        .map_err(|e| ConsensusError::Malformed(e.to_string()))?;

    if !crate::constant_time_eq(&state.state_root(), &header.state_root) {
        return Err(ConsensusError::StateMismatch("state root"));
    }
    if !crate::constant_time_eq(&state.registry_root(), &header.registry_root) {
        return Err(ConsensusError::StateMismatch("registry root"));
    }
    Ok(state)
}

/// Check `last_certificate` finalizes the tip; returns its signers.
fn verify_last_certificate(
    tip: &ChainTip<'_>,
    block: &Block,
) -> Result<Vec<Address>, ConsensusError> {
    if block.header.certificate_hash != certificate_hash(block.last_certificate.as_ref()) {
        return Err(ConsensusError::BadCertificate("certificate hash mismatch".into()));
    }
    match (&block.last_certificate, tip.block.header.height) {
        (None, 0) => Ok(Vec::new()),
        (Some(_), 0) => Err(ConsensusError::BadCertificate(
            "genesis has no certificate".into(),
        )),
        (None, _) => Err(ConsensusError::BadCertificate(
            "missing certificate for previous block".into(),
        )),
        (Some(cert), tip_height) => {
            if cert.block_hash != tip.block.header_hash || cert.height != tip_height {
                return Err(ConsensusError::BadCertificate(
                    "certificate is not for the previous block".into(),
                ));
            }
            cert.verify(&tip.block.committee, tip.state.registry(), tip.chain_id)?;
            Ok(cert.signers())
        }
    }
}
