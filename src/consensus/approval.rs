//! Approvals, certificates and quorum detection.
//!
//! Committee members approve a validated proposal by signing its header
//! hash. The [`ApprovalAggregator`] collects approvals per candidate block,
//! keyed by validator address so re-sends collapse to one, and reports a
//! [`Certificate`] once approving weight reaches quorum. Because weights are
//! summed over a set, the outcome does not depend on arrival order.
//!
//! Once a block is final it stays sealed in the aggregator until the next
//! one: approvals that land after quorum are still verified and added, and
//! the next proposer carries the full set as the participation record.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::consensus::block::BlockHash;
use crate::consensus::committee::Committee;
use crate::consensus::ConsensusError;
use crate::constants::{MAX_ORPHAN_APPROVALS_PER_VALIDATOR, MAX_ORPHAN_APPROVAL_BLOCKS};
use crate::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::registry::ValidatorRegistry;
use crate::{Address, Hash};

/// A committee member's signed approval of a proposed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub block_hash: BlockHash,
    pub height: u64,
    pub round: u32,
    pub validator: Address,
    /// Signature over (chain_id || block_hash || height || round)
    pub signature: Signature,
}

impl Approval {
    /// Sign an approval for `block_hash`.
    pub fn sign(
        keypair: &SigningKeypair,
        chain_id: &Hash,
        block_hash: BlockHash,
        height: u64,
        round: u32,
    ) -> Self {
        let msg = approval_sign_data(chain_id, &block_hash, height, round);
        Approval {
            block_hash,
            height,
            round,
            validator: keypair.address(),
            signature: keypair.sign(&msg),
        }
    }

    pub fn verify(&self, public_key: &SigningPublicKey, chain_id: &Hash) -> bool {
        if public_key.address() != self.validator {
            return false;
        }
        let msg = approval_sign_data(chain_id, &self.block_hash, self.height, self.round);
        public_key.verify(&msg, &self.signature)
    }
}

/// Data signed for an approval (chain-bound to prevent cross-network replay).
fn approval_sign_data(chain_id: &Hash, block_hash: &BlockHash, height: u64, round: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(14 + 32 + 32 + 8 + 4);
    data.extend_from_slice(b"tally.approval");
    data.extend_from_slice(chain_id);
    data.extend_from_slice(&block_hash.0);
    data.extend_from_slice(&height.to_le_bytes());
    data.extend_from_slice(&round.to_le_bytes());
    data
}

/// Proof of finality: approvals reaching quorum for one block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub block_hash: BlockHash,
    pub height: u64,
    pub round: u32,
    /// Sorted by validator address, one per validator.
    pub approvals: Vec<Approval>,
}

impl Certificate {
    pub fn signers(&self) -> Vec<Address> {
        self.approvals.iter().map(|a| a.validator).collect()
    }

    /// Commitment to the certificate's contents.
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(44 + self.approvals.len() * 64);
        data.extend_from_slice(&self.block_hash.0);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.round.to_le_bytes());
        for a in &self.approvals {
            data.extend_from_slice(&a.validator.0);
            data.extend_from_slice(&crate::hash_domain(
                b"tally.certificate.sig",
                a.signature.as_bytes(),
            ));
        }
        crate::hash_domain(b"tally.certificate", &data)
    }

    /// Check every approval and that their combined weight reaches quorum.
    /// Returns the approving weight.
    pub fn verify(
        &self,
        committee: &Committee,
        registry: &ValidatorRegistry,
        chain_id: &Hash,
    ) -> Result<u128, ConsensusError> {
        let mut weight: u128 = 0;
        let mut previous: Option<Address> = None;

        for approval in &self.approvals {
            if previous.is_some_and(|p| p >= approval.validator) {
                return Err(ConsensusError::BadCertificate(
                    "approvals not sorted or duplicated".into(),
                ));
            }
            previous = Some(approval.validator);

            if approval.block_hash != self.block_hash
                || approval.height != self.height
                || approval.round != self.round
            {
                return Err(ConsensusError::BadCertificate(
                    "approval for a different block".into(),
                ));
            }
            let member_weight = committee.weight_of(&approval.validator).ok_or_else(|| {
                ConsensusError::BadCertificate(format!(
                    "{} is not a committee member",
                    approval.validator.short()
                ))
            })?;
            let public_key = registry.public_key(&approval.validator).ok_or_else(|| {
                ConsensusError::BadCertificate(format!(
                    "{} is not registered",
                    approval.validator.short()
                ))
            })?;
            if !approval.verify(public_key, chain_id) {
                return Err(ConsensusError::BadCertificate(format!(
                    "bad signature from {}",
                    approval.validator.short()
                )));
            }
            weight += member_weight as u128;
        }

        let quorum = committee.quorum_weight();
        if committee.is_empty() || weight < quorum {
            return Err(ConsensusError::BadCertificate(format!(
                "weight {} below quorum {}",
                weight, quorum
            )));
        }
        Ok(weight)
    }
}

/// Evidence that a validator approved two different blocks in one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    pub validator: Address,
    pub height: u64,
    pub round: u32,
    pub first: BlockHash,
    pub second: BlockHash,
}

/// Result of feeding one approval to the aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// The block is not known yet; the signed approval is held until it is.
    Buffered,
    /// Arrived after the block was finalized; recorded as participation.
    Late,
    /// This validator already approved this block.
    Duplicate,
    /// Counted, quorum not yet reached.
    Pending { weight: u128, quorum: u128 },
    /// Quorum reached.
    Quorum(Certificate),
}

/// An unfinalized block being approved.
struct Candidate {
    height: u64,
    round: u32,
    committee: Committee,
    approvals: BTreeMap<Address, Approval>,
    weight: u128,
}

/// Signed approvals for a block that has not been seen yet.
struct Orphans {
    height: u64,
    approvals: BTreeMap<Address, Approval>,
}

/// The newest finalized block, still open to approvals so that members
/// whose approval landed after quorum count as participants.
struct Sealed {
    committee: Committee,
    record: Certificate,
}

/// Collects approvals for in-flight blocks and detects quorum.
pub struct ApprovalAggregator {
    chain_id: Hash,
    finalized_height: u64,
    candidates: HashMap<BlockHash, Candidate>,
    /// Approvals for blocks we have not seen; committee checks run once the
    /// block arrives.
    orphans: HashMap<BlockHash, Orphans>,
    sealed: Option<Sealed>,
    /// (validator, height, round) -> block approved, for equivocation detection.
    cast: HashMap<(Address, u64, u32), BlockHash>,
    equivocations: Vec<EquivocationEvidence>,
}

impl ApprovalAggregator {
    pub fn new(chain_id: Hash, finalized_height: u64) -> Self {
        ApprovalAggregator {
            chain_id,
            finalized_height,
            candidates: HashMap::new(),
            orphans: HashMap::new(),
            sealed: None,
            cast: HashMap::new(),
            equivocations: Vec::new(),
        }
    }

    pub fn finalized_height(&self) -> u64 {
        self.finalized_height
    }

    /// Start collecting approvals for a validated block.
    ///
    /// Returns approvals that arrived before the block; the caller feeds
    /// them back through [`ApprovalAggregator::add`].
    pub fn track(
        &mut self,
        block_hash: BlockHash,
        height: u64,
        round: u32,
        committee: Committee,
    ) -> Result<Vec<Approval>, ConsensusError> {
        if height <= self.finalized_height {
            return Err(ConsensusError::HeightAlreadyFinalized(height));
        }
        self.candidates.entry(block_hash).or_insert_with(|| Candidate {
            height,
            round,
            committee,
            approvals: BTreeMap::new(),
            weight: 0,
        });
        Ok(self
            .orphans
            .remove(&block_hash)
            .map(|o| o.approvals.into_values().collect())
            .unwrap_or_default())
    }

    pub fn is_tracked(&self, block_hash: &BlockHash) -> bool {
        self.candidates.contains_key(block_hash)
    }

    /// Approving weight collected so far for a tracked block.
    pub fn weight(&self, block_hash: &BlockHash) -> Option<u128> {
        self.candidates.get(block_hash).map(|c| c.weight)
    }

    /// Count one approval. `registry` supplies validator public keys.
    ///
    /// Only the next two heights are accepted for blocks not yet seen, and
    /// only with a valid signature from a registered, active validator.
    pub fn add(
        &mut self,
        approval: Approval,
        registry: &ValidatorRegistry,
    ) -> Result<ApprovalOutcome, ConsensusError> {
        if approval.height <= self.finalized_height {
            return self.add_late(approval, registry);
        }
        if approval.height > self.finalized_height.saturating_add(2) {
            return Err(ConsensusError::NonContiguousHeight {
                expected: self.finalized_height.saturating_add(1),
                got: approval.height,
            });
        }

        let Some(candidate) = self.candidates.get_mut(&approval.block_hash) else {
            self.buffer_orphan(approval, registry)?;
            return Ok(ApprovalOutcome::Buffered);
        };

        if approval.height != candidate.height || approval.round != candidate.round {
            return Err(ConsensusError::Malformed(
                "approval height/round does not match block".into(),
            ));
        }
        let member_weight = candidate
            .committee
            .weight_of(&approval.validator)
            .ok_or(ConsensusError::NotCommitteeMember(approval.validator))?;
        if candidate.approvals.contains_key(&approval.validator) {
            return Ok(ApprovalOutcome::Duplicate);
        }
        let public_key = registry
            .public_key(&approval.validator)
            .ok_or(ConsensusError::NotCommitteeMember(approval.validator))?;
        if !approval.verify(public_key, &self.chain_id) {
            return Err(ConsensusError::BadSignature);
        }

        // An honest validator approves at most one block per (height, round).
        let key = (approval.validator, approval.height, approval.round);
        match self.cast.get(&key) {
            Some(first) if *first != approval.block_hash => {
                tracing::warn!(
                    validator = %approval.validator.short(),
                    height = approval.height,
                    round = approval.round,
                    "equivocating approval rejected"
                );
                self.equivocations.push(EquivocationEvidence {
                    validator: approval.validator,
                    height: approval.height,
                    round: approval.round,
                    first: *first,
                    second: approval.block_hash,
                });
                return Err(ConsensusError::Malformed("equivocating approval".into()));
            }
            Some(_) => {}
            None => {
                self.cast.insert(key, approval.block_hash);
            }
        }

        let block_hash = approval.block_hash;
        candidate.approvals.insert(approval.validator, approval);
        candidate.weight += member_weight as u128;

        let quorum = candidate.committee.quorum_weight();
        if candidate.weight >= quorum {
            Ok(ApprovalOutcome::Quorum(Certificate {
                block_hash,
                height: candidate.height,
                round: candidate.round,
                approvals: candidate.approvals.values().cloned().collect(),
            }))
        } else {
            Ok(ApprovalOutcome::Pending {
                weight: candidate.weight,
                quorum,
            })
        }
    }

    fn buffer_orphan(
        &mut self,
        approval: Approval,
        registry: &ValidatorRegistry,
    ) -> Result<(), ConsensusError> {
        let public_key = registry
            .get(&approval.validator)
            .filter(|r| r.active)
            .map(|r| &r.public_key)
            .ok_or(ConsensusError::NotCommitteeMember(approval.validator))?;
        if !approval.verify(public_key, &self.chain_id) {
            return Err(ConsensusError::BadSignature);
        }

        match self.orphans.get(&approval.block_hash) {
            Some(held) if held.height != approval.height => {
                return Err(ConsensusError::Malformed(
                    "approval height differs from earlier approvals for the block".into(),
                ));
            }
            Some(held) if held.approvals.contains_key(&approval.validator) => return Ok(()),
            Some(_) => {}
            None if self.orphans.len() >= MAX_ORPHAN_APPROVAL_BLOCKS => {
                tracing::debug!(height = approval.height, "orphan approval buffer full, dropping");
                return Ok(());
            }
            None => {}
        }
        let held_by_validator = self
            .orphans
            .values()
            .filter(|o| o.approvals.contains_key(&approval.validator))
            .count();
        if held_by_validator >= MAX_ORPHAN_APPROVALS_PER_VALIDATOR {
            tracing::debug!(
                validator = %approval.validator.short(),
                "validator already holds its share of the orphan buffer, dropping"
            );
            return Ok(());
        }

        self.orphans
            .entry(approval.block_hash)
            .or_insert_with(|| Orphans {
                height: approval.height,
                approvals: BTreeMap::new(),
            })
            .approvals
            .insert(approval.validator, approval);
        Ok(())
    }

    /// An approval for the sealed block after it was finalized.
    fn add_late(
        &mut self,
        approval: Approval,
        registry: &ValidatorRegistry,
    ) -> Result<ApprovalOutcome, ConsensusError> {
        let Some(sealed) = self
            .sealed
            .as_mut()
            .filter(|s| s.record.block_hash == approval.block_hash)
        else {
            return Err(ConsensusError::HeightAlreadyFinalized(approval.height));
        };
        let record = &mut sealed.record;
        if approval.height != record.height || approval.round != record.round {
            return Err(ConsensusError::Malformed(
                "approval height/round does not match block".into(),
            ));
        }
        if !sealed.committee.contains(&approval.validator) {
            return Err(ConsensusError::NotCommitteeMember(approval.validator));
        }
        let slot = match record
            .approvals
            .binary_search_by_key(&approval.validator, |a| a.validator)
        {
            Ok(_) => return Ok(ApprovalOutcome::Duplicate),
            Err(slot) => slot,
        };
        let public_key = registry
            .public_key(&approval.validator)
            .ok_or(ConsensusError::NotCommitteeMember(approval.validator))?;
        if !approval.verify(public_key, &self.chain_id) {
            return Err(ConsensusError::BadSignature);
        }
        record.approvals.insert(slot, approval);
        Ok(ApprovalOutcome::Late)
    }

    /// Record `certificate` as final and keep its block open for approvals
    /// that arrive after quorum. Approvals already collected beyond the
    /// certificate are folded in.
    pub fn seal(&mut self, certificate: Certificate, committee: Committee) {
        let Certificate {
            block_hash,
            height,
            round,
            approvals,
        } = certificate;
        let mut signed: BTreeMap<Address, Approval> =
            approvals.into_iter().map(|a| (a.validator, a)).collect();
        if let Some(candidate) = self.candidates.get(&block_hash) {
            for (validator, approval) in &candidate.approvals {
                signed.entry(*validator).or_insert_with(|| approval.clone());
            }
        }
        if let Some(held) = self.orphans.get(&block_hash) {
            for (validator, approval) in &held.approvals {
                if approval.height == height
                    && approval.round == round
                    && committee.contains(validator)
                {
                    signed.entry(*validator).or_insert_with(|| approval.clone());
                }
            }
        }

        self.mark_finalized(height);
        self.sealed = Some(Sealed {
            committee,
            record: Certificate {
                block_hash,
                height,
                round,
                approvals: signed.into_values().collect(),
            },
        });
    }

    /// Every approval known for the newest finalized block, as a
    /// certificate. This is what the next proposer carries forward.
    pub fn participation(&self) -> Option<&Certificate> {
        self.sealed
            .as_ref()
            .map(|s| &s.record)
            .filter(|c| c.height == self.finalized_height)
    }

    /// Record that `height` is final: every candidate and buffered approval
    /// at or below it is discarded, and later approvals for it are rejected.
    pub fn mark_finalized(&mut self, height: u64) {
        self.finalized_height = self.finalized_height.max(height);
        let h = self.finalized_height;
        self.candidates.retain(|_, c| c.height > h);
        self.orphans.retain(|_, o| o.height > h);
        self.cast.retain(|(_, height, _), _| *height > h);
        if self.sealed.as_ref().is_some_and(|s| s.record.height < h) {
            self.sealed = None;
        }
    }

    /// Drop candidates for `height` proposed in `round` or earlier.
    pub fn abandon(&mut self, height: u64, round: u32) {
        self.candidates
            .retain(|_, c| c.height != height || c.round > round);
    }

    pub fn equivocations(&self) -> &[EquivocationEvidence] {
        &self.equivocations
    }
}
