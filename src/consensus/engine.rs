//! Per-height consensus driver.
//!
//! The engine is synchronous and transport-agnostic: each handler takes the
//! current time, mutates local bookkeeping, and returns the messages the
//! caller should broadcast. The async node and the in-process simulator
//! both drive it the same way.

use std::collections::{HashMap, HashSet};

use crate::chain::{Blockchain, ChainError};
use crate::consensus::approval::{
    Approval, ApprovalAggregator, ApprovalOutcome, Certificate, EquivocationEvidence,
};
use crate::consensus::block::{build_block, validate_proposal, Block, BlockHash};
use crate::consensus::schedule::{epoch_of, proposer_for};
use crate::consensus::ConsensusError;
use crate::crypto::keys::SigningKeypair;
use crate::network::protocol::Message;
use crate::node::mempool::{MempoolError, TransactionPool};
use crate::state::ChainState;
use crate::transaction::{Transaction, TxHash};
use crate::Address;

/// Consensus state for one node.
pub struct Engine {
    chain: Blockchain,
    pool: TransactionPool,
    aggregator: ApprovalAggregator,
    keypair: Option<SigningKeypair>,
    /// Current round at height `tip + 1`.
    round: u32,
    round_started_ms: Option<u64>,
    /// Validated proposals for the next height with the state after each.
    candidates: HashMap<BlockHash, (Block, ChainState)>,
    /// Proposals for `tip + 2`, replayed once `tip + 1` is final.
    early_proposals: Vec<Block>,
    /// Rounds at the next height in which this node signed an approval.
    approved: HashSet<u32>,
    /// Rounds at the next height in which this node proposed.
    proposed: HashSet<u32>,
    /// Set when a finalized block could not be persisted or the network
    /// finalized a different block at a height this node already holds.
    halted: Option<String>,
}

impl Engine {
    /// `keypair` is `None` for a node that follows the chain without voting.
    pub fn new(chain: Blockchain, keypair: Option<SigningKeypair>) -> Self {
        Self::with_pool(chain, keypair, TransactionPool::default())
    }

    pub fn with_pool(
        chain: Blockchain,
        keypair: Option<SigningKeypair>,
        pool: TransactionPool,
    ) -> Self {
        let aggregator = ApprovalAggregator::new(*chain.chain_id(), chain.height());
        Engine {
            chain,
            pool,
            aggregator,
            keypair,
            round: 0,
            round_started_ms: None,
            candidates: HashMap::new(),
            early_proposals: Vec::new(),
            approved: HashSet::new(),
            proposed: HashSet::new(),
            halted: None,
        }
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn address(&self) -> Option<Address> {
        self.keypair.as_ref().map(SigningKeypair::address)
    }

    /// Whether this node sits on the committee for the next height.
    pub fn is_committee_member(&self) -> bool {
        self.address()
            .is_some_and(|a| self.chain.committee().contains(&a))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn equivocations(&self) -> &[EquivocationEvidence] {
        self.aggregator.equivocations()
    }

    pub fn pending_proposals(&self) -> usize {
        self.candidates.len()
    }

    /// Admit a client or gossiped transaction to the pool.
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<TxHash, MempoolError> {
        self.pool.add(tx, self.chain.state(), self.chain.chain_id())
    }

    /// Handle a proposal for the next height.
    ///
    /// A valid proposal is tracked, and approved if this node is on the
    /// committee and has not yet approved anything in that round.
    pub fn on_proposal(&mut self, block: Block, now_ms: u64) -> Result<Vec<Message>, ConsensusError> {
        if self.halted.is_some() {
            return Ok(Vec::new());
        }
        let next = self.chain.height() + 1;
        let height = block.height();
        if height < next {
            return Err(ConsensusError::HeightAlreadyFinalized(height));
        }
        if height == next + 1 {
            if self.early_proposals.len() < self.chain.committee().len().max(1) {
                self.early_proposals.push(block);
            }
            return Ok(Vec::new());
        }
        if height > next {
            return Err(ConsensusError::NonContiguousHeight {
                expected: next,
                got: height,
            });
        }
        if block.header.round < self.round {
            return Err(ConsensusError::StaleRound {
                current: self.round,
                got: block.header.round,
            });
        }
        if self.candidates.contains_key(&block.header_hash) {
            return Ok(Vec::new());
        }

        let state = validate_proposal(&self.chain.tip_context(), &block, Some(now_ms))?;

        if block.header.round > self.round {
            tracing::debug!(
                height,
                from = self.round,
                to = block.header.round,
                "fast-forwarding round"
            );
            self.enter_round(block.header.round, now_ms);
        }

        tracing::debug!(
            height,
            round = block.header.round,
            hash = %block.header_hash,
            proposer = %block.header.proposer.short(),
            txs = block.transactions.len(),
            "proposal accepted"
        );
        let mut out = Vec::new();
        self.accept_candidate(block, state, now_ms, &mut out)?;
        Ok(out)
    }

    /// Handle an approval from a committee member.
    ///
    /// `Ok` means the approval's signature was checked, so the caller may
    /// relay it. Approvals for the newest finalized block still count as
    /// participation.
    pub fn on_approval(&mut self, approval: Approval, now_ms: u64) -> Result<Vec<Message>, ConsensusError> {
        if self.halted.is_some() {
            return Ok(Vec::new());
        }
        if approval.height < self.chain.height() {
            return Err(ConsensusError::HeightAlreadyFinalized(approval.height));
        }
        if approval.height == self.chain.height() + 1
            && !self.chain.committee().contains(&approval.validator)
        {
            return Err(ConsensusError::NotCommitteeMember(approval.validator));
        }
        let mut out = Vec::new();
        self.count_approval(approval, now_ms, &mut out)?;
        Ok(out)
    }

    /// Handle a block finalized elsewhere. Only `tip + 1` can be imported;
    /// anything further ahead means this node must sync.
    pub fn on_finalized_block(
        &mut self,
        block: Block,
        certificate: Certificate,
        now_ms: u64,
    ) -> Result<Vec<Message>, ChainError> {
        if self.halted.is_some() {
            return Ok(Vec::new());
        }
        let height = block.height();
        if height <= self.chain.height() {
            if self.chain.block(height).map(|b| b.header_hash) == Some(block.header_hash) {
                return Ok(Vec::new());
            }
            self.check_conflict(&block, &certificate);
            return Err(ConsensusError::HeightAlreadyFinalized(height).into());
        }

        if let Err(e) = self
            .chain
            .import_finalized(block.clone(), certificate.clone(), Some(now_ms))
        {
            if let ChainError::Storage(_) = e {
                self.halt(&e);
            }
            return Err(e);
        }
        let mut out = vec![Message::FinalizedBlock {
            block: Box::new(block.clone()),
            certificate: certificate.clone(),
        }];
        self.after_commit(&block, certificate, now_ms, &mut out);
        Ok(out)
    }

    /// A block with a valid certificate at a height this node finalized
    /// differently means two quorums formed. Nothing here can undo that, so
    /// the node stops rather than build on a fork.
    fn check_conflict(&mut self, block: &Block, certificate: &Certificate) {
        let height = block.height();
        let Some(local) = self.chain.block(height) else {
            return;
        };
        let verified = block.header.compute_hash() == block.header_hash
            && certificate.block_hash == block.header_hash
            && certificate.height == height
            && block.committee == local.committee
            && certificate
                .verify(&local.committee, self.chain.state().registry(), self.chain.chain_id())
                .is_ok();
        if !verified {
            tracing::debug!(height, hash = %block.header_hash, "unverified conflicting block ignored");
            return;
        }
        let reason = format!(
            "conflicting finality at height {}: local {}, network {}",
            height, local.header_hash, block.header_hash
        );
        tracing::error!(height, local = %local.header_hash, network = %block.header_hash, "two blocks finalized at one height, halting");
        self.halted = Some(reason);
    }

    /// Import a batch of finalized blocks in order, skipping ones already
    /// held. Returns how many were applied.
    pub fn import_blocks(
        &mut self,
        blocks: Vec<(Block, Certificate)>,
        now_ms: u64,
    ) -> Result<usize, ChainError> {
        let mut applied = 0;
        for (block, certificate) in blocks {
            if block.height() <= self.chain.height() {
                continue;
            }
            self.on_finalized_block(block, certificate, now_ms)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Advance timers: abandon a round that ran out of time, and propose if
    /// it is this node's turn.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Message> {
        if self.halted.is_some() {
            return Vec::new();
        }
        let started = *self.round_started_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(started) >= self.chain.params().round_timeout_ms {
            tracing::warn!(
                height = self.chain.height() + 1,
                round = self.round,
                "round timed out without quorum, abandoning"
            );
            self.enter_round(self.round.saturating_add(1), now_ms);
        }

        let mut out = Vec::new();
        if let Err(e) = self.maybe_propose(now_ms, &mut out) {
            tracing::debug!(error = %e, "could not propose");
        }
        out
    }

    fn maybe_propose(&mut self, now_ms: u64, out: &mut Vec<Message>) -> Result<(), ConsensusError> {
        let Some(keypair) = self.keypair.as_ref() else {
            return Ok(());
        };
        let height = self.chain.height() + 1;
        let expected = proposer_for(self.chain.committee(), height, self.round)
            .ok_or(ConsensusError::EmptyCommittee)?;
        if expected != keypair.address() || self.proposed.contains(&self.round) {
            return Ok(());
        }
        let earliest = self
            .chain
            .tip()
            .header
            .timestamp
            .saturating_add(self.chain.params().block_interval_ms);
        if now_ms < earliest {
            return Ok(());
        }

        let max = self.chain.params().max_txs_per_block;
        let candidates = self.pool.select(max.saturating_mul(2));
        let mut tip = self.chain.tip_context();
        if let Some(record) = self.aggregator.participation() {
            if record.height == tip.block.header.height {
                tip.certificate = Some(record);
            }
        }
        let (block, state) = build_block(
            &tip,
            keypair,
            self.round,
            now_ms,
            candidates,
        )?;
        self.proposed.insert(self.round);
        tracing::info!(
            height,
            round = self.round,
            hash = %block.header_hash,
            txs = block.transactions.len(),
            "proposing block"
        );
        out.push(Message::Proposal(Box::new(block.clone())));
        self.accept_candidate(block, state, now_ms, out)
    }

    /// Track a validated block, replay early approvals, and approve it.
    fn accept_candidate(
        &mut self,
        block: Block,
        state: ChainState,
        now_ms: u64,
        out: &mut Vec<Message>,
    ) -> Result<(), ConsensusError> {
        let hash = block.header_hash;
        let height = block.height();
        let round = block.header.round;
        let buffered = self
            .aggregator
            .track(hash, height, round, block.committee.clone())?;
        self.candidates.insert(hash, (block, state));

        for approval in buffered {
            if let Err(e) = self.count_approval(approval, now_ms, out) {
                tracing::debug!(error = %e, "buffered approval rejected");
            }
            if self.chain.height() >= height {
                return Ok(());
            }
        }

        let Some(keypair) = self.keypair.as_ref() else {
            return Ok(());
        };
        if !self.chain.committee().contains(&keypair.address()) || self.approved.contains(&round) {
            return Ok(());
        }
        let approval = Approval::sign(keypair, self.chain.chain_id(), hash, height, round);
        self.approved.insert(round);
        out.push(Message::Approval(approval.clone()));
        self.count_approval(approval, now_ms, out)
    }

    fn count_approval(
        &mut self,
        approval: Approval,
        now_ms: u64,
        out: &mut Vec<Message>,
    ) -> Result<(), ConsensusError> {
        match self.aggregator.add(approval, self.chain.state().registry())? {
            ApprovalOutcome::Quorum(certificate) => {
                self.finalize(certificate, now_ms, out);
                Ok(())
            }
            ApprovalOutcome::Pending { weight, quorum } => {
                tracing::trace!(weight = weight as u64, quorum = quorum as u64, "approval counted");
                Ok(())
            }
            ApprovalOutcome::Late => {
                tracing::trace!("late approval recorded as participation");
                Ok(())
            }
            ApprovalOutcome::Buffered | ApprovalOutcome::Duplicate => Ok(()),
        }
    }

    fn finalize(&mut self, certificate: Certificate, now_ms: u64, out: &mut Vec<Message>) {
        let Some((block, state)) = self.candidates.remove(&certificate.block_hash) else {
            return;
        };
        if let Err(e) = self
            .chain
            .commit(block.clone(), certificate.clone(), state)
        {
            self.halt(&e);
            return;
        }
        tracing::info!(
            height = block.height(),
            round = certificate.round,
            hash = %block.header_hash,
            txs = block.transactions.len(),
            approvals = certificate.approvals.len(),
            "block finalized"
        );
        out.push(Message::FinalizedBlock {
            block: Box::new(block.clone()),
            certificate: certificate.clone(),
        });
        self.after_commit(&block, certificate, now_ms, out);
    }

    /// Bookkeeping shared by locally finalized and imported blocks.
    fn after_commit(
        &mut self,
        block: &Block,
        certificate: Certificate,
        now_ms: u64,
        out: &mut Vec<Message>,
    ) {
        let height = block.height();
        for tx in &block.transactions {
            self.pool.remove(&tx.hash);
        }
        let pruned = self.pool.prune(self.chain.state());
        if pruned > 0 {
            tracing::debug!(height, pruned, "pruned invalidated pool entries");
        }

        let params = self.chain.params();
        if epoch_of(height + 1, params.epoch_length) != epoch_of(height, params.epoch_length) {
            tracing::info!(
                epoch = epoch_of(height + 1, params.epoch_length),
                committee = self.chain.committee().len(),
                "entering new epoch"
            );
        }

        self.aggregator.seal(certificate, block.committee.clone());
        self.candidates.clear();
        self.approved.clear();
        self.proposed.clear();
        self.round = 0;
        self.round_started_ms = Some(now_ms);

        let early = std::mem::take(&mut self.early_proposals);
        for proposal in early {
            if proposal.height() != height + 1 {
                continue;
            }
            match self.on_proposal(proposal, now_ms) {
                Ok(mut msgs) => out.append(&mut msgs),
                Err(e) => tracing::debug!(error = %e, "early proposal rejected"),
            }
        }
    }

    fn enter_round(&mut self, round: u32, now_ms: u64) {
        let height = self.chain.height() + 1;
        if round > self.round {
            self.aggregator.abandon(height, round - 1);
            self.candidates.retain(|_, (b, _)| b.header.round >= round);
        }
        self.round = round;
        self.round_started_ms = Some(now_ms);
    }

    fn halt(&mut self, error: &ChainError) {
        tracing::error!(
            height = self.chain.height() + 1,
            error = %error,
            "failed to persist finalized block, halting block production"
        );
        self.halted = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::{ConsensusParams, GenesisConfig};
    use crate::node::storage::MemoryStorage;

    const T0: u64 = 1_000;

    fn network(n: usize, params: ConsensusParams) -> (Vec<Engine>, GenesisConfig, MemoryStorage) {
        let keys: Vec<SigningKeypair> = (0..n).map(|_| SigningKeypair::generate()).collect();
        let genesis = GenesisConfig::new(
            "engine-test",
            T0,
            &[],
            &keys.iter().map(|k| (k.public.clone(), 10)).collect::<Vec<_>>(),
            params,
        );
        let first_storage = MemoryStorage::new();
        let engines = keys
            .into_iter()
            .enumerate()
            .map(|(i, kp)| {
                let storage: Box<dyn crate::node::storage::Storage> = if i == 0 {
                    Box::new(first_storage.clone())
                } else {
                    Box::new(MemoryStorage::new())
                };
                let chain = Blockchain::from_genesis(&genesis, storage).unwrap();
                Engine::new(chain, Some(kp))
            })
            .collect();
        (engines, genesis, first_storage)
    }

    /// Deliver `msgs` from `from` to every other engine until quiet.
    fn deliver(engines: &mut [Engine], from: usize, msgs: Vec<Message>, now: u64) {
        let mut queue: Vec<(usize, Message)> = msgs.into_iter().map(|m| (from, m)).collect();
        while let Some((sender, msg)) = queue.pop() {
            for i in 0..engines.len() {
                if i == sender {
                    continue;
                }
                let produced = match msg.clone() {
                    Message::Proposal(b) => engines[i].on_proposal(*b, now).unwrap_or_default(),
                    Message::Approval(a) => engines[i].on_approval(a, now).unwrap_or_default(),
                    Message::FinalizedBlock { block, certificate } => engines[i]
                        .on_finalized_block(*block, certificate, now)
                        .unwrap_or_default(),
                    _ => Vec::new(),
                };
                queue.extend(produced.into_iter().map(|m| (i, m)));
            }
        }
    }

    fn step(engines: &mut [Engine], now: u64) {
        for i in 0..engines.len() {
            let msgs = engines[i].tick(now);
            deliver(engines, i, msgs, now);
        }
    }

    #[test]
    fn single_validator_finalizes_alone() {
        let (mut engines, _, _) = network(1, ConsensusParams::default());
        let msgs = engines[0].tick(T0 + 1_000);
        assert_eq!(engines[0].chain().height(), 1);
        assert!(matches!(msgs[0], Message::Proposal(_)));
        assert!(msgs.iter().any(|m| matches!(m, Message::FinalizedBlock { .. })));
    }

    #[test]
    fn waits_for_block_interval() {
        let (mut engines, _, _) = network(1, ConsensusParams::default());
        assert!(engines[0].tick(T0 + 10).is_empty());
        assert_eq!(engines[0].chain().height(), 0);
    }

    #[test]
    fn four_validators_agree() {
        let (mut engines, _, _) = network(4, ConsensusParams::default());
        let mut now = T0;
        for _ in 0..5 {
            now += 1_000;
            step(&mut engines, now);
        }
        let height = engines[0].chain().height();
        assert!(height >= 5);
        for e in &engines {
            assert_eq!(e.chain().height(), height);
            assert_eq!(e.chain().tip_hash(), engines[0].chain().tip_hash());
            assert!(e.chain().verify_links());
        }
    }

    #[test]
    fn transactions_flow_into_blocks() {
        let user = SigningKeypair::generate();
        let keys: Vec<SigningKeypair> = (0..2).map(|_| SigningKeypair::generate()).collect();
        let genesis = GenesisConfig::new(
            "engine-tx",
            T0,
            &[(user.address(), 100)],
            &keys.iter().map(|k| (k.public.clone(), 10)).collect::<Vec<_>>(),
            ConsensusParams::default(),
        );
        let chain_id = genesis.chain_id().unwrap();
        let mut engines: Vec<Engine> = keys
            .into_iter()
            .map(|kp| {
                let chain =
                    Blockchain::from_genesis(&genesis, Box::new(MemoryStorage::new())).unwrap();
                Engine::new(chain, Some(kp))
            })
            .collect();

        let tx = Transaction::transfer(&user, Address([5; 32]), 10, 1, 1, chain_id);
        for e in engines.iter_mut() {
            e.submit_transaction(tx.clone()).unwrap();
        }
        step(&mut engines, T0 + 1_000);

        for e in &engines {
            assert_eq!(e.chain().height(), 1);
            assert_eq!(e.chain().state().accounts().balance(&user.address()), 89);
            assert_eq!(e.chain().state().accounts().balance(&Address([5; 32])), 10);
            assert!(e.pool().is_empty());
        }
    }

    #[test]
    fn stale_round_and_finalized_height_rejected() {
        let (mut engines, _, _) = network(3, ConsensusParams::default());
        let first = engines[0].tick(T0 + 1_000);
        let first = first
            .into_iter()
            .chain(engines[1].tick(T0 + 1_000))
            .chain(engines[2].tick(T0 + 1_000))
            .find_map(|m| match m {
                Message::Proposal(b) => Some(*b),
                _ => None,
            })
            .unwrap();

        // Everyone times out into round 1 before seeing the round-0 proposal.
        let late = T0 + 1_000 + ConsensusParams::default().round_timeout_ms;
        let receiver = engines
            .iter()
            .position(|e| e.address() != Some(first.header.proposer))
            .unwrap();
        engines[receiver].tick(late);
        assert_eq!(engines[receiver].round(), 1);
        assert_eq!(
            engines[receiver].on_proposal(first, late),
            Err(ConsensusError::StaleRound { current: 1, got: 0 })
        );
    }

    #[test]
    fn timeout_moves_to_next_proposer() {
        let (mut engines, _, _) = network(3, ConsensusParams::default());
        let committee = engines[0].chain().committee().clone();
        let silent = proposer_for(&committee, 1, 0).unwrap();
        let next = proposer_for(&committee, 1, 1).unwrap();
        assert_ne!(silent, next);

        let mut live: Vec<Engine> = engines
            .drain(..)
            .filter(|e| e.address() != Some(silent))
            .collect();
        let mut now = T0 + 1_000;
        step(&mut live, now);
        assert!(live.iter().all(|e| e.chain().height() == 0));

        now += ConsensusParams::default().round_timeout_ms;
        step(&mut live, now);
        for e in &live {
            assert_eq!(e.chain().height(), 1);
            assert_eq!(e.chain().tip().header.proposer, next);
            assert_eq!(e.chain().tip().header.round, 1);
        }
    }

    #[test]
    fn members_signing_every_block_keep_their_reputation() {
        let params = ConsensusParams {
            epoch_length: 2,
            inactivity_window: 2,
            ..ConsensusParams::default()
        };
        let (mut engines, _, _) = network(7, params);
        let mut now = T0;
        for _ in 0..20 {
            now += 1_000;
            step(&mut engines, now);
        }

        let chain = engines[0].chain();
        assert_eq!(chain.height(), 20);
        assert_eq!(chain.committee().len(), 7);
        // Approvals that arrived after quorum are carried forward too.
        let carried = chain.tip().last_certificate.as_ref().unwrap();
        assert_eq!(carried.approvals.len(), 7);
        for record in chain.state().registry().iter() {
            assert!(
                record.reputation > 0,
                "{} penalized to {}",
                record.address.short(),
                record.reputation
            );
        }
    }

    #[test]
    fn unverifiable_approvals_are_refused() {
        let (mut engines, _, _) = network(3, ConsensusParams::default());
        let member = engines[1].address().unwrap();
        let junk = |height: u64, validator: Address| Approval {
            block_hash: BlockHash([7; 32]),
            height,
            round: 0,
            validator,
            signature: crate::crypto::keys::Signature::empty(),
        };

        assert!(matches!(
            engines[0].on_approval(junk(u64::MAX, member), T0),
            Err(ConsensusError::NonContiguousHeight { .. })
        ));
        assert_eq!(
            engines[0].on_approval(junk(1, member), T0),
            Err(ConsensusError::BadSignature)
        );
        assert_eq!(
            engines[0].on_approval(junk(1, Address([9; 32])), T0),
            Err(ConsensusError::NotCommitteeMember(Address([9; 32])))
        );
    }

    #[test]
    fn conflicting_finality_halts_the_node() {
        let kp = SigningKeypair::generate();
        let genesis = GenesisConfig::new(
            "fork-test",
            T0,
            &[],
            &[(kp.public.clone(), 10)],
            ConsensusParams::default(),
        );
        let make = || {
            let chain = Blockchain::from_genesis(&genesis, Box::new(MemoryStorage::new())).unwrap();
            Engine::new(chain, Some(kp.clone()))
        };
        let mut ours = make();
        let mut theirs = make();
        ours.tick(T0 + 1_000);
        let (block, certificate) = theirs
            .tick(T0 + 1_500)
            .into_iter()
            .find_map(|m| match m {
                Message::FinalizedBlock { block, certificate } => Some((*block, certificate)),
                _ => None,
            })
            .unwrap();
        assert_ne!(block.header_hash, ours.chain().tip_hash());

        let mut forged = certificate.clone();
        forged.approvals.clear();
        assert!(ours.on_finalized_block(block.clone(), forged, T0 + 2_000).is_err());
        assert!(!ours.is_halted());

        assert!(ours.on_finalized_block(block, certificate, T0 + 2_000).is_err());
        assert!(ours
            .halt_reason()
            .unwrap()
            .contains("conflicting finality at height 1"));
        assert!(ours.tick(T0 + 3_000).is_empty());
    }

    #[test]
    fn storage_failure_halts_production() {
        let (mut engines, _, storage) = network(1, ConsensusParams::default());
        engines[0].tick(T0 + 1_000);
        assert_eq!(engines[0].chain().height(), 1);

        storage.set_fail_writes(true);
        engines[0].tick(T0 + 2_000);
        assert!(engines[0].is_halted());
        assert_eq!(engines[0].chain().height(), 1);
        assert!(engines[0].tick(T0 + 3_000).is_empty());
    }

    #[test]
    fn lagging_node_imports_finalized_blocks() {
        let (mut engines, genesis, _) = network(1, ConsensusParams::default());
        for i in 1..=3 {
            engines[0].tick(T0 + i * 1_000);
        }
        let blocks = engines[0].chain().blocks_from(1, 10);
        assert_eq!(blocks.len(), 3);

        let chain = Blockchain::from_genesis(&genesis, Box::new(MemoryStorage::new())).unwrap();
        let mut follower = Engine::new(chain, None);
        let (b3, c3) = blocks[2].clone();
        assert!(matches!(
            follower.on_finalized_block(b3, c3, T0 + 4_000),
            Err(ChainError::Consensus(ConsensusError::NonContiguousHeight { .. }))
        ));
        assert_eq!(follower.import_blocks(blocks, T0 + 4_000).unwrap(), 3);
        assert_eq!(follower.chain().tip_hash(), engines[0].chain().tip_hash());
    }
}
