//! The canonical chain of finalized blocks.
//!
//! Heights are contiguous from genesis and every block links to its
//! predecessor's header hash. A block enters the chain only with a
//! certificate, and only after it has been written to storage: a failed
//! write leaves the in-memory tip exactly where it was.

use crate::consensus::approval::Certificate;
use crate::consensus::block::{validate_proposal, Block, BlockHash, ChainTip};
use crate::consensus::committee::{select_committee, Committee};
use crate::consensus::schedule::{epoch_of, is_epoch_end};
use crate::consensus::ConsensusError;
use crate::genesis::{ConsensusParams, GenesisConfig, GenesisError};
use crate::node::storage::{FinalizedRecord, Storage, StorageError};
use crate::state::ChainState;
use crate::Hash;

/// Errors from chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("consensus: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("genesis: {0}")]
    Genesis(#[from] GenesisError),
    #[error("stored chain is corrupt: {0}")]
    Corrupt(String),
}

/// Finalized blocks plus the canonical state after the tip.
pub struct Blockchain {
    chain_id: Hash,
    params: ConsensusParams,
    /// Indexed by height.
    blocks: Vec<Block>,
    /// Certificate for each height; `None` for genesis.
    certificates: Vec<Option<Certificate>>,
    state: ChainState,
    /// Committee for height `tip + 1`.
    committee: Committee,
    storage: Box<dyn Storage>,
}

impl Blockchain {
    /// Build genesis, then replay every finalized block found in `storage`.
    ///
    /// Each stored block is validated exactly like a block received from the
    /// network, and the recomputed state root must equal the stored one.
    pub fn from_genesis(
        genesis: &GenesisConfig,
        storage: Box<dyn Storage>,
    ) -> Result<Self, ChainError> {
        let chain_id = genesis.chain_id()?;
        let state = genesis.build_state()?;
        let params = genesis.params.clone();
        let committee = select_committee(state.registry(), params.committee_size(), 0);
        if committee.is_empty() {
            return Err(ConsensusError::EmptyCommittee.into());
        }
        let block = Block::genesis(genesis.genesis_time, &state, committee.clone());

        let mut chain = Blockchain {
            chain_id,
            params,
            blocks: Vec::new(),
            certificates: Vec::new(),
            state: ChainState::new(),
            committee,
            storage,
        };
        chain.append(block, None, state);

        let latest = chain.storage.get_latest_height()?.unwrap_or(0);
        for height in 1..=latest {
            let record = chain
                .storage
                .get_record(height)?
                .ok_or_else(|| ChainError::Corrupt(format!("missing block at height {}", height)))?;
            let state = chain.verify_finalized(&record.block, &record.certificate, None)?;
            if !crate::constant_time_eq(&state.state_root(), &record.state_root) {
                return Err(ChainError::Corrupt(format!(
                    "state root mismatch at height {}",
                    height
                )));
            }
            chain.append(record.block, Some(record.certificate), state);
        }
        if latest > 0 {
            tracing::info!(height = latest, "replayed finalized blocks from storage");
        }
        Ok(chain)
    }

    pub fn chain_id(&self) -> &Hash {
        &self.chain_id
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn height(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    pub fn tip(&self) -> &Block {
        // Genesis is appended in the constructor, so the chain is never empty.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.tip().header_hash
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// Committee for the next height.
    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn block(&self, height: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(height).ok()?)
    }

    pub fn certificate(&self, height: u64) -> Option<&Certificate> {
        self.certificates
            .get(usize::try_from(height).ok()?)
            .and_then(Option::as_ref)
    }

    /// View of the tip for building or validating the next block.
    pub fn tip_context(&self) -> ChainTip<'_> {
        let height = self.height();
        ChainTip {
            block: self.tip(),
            certificate: self.certificate(height),
            state: &self.state,
            committee: &self.committee,
            params: &self.params,
            chain_id: &self.chain_id,
        }
    }

    /// Commit a block finalized by `certificate`, with the state obtained by
    /// validating it. Storage is written first; on failure nothing changes.
    pub fn commit(
        &mut self,
        block: Block,
        certificate: Certificate,
        state: ChainState,
    ) -> Result<(), ChainError> {
        let expected = self.height() + 1;
        if block.height() != expected {
            return Err(ConsensusError::NonContiguousHeight {
                expected,
                got: block.height(),
            }
            .into());
        }
        if block.header.previous_hash != self.tip_hash() {
            return Err(ConsensusError::ChainMismatch.into());
        }
        if certificate.block_hash != block.header_hash || certificate.height != block.height() {
            return Err(ConsensusError::BadCertificate("certificate is for another block".into()).into());
        }

        let record = FinalizedRecord {
            block,
            certificate,
            state_root: state.state_root(),
        };
        self.storage.put_finalized(&record)?;
        self.append(record.block, Some(record.certificate), state);
        Ok(())
    }

    /// Validate and commit a block finalized elsewhere (sync or gossip).
    pub fn import_finalized(
        &mut self,
        block: Block,
        certificate: Certificate,
        now_ms: Option<u64>,
    ) -> Result<(), ChainError> {
        let state = self.verify_finalized(&block, &certificate, now_ms)?;
        self.commit(block, certificate, state)
    }

    /// Replay `block` on the tip and check `certificate` finalizes it.
    fn verify_finalized(
        &self,
        block: &Block,
        certificate: &Certificate,
        now_ms: Option<u64>,
    ) -> Result<ChainState, ChainError> {
        let state = validate_proposal(&self.tip_context(), block, now_ms)?;
        if certificate.block_hash != block.header_hash || certificate.height != block.height() {
            return Err(ConsensusError::BadCertificate("certificate is for another block".into()).into());
        }
        if certificate.round != block.header.round {
            return Err(ConsensusError::BadCertificate("certificate round differs from block".into()).into());
        }
        certificate.verify(&block.committee, self.state.registry(), &self.chain_id)?;
        Ok(state)
    }

    fn append(&mut self, block: Block, certificate: Option<Certificate>, state: ChainState) {
        let height = block.height();
        self.blocks.push(block);
        self.certificates.push(certificate);
        self.state = state;

        if is_epoch_end(height, self.params.epoch_length) {
            let epoch = epoch_of(height + 1, self.params.epoch_length);
            let next = select_committee(self.state.registry(), self.params.committee_size(), epoch);
            if next.is_empty() {
                // Keep the outgoing committee rather than stall with nobody to propose.
                tracing::warn!(epoch, "no eligible validators, keeping previous committee");
                self.committee.epoch = epoch;
            } else {
                if next.addresses() != self.committee.addresses() {
                    tracing::info!(
                        epoch,
                        size = next.len(),
                        total_weight = next.total_weight() as u64,
                        "committee rotated"
                    );
                }
                self.committee = next;
            }
        }
    }

    /// Finalized blocks with certificates, starting at `from_height`
    /// (heights below 1 are clamped to 1), at most `limit` of them.
    pub fn blocks_from(&self, from_height: u64, limit: usize) -> Vec<(Block, Certificate)> {
        let start = from_height.max(1);
        (start..=self.height())
            .take(limit)
            .filter_map(|h| {
                let block = self.block(h)?;
                let cert = self.certificate(h)?;
                Some((block.clone(), cert.clone()))
            })
            .collect()
    }

    /// Check heights are contiguous and every block links to its parent.
    pub fn verify_links(&self) -> bool {
        self.blocks.iter().enumerate().all(|(i, block)| {
            block.height() == i as u64
                && (i == 0 || block.header.previous_hash == self.blocks[i - 1].header_hash)
        })
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.storage.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::approval::Approval;
    use crate::consensus::block::build_block;
    use crate::consensus::schedule;
    use crate::crypto::keys::SigningKeypair;
    use crate::node::storage::MemoryStorage;

    struct Setup {
        keys: Vec<SigningKeypair>,
        genesis: GenesisConfig,
    }

    fn setup(params: ConsensusParams) -> Setup {
        let keys: Vec<SigningKeypair> = (0..3).map(|_| SigningKeypair::generate()).collect();
        let genesis = GenesisConfig::new(
            "chain-test",
            1_000,
            &[],
            &keys.iter().map(|k| (k.public.clone(), 10)).collect::<Vec<_>>(),
            params,
        );
        Setup { keys, genesis }
    }

    /// Build, approve by everyone, and commit the next block.
    fn extend(chain: &mut Blockchain, keys: &[SigningKeypair]) -> Block {
        let tip = chain.tip_context();
        let height = tip.next_height();
        let proposer_addr = schedule::proposer_for(tip.committee, height, 0).unwrap();
        let proposer = keys.iter().find(|k| k.address() == proposer_addr).unwrap();
        let (block, state) =
            build_block(&tip, proposer, 0, 1_000 + height * 1_000, Vec::new()).unwrap();
        let mut approvals: Vec<Approval> = keys
            .iter()
            .filter(|k| tip.committee.contains(&k.address()))
            .map(|k| Approval::sign(k, chain.chain_id(), block.header_hash, height, 0))
            .collect();
        approvals.sort_by_key(|a| a.validator);
        let cert = Certificate {
            block_hash: block.header_hash,
            height,
            round: 0,
            approvals,
        };
        chain.commit(block.clone(), cert, state).unwrap();
        block
    }

    #[test]
    fn genesis_is_deterministic() {
        let s = setup(ConsensusParams::default());
        let a = Blockchain::from_genesis(&s.genesis, Box::new(MemoryStorage::new())).unwrap();
        let b = Blockchain::from_genesis(&s.genesis, Box::new(MemoryStorage::new())).unwrap();
        assert_eq!(a.height(), 0);
        assert_eq!(a.tip_hash(), b.tip_hash());
        assert!(a.tip().signature.is_empty());
        assert_eq!(a.tip().header.proposer, a.committee().members[0].address);
    }

    #[test]
    fn commit_extends_and_links() {
        let s = setup(ConsensusParams::default());
        let mut chain = Blockchain::from_genesis(&s.genesis, Box::new(MemoryStorage::new())).unwrap();
        for _ in 0..4 {
            extend(&mut chain, &s.keys);
        }
        assert_eq!(chain.height(), 4);
        assert!(chain.verify_links());
        assert!(chain.certificate(0).is_none());
        assert!(chain.certificate(4).is_some());
        assert_eq!(chain.blocks_from(0, 10).len(), 4);
        assert_eq!(chain.blocks_from(3, 10).len(), 2);
        assert_eq!(chain.blocks_from(1, 2).len(), 2);
    }

    #[test]
    fn failed_write_leaves_tip_untouched() {
        let s = setup(ConsensusParams::default());
        let storage = MemoryStorage::new();
        let mut chain = Blockchain::from_genesis(&s.genesis, Box::new(storage.clone())).unwrap();
        extend(&mut chain, &s.keys);
        let before = (chain.height(), chain.tip_hash(), chain.state().state_root());

        storage.set_fail_writes(true);
        let tip = chain.tip_context();
        let proposer_addr = schedule::proposer_for(tip.committee, 2, 0).unwrap();
        let proposer = s.keys.iter().find(|k| k.address() == proposer_addr).unwrap();
        let (block, state) = build_block(&tip, proposer, 0, 5_000, Vec::new()).unwrap();
        let mut approvals: Vec<Approval> = s
            .keys
            .iter()
            .map(|k| Approval::sign(k, chain.chain_id(), block.header_hash, 2, 0))
            .collect();
        approvals.sort_by_key(|a| a.validator);
        let cert = Certificate {
            block_hash: block.header_hash,
            height: 2,
            round: 0,
            approvals,
        };
        assert!(matches!(
            chain.commit(block, cert, state),
            Err(ChainError::Storage(_))
        ));
        assert_eq!(
            (chain.height(), chain.tip_hash(), chain.state().state_root()),
            before
        );
    }

    #[test]
    fn restart_replays_storage() {
        let s = setup(ConsensusParams::default());
        let storage = MemoryStorage::new();
        let mut chain = Blockchain::from_genesis(&s.genesis, Box::new(storage.clone())).unwrap();
        for _ in 0..3 {
            extend(&mut chain, &s.keys);
        }

        let restarted = Blockchain::from_genesis(&s.genesis, Box::new(storage)).unwrap();
        assert_eq!(restarted.height(), 3);
        assert_eq!(restarted.tip_hash(), chain.tip_hash());
        assert_eq!(restarted.state(), chain.state());
        assert_eq!(restarted.committee(), chain.committee());
    }

    #[test]
    fn import_rejects_bad_certificate() {
        let s = setup(ConsensusParams::default());
        let mut source = Blockchain::from_genesis(&s.genesis, Box::new(MemoryStorage::new())).unwrap();
        let block = extend(&mut source, &s.keys);
        let mut cert = source.certificate(1).unwrap().clone();

        let mut follower = Blockchain::from_genesis(&s.genesis, Box::new(MemoryStorage::new())).unwrap();
        let good = cert.clone();
        cert.approvals.truncate(1);
        assert!(matches!(
            follower.import_finalized(block.clone(), cert, None),
            Err(ChainError::Consensus(ConsensusError::BadCertificate(_)))
        ));
        assert_eq!(follower.height(), 0);

        follower.import_finalized(block, good, None).unwrap();
        assert_eq!(follower.tip_hash(), source.tip_hash());
    }

    #[test]
    fn committee_reselected_at_epoch_boundary() {
        let params = ConsensusParams {
            epoch_length: 2,
            max_committee_size: 2,
            ..ConsensusParams::default()
        };
        let s = setup(params);
        let mut chain = Blockchain::from_genesis(&s.genesis, Box::new(MemoryStorage::new())).unwrap();
        assert_eq!(chain.committee().epoch, 0);
        extend(&mut chain, &s.keys);
        // Height 1 closes epoch 0.
        assert_eq!(chain.committee().epoch, 1);
        assert_eq!(chain.committee().len(), 2);
        extend(&mut chain, &s.keys);
        assert_eq!(chain.committee().epoch, 1);
        extend(&mut chain, &s.keys);
        assert_eq!(chain.committee().epoch, 2);
    }
}
