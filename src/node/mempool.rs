//! Transaction pool with fee-priority ordering and per-sender nonce tracking.
//!
//! The pool holds transactions that passed validation against the canonical
//! state at the time they arrived. Proposers read candidates in priority
//! order without removing them; entries leave the pool only when a block
//! including them is finalized, or when the new canonical state makes them
//! invalid. A proposal that never finalizes therefore loses nothing.

use std::collections::{BTreeMap, HashMap};

use crate::constants::{MEMPOOL_MAX_TXS, MIN_TX_FEE};
use crate::state::{ChainState, StateError};
use crate::transaction::{Transaction, TxHash, TxValidationError};
use crate::{Address, Hash};

/// Errors from pool operations. Each maps to a stable reason code returned
/// to clients.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction already in pool")]
    Duplicate,
    #[error("invalid transaction: {0}")]
    Invalid(#[from] TxValidationError),
    #[error("rejected by state: {0}")]
    Rejected(#[from] StateError),
    #[error("sender already has a pending transaction with nonce {0}")]
    NonceConflict(u64),
    #[error("transaction fee {fee} below pool minimum {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },
}

impl MempoolError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            MempoolError::Duplicate => "duplicate",
            MempoolError::Invalid(e) => e.reason_code(),
            MempoolError::Rejected(e) => e.reason_code(),
            MempoolError::NonceConflict(_) => "nonce_conflict",
            MempoolError::FeeTooLow { .. } => "pool_fee_too_low",
        }
    }
}

#[derive(Clone, Debug)]
struct PoolEntry {
    tx: Transaction,
    key: FeeKey,
}

/// Fee-based ordering key for the BTreeMap priority index.
///
/// Ascending iteration yields highest fee first, then earliest insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct FeeKey {
    /// u64::MAX - fee
    neg_fee: u64,
    insertion_order: u64,
}

impl FeeKey {
    fn new(fee: u64, insertion_order: u64) -> Self {
        FeeKey {
            neg_fee: u64::MAX - fee,
            insertion_order,
        }
    }

    fn fee(&self) -> u64 {
        u64::MAX - self.neg_fee
    }
}

/// Summary for RPC reporting.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PoolStats {
    pub transaction_count: usize,
    pub max_transactions: usize,
    pub min_fee: Option<u64>,
    pub max_fee: Option<u64>,
}

/// Pending transactions awaiting inclusion.
pub struct TransactionPool {
    max_transactions: usize,
    txs: HashMap<TxHash, PoolEntry>,
    /// Priority index: first key = highest fee.
    fee_index: BTreeMap<FeeKey, TxHash>,
    /// (sender, nonce) -> pending tx, for conflict detection.
    by_sender: HashMap<(Address, u64), TxHash>,
    insertion_counter: u64,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(MEMPOOL_MAX_TXS)
    }
}

impl TransactionPool {
    pub fn new(max_transactions: usize) -> Self {
        TransactionPool {
            max_transactions: max_transactions.max(1),
            txs: HashMap::new(),
            fee_index: BTreeMap::new(),
            by_sender: HashMap::new(),
            insertion_counter: 0,
        }
    }

    /// Validate `tx` against the canonical `state` and admit it.
    ///
    /// Checks run cheapest first: duplicate, structure and signature, nonce
    /// and balance against canonical state, pending conflict, capacity.
    pub fn add(
        &mut self,
        tx: Transaction,
        state: &ChainState,
        chain_id: &Hash,
    ) -> Result<TxHash, MempoolError> {
        let hash = tx.hash;
        if self.txs.contains_key(&hash) {
            return Err(MempoolError::Duplicate);
        }

        tx.validate_structure(chain_id)?;
        state.check_transaction(&tx)?;

        if self.by_sender.contains_key(&(tx.from, tx.nonce)) {
            return Err(MempoolError::NonceConflict(tx.nonce));
        }

        if self.txs.len() >= self.max_transactions {
            let Some((&lowest_key, &lowest_hash)) = self.fee_index.last_key_value() else {
                return Err(MempoolError::FeeTooLow {
                    fee: tx.fee,
                    min_fee: MIN_TX_FEE,
                });
            };
            if tx.fee <= lowest_key.fee() {
                return Err(MempoolError::FeeTooLow {
                    fee: tx.fee,
                    min_fee: lowest_key.fee().saturating_add(1),
                });
            }
            tracing::debug!(evicted = %lowest_hash, fee = lowest_key.fee(), "pool full, evicting lowest fee");
            self.remove(&lowest_hash);
        }

        let key = FeeKey::new(tx.fee, self.insertion_counter);
        self.insertion_counter += 1;
        self.fee_index.insert(key, hash);
        self.by_sender.insert((tx.from, tx.nonce), hash);
        self.txs.insert(hash, PoolEntry { tx, key });
        Ok(hash)
    }

    /// Up to `max` transactions in priority order (fee descending, then
    /// arrival). Nothing is removed.
    pub fn select(&self, max: usize) -> Vec<Transaction> {
        self.fee_index
            .values()
            .take(max)
            .filter_map(|hash| self.txs.get(hash).map(|e| e.tx.clone()))
            .collect()
    }

    /// Remove a transaction. Removing an absent hash is a no-op.
    pub fn remove(&mut self, hash: &TxHash) -> Option<Transaction> {
        let entry = self.txs.remove(hash)?;
        self.fee_index.remove(&entry.key);
        self.by_sender.remove(&(entry.tx.from, entry.tx.nonce));
        Some(entry.tx)
    }

    /// Drop every entry that is no longer valid against `state`
    /// (already included, nonce consumed, balance spent). Returns the count.
    pub fn prune(&mut self, state: &ChainState) -> usize {
        let stale: Vec<TxHash> = self
            .txs
            .iter()
            .filter(|(_, entry)| state.check_transaction(&entry.tx).is_err())
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &stale {
            self.remove(hash);
        }
        stale.len()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.txs.contains_key(hash)
    }

    pub fn get(&self, hash: &TxHash) -> Option<&Transaction> {
        self.txs.get(hash).map(|e| &e.tx)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            transaction_count: self.txs.len(),
            max_transactions: self.max_transactions,
            min_fee: self.fee_index.last_key_value().map(|(k, _)| k.fee()),
            max_fee: self.fee_index.first_key_value().map(|(k, _)| k.fee()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;

    const CHAIN: Hash = [7u8; 32];

    fn funded(balances: &[(&SigningKeypair, u64)]) -> ChainState {
        let mut state = ChainState::new();
        for (kp, balance) in balances {
            state.fund_genesis_account(&kp.address(), *balance).unwrap();
        }
        state
    }

    #[test]
    fn add_and_select_by_fee() {
        let a = SigningKeypair::generate();
        let b = SigningKeypair::generate();
        let c = SigningKeypair::generate();
        let state = funded(&[(&a, 100), (&b, 100), (&c, 100)]);
        let mut pool = TransactionPool::default();

        let low = Transaction::transfer(&a, Address([1; 32]), 5, 1, 1, CHAIN);
        let high = Transaction::transfer(&b, Address([1; 32]), 5, 9, 1, CHAIN);
        let mid = Transaction::transfer(&c, Address([1; 32]), 5, 3, 1, CHAIN);
        for tx in [low.clone(), high.clone(), mid.clone()] {
            pool.add(tx, &state, &CHAIN).unwrap();
        }

        let selected = pool.select(10);
        assert_eq!(selected, vec![high.clone(), mid, low]);
        assert_eq!(pool.select(1), vec![high]);
        // select does not drain
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn rejections_carry_reason() {
        let a = SigningKeypair::generate();
        let state = funded(&[(&a, 10)]);
        let mut pool = TransactionPool::default();

        let stale = Transaction::transfer(&a, Address([1; 32]), 1, 1, 0, CHAIN);
        let err = pool.add(stale, &state, &CHAIN).unwrap_err();
        assert_eq!(err.reason_code(), "nonce_too_low");

        let rich = Transaction::transfer(&a, Address([1; 32]), 10, 1, 1, CHAIN);
        let err = pool.add(rich, &state, &CHAIN).unwrap_err();
        assert_eq!(err.reason_code(), "insufficient_balance");

        let mut forged = Transaction::transfer(&a, Address([1; 32]), 1, 1, 1, CHAIN);
        forged.signature = SigningKeypair::generate().sign(b"x");
        let err = pool.add(forged, &state, &CHAIN).unwrap_err();
        assert_eq!(err.reason_code(), "invalid_signature");

        let foreign = Transaction::transfer(&a, Address([1; 32]), 1, 1, 1, [8u8; 32]);
        assert_eq!(
            pool.add(foreign, &state, &CHAIN),
            Err(MempoolError::Invalid(TxValidationError::WrongChain))
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn duplicate_and_nonce_conflict() {
        let a = SigningKeypair::generate();
        let state = funded(&[(&a, 100)]);
        let mut pool = TransactionPool::default();

        let tx = Transaction::transfer(&a, Address([1; 32]), 1, 1, 1, CHAIN);
        pool.add(tx.clone(), &state, &CHAIN).unwrap();
        assert_eq!(pool.add(tx, &state, &CHAIN), Err(MempoolError::Duplicate));

        let rival = Transaction::transfer(&a, Address([2; 32]), 1, 1, 1, CHAIN);
        assert_eq!(
            pool.add(rival, &state, &CHAIN),
            Err(MempoolError::NonceConflict(1))
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let a = SigningKeypair::generate();
        let state = funded(&[(&a, 100)]);
        let mut pool = TransactionPool::default();
        let tx = Transaction::transfer(&a, Address([1; 32]), 1, 1, 1, CHAIN);
        let hash = pool.add(tx.clone(), &state, &CHAIN).unwrap();

        assert_eq!(pool.remove(&hash), Some(tx.clone()));
        assert_eq!(pool.remove(&hash), None);
        assert!(!pool.contains(&hash));
        // The sender slot is free again.
        pool.add(tx, &state, &CHAIN).unwrap();
    }

    #[test]
    fn full_pool_evicts_lowest_fee() {
        let keys: Vec<SigningKeypair> = (0..3).map(|_| SigningKeypair::generate()).collect();
        let state = funded(&keys.iter().map(|k| (k, 100)).collect::<Vec<_>>());
        let mut pool = TransactionPool::new(2);

        let cheap = Transaction::transfer(&keys[0], Address([1; 32]), 1, 2, 1, CHAIN);
        let other = Transaction::transfer(&keys[1], Address([1; 32]), 1, 5, 1, CHAIN);
        pool.add(cheap.clone(), &state, &CHAIN).unwrap();
        pool.add(other, &state, &CHAIN).unwrap();

        let too_cheap = Transaction::transfer(&keys[2], Address([1; 32]), 1, 2, 1, CHAIN);
        assert_eq!(
            pool.add(too_cheap, &state, &CHAIN),
            Err(MempoolError::FeeTooLow { fee: 2, min_fee: 3 })
        );

        let better = Transaction::transfer(&keys[2], Address([1; 32]), 1, 3, 1, CHAIN);
        pool.add(better, &state, &CHAIN).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&cheap.hash));
        assert_eq!(pool.stats().min_fee, Some(3));
    }

    #[test]
    fn prune_drops_included_and_unaffordable() {
        let a = SigningKeypair::generate();
        let b = SigningKeypair::generate();
        let mut state = funded(&[(&a, 100), (&b, 20)]);
        let mut pool = TransactionPool::default();

        let from_a = Transaction::transfer(&a, Address([1; 32]), 10, 1, 1, CHAIN);
        let from_b = Transaction::transfer(&b, Address([1; 32]), 10, 1, 1, CHAIN);
        pool.add(from_a.clone(), &state, &CHAIN).unwrap();
        pool.add(from_b.clone(), &state, &CHAIN).unwrap();

        // A's tx is included. B's nonce is consumed by a transfer that never
        // went through this pool.
        state.apply_transaction(&from_a, &Address([9; 32])).unwrap();
        let drain = Transaction::transfer(&b, Address([2; 32]), 19, 1, 1, CHAIN);
        state.apply_transaction(&drain, &Address([9; 32])).unwrap();

        assert_eq!(pool.prune(&state), 2);
        assert!(pool.is_empty());
    }
}
