//! Account ledger and the deterministic state transition.
//!
//! [`ChainState`] bundles the account ledger with the validator registry.
//! Block producers and validators work on a clone (the tentative state) and
//! only the [`crate::chain::Blockchain`] swaps a tentative state in as
//! canonical, after the block is finalized and durably stored.
//!
//! Transactions are applied atomically: [`ChainState::check_transaction`]
//! runs every precondition first, so a rejected transaction leaves the state
//! untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consensus::schedule;
use crate::crypto::keys::SigningPublicKey;
use crate::crypto::merkle;
use crate::genesis::ConsensusParams;
use crate::registry::{RegistryError, ValidatorRegistry};
use crate::transaction::{Transaction, TxKind, TxValidationError};
use crate::{Address, Hash};

/// Errors from applying a transaction to state.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("nonce too low: expected {expected}, got {got}")]
    NonceTooLow { expected: u64, got: u64 },
    #[error("nonce too high: expected {expected}, got {got}")]
    NonceTooHigh { expected: u64, got: u64 },
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },
    #[error("balance overflow")]
    BalanceOverflow,
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(#[from] TxValidationError),
}

impl StateError {
    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            StateError::NonceTooLow { .. } => "nonce_too_low",
            StateError::NonceTooHigh { .. } => "nonce_too_high",
            StateError::InsufficientBalance { .. } => "insufficient_balance",
            StateError::BalanceOverflow => "balance_overflow",
            StateError::Registry(RegistryError::UnknownValidator(_)) => "unknown_validator",
            StateError::Registry(RegistryError::DuplicateValidator(_)) => "duplicate_validator",
            StateError::Registry(RegistryError::InsufficientBalance { .. }) => {
                "insufficient_balance"
            }
            StateError::Registry(RegistryError::InsufficientStake { .. }) => "insufficient_stake",
            StateError::Registry(RegistryError::StakeOverflow) => "stake_overflow",
            StateError::InvalidTransaction(e) => e.reason_code(),
        }
    }
}

/// A single account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    /// Number of transactions applied from this account.
    pub nonce: u64,
}

/// Balances and nonces, committed into a Merkle root.
///
/// Accounts with zero balance and zero nonce are indistinguishable from
/// absent ones and are never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    accounts: BTreeMap<Address, Account>,
}

impl AccountState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The account at `address`, or an empty one.
    pub fn get(&self, address: &Address) -> Account {
        self.accounts.get(address).cloned().unwrap_or(Account {
            address: *address,
            balance: 0,
            nonce: 0,
        })
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn credit(&mut self, address: &Address, amount: u64) -> Result<(), StateError> {
        if amount == 0 {
            return Ok(());
        }
        let account = self.accounts.entry(*address).or_insert_with(|| Account {
            address: *address,
            balance: 0,
            nonce: 0,
        });
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow)?;
        Ok(())
    }

    pub fn debit(&mut self, address: &Address, amount: u64) -> Result<(), StateError> {
        let available = self.balance(address);
        if available < amount {
            return Err(StateError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        if let Some(account) = self.accounts.get_mut(address) {
            account.balance -= amount;
        }
        self.prune(address);
        Ok(())
    }

    fn bump_nonce(&mut self, address: &Address) {
        let account = self.accounts.entry(*address).or_insert_with(|| Account {
            address: *address,
            balance: 0,
            nonce: 0,
        });
        account.nonce += 1;
    }

    fn prune(&mut self, address: &Address) {
        if self
            .accounts
            .get(address)
            .is_some_and(|a| a.balance == 0 && a.nonce == 0)
        {
            self.accounts.remove(address);
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Sum of all balances.
    pub fn total_balance(&self) -> u128 {
        self.accounts.values().map(|a| a.balance as u128).sum()
    }

    /// Merkle root over `(address, balance, nonce)` leaves in address order.
    pub fn root(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .accounts
            .values()
            .map(|a| {
                let mut data = [0u8; 48];
                data[..32].copy_from_slice(&a.address.0);
                data[32..40].copy_from_slice(&a.balance.to_le_bytes());
                data[40..].copy_from_slice(&a.nonce.to_le_bytes());
                merkle::leaf_hash(&data)
            })
            .collect();
        merkle::merkle_root(&leaves)
    }
}

/// Everything a block's state transition reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    accounts: AccountState,
    registry: ValidatorRegistry,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accounts(&self) -> &AccountState {
        &self.accounts
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    /// Fund an account outside of any transaction (genesis allocation).
    pub fn fund_genesis_account(&mut self, address: &Address, amount: u64) -> Result<(), StateError> {
        self.accounts.credit(address, amount)
    }

    /// Register a validator outside of any transaction (genesis set).
    pub fn register_genesis_validator(
        &mut self,
        public_key: SigningPublicKey,
        stake: u64,
    ) -> Result<Address, StateError> {
        let address = public_key.address();
        self.registry.register(address, public_key, stake, 0)?;
        Ok(address)
    }

    /// Root of the account ledger.
    pub fn state_root(&self) -> Hash {
        self.accounts.root()
    }

    /// Root of the validator registry.
    pub fn registry_root(&self) -> Hash {
        self.registry.root()
    }

    /// Check every state-dependent precondition of `tx` without mutating.
    ///
    /// Stateless checks (signature, hash, fee floor) are
    /// [`Transaction::validate_structure`]'s job.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), StateError> {
        let expected = self.accounts.nonce(&tx.from) + 1;
        if tx.nonce < expected {
            return Err(StateError::NonceTooLow {
                expected,
                got: tx.nonce,
            });
        }
        if tx.nonce > expected {
            return Err(StateError::NonceTooHigh {
                expected,
                got: tx.nonce,
            });
        }

        let balance = self.accounts.balance(&tx.from);
        let debit = tx.debit().ok_or(TxValidationError::Overflow)?;

        match tx.kind {
            TxKind::Transfer => {
                if tx.to != tx.from {
                    self.accounts
                        .balance(&tx.to)
                        .checked_add(tx.value)
                        .ok_or(StateError::BalanceOverflow)?;
                }
            }
            TxKind::Bond => {
                if self.registry.contains(&tx.from) {
                    self.registry.check_stake_update(&tx.from, stake_delta(tx.value)?)?;
                }
            }
            TxKind::Unbond => {
                self.registry
                    .check_stake_update(&tx.from, -stake_delta(tx.value)?)?;
            }
            TxKind::Delegate => {
                self.registry
                    .check_delegate(&tx.to, tx.value, balance.saturating_sub(tx.fee))?;
            }
        }

        if balance < debit {
            return Err(StateError::InsufficientBalance {
                needed: debit,
                available: balance,
            });
        }
        Ok(())
    }

    /// Apply `tx`, crediting its fee to `proposer`. All-or-nothing.
    pub fn apply_transaction(&mut self, tx: &Transaction, proposer: &Address) -> Result<(), StateError> {
        self.check_transaction(tx)?;
        let debit = tx.debit().ok_or(TxValidationError::Overflow)?;
        self.check_credits(tx, proposer, debit)?;

        self.accounts.debit(&tx.from, debit)?;
        self.accounts.bump_nonce(&tx.from);

        match tx.kind {
            TxKind::Transfer => self.accounts.credit(&tx.to, tx.value)?,
            TxKind::Bond => {
                if self.registry.contains(&tx.from) {
                    self.registry.update_stake(&tx.from, stake_delta(tx.value)?)?;
                } else {
                    // Registration height is filled in by record_activity when
                    // the validator first participates.
                    self.registry
                        .register(tx.from, tx.public_key.clone(), tx.value, 0)?;
                }
            }
            TxKind::Unbond => {
                self.registry.update_stake(&tx.from, -stake_delta(tx.value)?)?;
                self.accounts.credit(&tx.from, tx.value)?;
            }
            TxKind::Delegate => {
                // Balance was already debited; the registry check passed above.
                self.registry.delegate(tx.from, &tx.to, tx.value, tx.value)?;
            }
        }

        self.accounts.credit(proposer, tx.fee)?;
        Ok(())
    }

    /// Every credit `tx` makes must fit once the sender has been debited,
    /// so that nothing can fail after the first write.
    fn check_credits(&self, tx: &Transaction, proposer: &Address, debit: u64) -> Result<(), StateError> {
        let mut after: BTreeMap<Address, u64> = BTreeMap::new();
        after.insert(tx.from, self.accounts.balance(&tx.from).saturating_sub(debit));
        let credits = [
            matches!(tx.kind, TxKind::Transfer).then_some((tx.to, tx.value)),
            matches!(tx.kind, TxKind::Unbond).then_some((tx.from, tx.value)),
            Some((*proposer, tx.fee)),
        ];
        for (address, amount) in credits.into_iter().flatten() {
            let balance = after
                .entry(address)
                .or_insert_with(|| self.accounts.balance(&address));
            *balance = balance
                .checked_add(amount)
                .ok_or(StateError::BalanceOverflow)?;
        }
        Ok(())
    }

    /// Liveness bookkeeping at the start of block `height`: the proposer and
    /// every signer of the previous block's certificate were active.
    pub fn begin_block(
        &mut self,
        height: u64,
        proposer: &Address,
        signers: &[Address],
    ) -> Result<(), StateError> {
        self.registry.record_activity(proposer, height)?;
        for signer in signers {
            self.registry.record_activity(signer, height)?;
        }
        Ok(())
    }

    /// At the last height of an epoch, penalize committee members that were
    /// not active within the inactivity window and reward the others.
    pub fn end_block(
        &mut self,
        height: u64,
        committee: &[Address],
        params: &ConsensusParams,
    ) -> Result<(), StateError> {
        if !schedule::is_epoch_end(height, params.epoch_length) {
            return Ok(());
        }
        for member in committee {
            let Some(record) = self.registry.get(member) else {
                continue;
            };
            let idle = height.saturating_sub(record.last_active_height);
            if idle >= params.inactivity_window {
                let reputation = self
                    .registry
                    .update_reputation(member, -params.inactivity_penalty)?;
                tracing::debug!(
                    validator = %member.short(),
                    idle,
                    reputation,
                    "inactive committee member penalized"
                );
            } else {
                self.registry
                    .update_reputation(member, params.participation_reward)?;
            }
        }
        Ok(())
    }
}

fn stake_delta(value: u64) -> Result<i64, StateError> {
    i64::try_from(value).map_err(|_| StateError::Registry(RegistryError::StakeOverflow))
}
