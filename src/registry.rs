//! Validator registry: stake, delegations, reputation and liveness.
//!
//! The registry lives inside [`crate::state::ChainState`], so every mutation
//! happens as part of a block's state transition and every node holds an
//! identical registry at every height. Validators are never removed; they
//! are deactivated, which drops their effective weight to zero while keeping
//! the record for auditing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::REPUTATION_BOUND;
use crate::crypto::keys::SigningPublicKey;
use crate::crypto::merkle;
use crate::{Address, Hash};

/// Errors from registry operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown validator {0}")]
    UnknownValidator(Address),
    #[error("validator {0} already registered")]
    DuplicateValidator(Address),
    #[error("insufficient balance to delegate: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },
    #[error("insufficient stake: need {needed}, have {available}")]
    InsufficientStake { needed: u64, available: u64 },
    #[error("stake overflow")]
    StakeOverflow,
}

/// A validator's on-chain record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub address: Address,
    pub public_key: SigningPublicKey,
    /// Self-bonded stake.
    pub stake: u64,
    /// Delegated amounts by delegator.
    pub delegations: BTreeMap<Address, u64>,
    /// Sum of `delegations`.
    pub delegated_stake: u64,
    /// Participation score, clamped to `[-REPUTATION_BOUND, REPUTATION_BOUND]`.
    pub reputation: i64,
    /// Last height at which this validator proposed or approved a block.
    pub last_active_height: u64,
    /// False once deactivated. Deactivation is permanent.
    pub active: bool,
}

impl ValidatorRecord {
    /// `stake + delegated_stake + clamp(reputation)`, saturating at zero.
    ///
    /// Zero for inactive validators and for validators without self-bonded
    /// stake, so delegations alone never make a validator eligible.
    pub fn effective_weight(&self) -> u64 {
        if !self.active || self.stake == 0 {
            return 0;
        }
        self.stake
            .saturating_add(self.delegated_stake)
            .saturating_add_signed(self.reputation.clamp(-REPUTATION_BOUND, REPUTATION_BOUND))
    }

    fn leaf(&self) -> Hash {
        let mut data = Vec::with_capacity(32 * 2 + 8 * 4 + 1);
        data.extend_from_slice(&self.address.0);
        data.extend_from_slice(&crate::hash_domain(
            b"tally.registry.pubkey",
            self.public_key.as_bytes(),
        ));
        data.extend_from_slice(&self.stake.to_le_bytes());
        data.extend_from_slice(&self.delegated_stake.to_le_bytes());
        data.extend_from_slice(&self.reputation.to_le_bytes());
        data.extend_from_slice(&self.last_active_height.to_le_bytes());
        data.push(self.active as u8);
        for (delegator, amount) in &self.delegations {
            data.extend_from_slice(&delegator.0);
            data.extend_from_slice(&amount.to_le_bytes());
        }
        merkle::leaf_hash(&data)
    }
}

/// All known validators, keyed and iterated by address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    validators: BTreeMap<Address, ValidatorRecord>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new validator with `initial_stake`, active as of `height`.
    ///
    /// `address` must be `public_key.address()`.
    pub fn register(
        &mut self,
        address: Address,
        public_key: SigningPublicKey,
        initial_stake: u64,
        height: u64,
    ) -> Result<(), RegistryError> {
        if self.validators.contains_key(&address) {
            return Err(RegistryError::DuplicateValidator(address));
        }
        debug_assert_eq!(public_key.address(), address);
        self.validators.insert(
            address,
            ValidatorRecord {
                address,
                public_key,
                stake: initial_stake,
                delegations: BTreeMap::new(),
                delegated_stake: 0,
                reputation: 0,
                last_active_height: height,
                active: true,
            },
        );
        Ok(())
    }

    /// Check that `update_stake(address, delta)` would succeed.
    pub fn check_stake_update(&self, address: &Address, delta: i64) -> Result<u64, RegistryError> {
        let record = self
            .validators
            .get(address)
            .ok_or(RegistryError::UnknownValidator(*address))?;
        if delta >= 0 {
            record
                .stake
                .checked_add(delta as u64)
                .ok_or(RegistryError::StakeOverflow)
        } else {
            let needed = delta.unsigned_abs();
            record
                .stake
                .checked_sub(needed)
                .ok_or(RegistryError::InsufficientStake {
                    needed,
                    available: record.stake,
                })
        }
    }

    /// Add `delta` (which may be negative) to a validator's own stake.
    /// Returns the new stake.
    pub fn update_stake(&mut self, address: &Address, delta: i64) -> Result<u64, RegistryError> {
        let new_stake = self.check_stake_update(address, delta)?;
        if let Some(record) = self.validators.get_mut(address) {
            record.stake = new_stake;
        }
        Ok(new_stake)
    }

    /// Check that `delegate(from, to, amount, available)` would succeed.
    pub fn check_delegate(
        &self,
        to: &Address,
        amount: u64,
        available: u64,
    ) -> Result<(), RegistryError> {
        let record = self
            .validators
            .get(to)
            .ok_or(RegistryError::UnknownValidator(*to))?;
        if available < amount {
            return Err(RegistryError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        record
            .delegated_stake
            .checked_add(amount)
            .ok_or(RegistryError::StakeOverflow)?;
        Ok(())
    }

    /// Delegate `amount` from `from` to validator `to`.
    ///
    /// `available` is the delegator's spendable balance; debiting it is the
    /// caller's job.
    pub fn delegate(
        &mut self,
        from: Address,
        to: &Address,
        amount: u64,
        available: u64,
    ) -> Result<(), RegistryError> {
        self.check_delegate(to, amount, available)?;
        if let Some(record) = self.validators.get_mut(to) {
            record.delegated_stake += amount;
            *record.delegations.entry(from).or_insert(0) += amount;
        }
        Ok(())
    }

    /// Adjust reputation, clamped to the bound. Reaching the lower bound
    /// deactivates the validator.
    pub fn update_reputation(&mut self, address: &Address, delta: i64) -> Result<i64, RegistryError> {
        let record = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::UnknownValidator(*address))?;
        record.reputation = record
            .reputation
            .saturating_add(delta)
            .clamp(-REPUTATION_BOUND, REPUTATION_BOUND);
        let reputation = record.reputation;
        if reputation <= -REPUTATION_BOUND && record.active {
            self.deactivate(address)?;
            tracing::info!(validator = %address.short(), "validator deactivated at reputation floor");
        }
        Ok(reputation)
    }

    /// Note that `address` participated at `height`. Never moves backwards.
    pub fn record_activity(&mut self, address: &Address, height: u64) -> Result<(), RegistryError> {
        let record = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::UnknownValidator(*address))?;
        record.last_active_height = record.last_active_height.max(height);
        Ok(())
    }

    /// Permanently deactivate a validator.
    pub fn deactivate(&mut self, address: &Address) -> Result<(), RegistryError> {
        let record = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::UnknownValidator(*address))?;
        record.active = false;
        Ok(())
    }

    /// Effective weight of a validator; zero if unknown.
    pub fn effective_weight(&self, address: &Address) -> u64 {
        self.validators
            .get(address)
            .map(ValidatorRecord::effective_weight)
            .unwrap_or(0)
    }

    pub fn get(&self, address: &Address) -> Option<&ValidatorRecord> {
        self.validators.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.validators.contains_key(address)
    }

    pub fn public_key(&self, address: &Address) -> Option<&SigningPublicKey> {
        self.validators.get(address).map(|r| &r.public_key)
    }

    /// Address-ordered snapshot of every record.
    pub fn list(&self) -> Vec<ValidatorRecord> {
        self.validators.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorRecord> {
        self.validators.values()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Merkle root over all records in address order.
    pub fn root(&self) -> Hash {
        let leaves: Vec<Hash> = self.validators.values().map(ValidatorRecord::leaf).collect();
        merkle::merkle_root(&leaves)
    }
}
