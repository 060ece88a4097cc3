//! Account-model transactions.
//!
//! A transaction moves value between accounts or changes the sender's
//! validator bond and delegations. It is immutable once signed: `hash` is a
//! pure function of every other field, and `signature` is the sender's
//! Dilithium5 signature over that hash.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::{Address, Hash};

/// Content hash identifying a transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxHash(pub Hash);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", hex::encode(&self.0[..8]))
    }
}

/// What a transaction does with its `value`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Move `value` from `from` to `to`.
    #[default]
    Transfer,
    /// Lock `value` of the sender's balance as validator stake, registering
    /// the sender as a validator on first bond. `to` must equal `from`.
    Bond,
    /// Return `value` of the sender's stake to its balance. `to` must equal `from`.
    Unbond,
    /// Delegate `value` of the sender's balance to validator `to`.
    Delegate,
}

impl TxKind {
    fn tag(self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Bond => 1,
            TxKind::Unbond => 2,
            TxKind::Delegate => 3,
        }
    }
}

/// A signed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    /// Sender's public key; `from` must be its address.
    pub public_key: SigningPublicKey,
    pub to: Address,
    pub kind: TxKind,
    pub value: u64,
    pub fee: u64,
    /// Must equal the sender's current account nonce + 1.
    pub nonce: u64,
    /// Client timestamp in milliseconds. Informational only.
    pub timestamp: u64,
    /// Chain identifier (replay protection across networks).
    pub chain_id: Hash,
    pub signature: Signature,
    pub hash: TxHash,
}

impl Transaction {
    /// Build and sign a value transfer.
    pub fn transfer(
        keypair: &SigningKeypair,
        to: Address,
        value: u64,
        fee: u64,
        nonce: u64,
        chain_id: Hash,
    ) -> Self {
        Self::signed(keypair, TxKind::Transfer, to, value, fee, nonce, chain_id)
    }

    /// Build and sign a bond of `value` into the sender's validator stake.
    pub fn bond(keypair: &SigningKeypair, value: u64, fee: u64, nonce: u64, chain_id: Hash) -> Self {
        let me = keypair.address();
        Self::signed(keypair, TxKind::Bond, me, value, fee, nonce, chain_id)
    }

    /// Build and sign an unbond of `value` from the sender's validator stake.
    pub fn unbond(
        keypair: &SigningKeypair,
        value: u64,
        fee: u64,
        nonce: u64,
        chain_id: Hash,
    ) -> Self {
        let me = keypair.address();
        Self::signed(keypair, TxKind::Unbond, me, value, fee, nonce, chain_id)
    }

    /// Build and sign a delegation of `value` to `validator`.
    pub fn delegate(
        keypair: &SigningKeypair,
        validator: Address,
        value: u64,
        fee: u64,
        nonce: u64,
        chain_id: Hash,
    ) -> Self {
        Self::signed(keypair, TxKind::Delegate, validator, value, fee, nonce, chain_id)
    }

    fn signed(
        keypair: &SigningKeypair,
        kind: TxKind,
        to: Address,
        value: u64,
        fee: u64,
        nonce: u64,
        chain_id: Hash,
    ) -> Self {
        let mut tx = Transaction {
            from: keypair.address(),
            public_key: keypair.public.clone(),
            to,
            kind,
            value,
            fee,
            nonce,
            timestamp: crate::now_ms(),
            chain_id,
            signature: Signature::empty(),
            hash: TxHash([0u8; 32]),
        };
        tx.hash = tx.compute_hash();
        tx.signature = keypair.sign(&tx.hash.0);
        tx
    }

    /// Hash over every field except `signature` and `hash` itself.
    pub fn compute_hash(&self) -> TxHash {
        let mut hasher = blake3::Hasher::new_derive_key("tally.tx");
        hasher.update(&self.from.0);
        hasher.update(&(self.public_key.as_bytes().len() as u64).to_le_bytes());
        hasher.update(self.public_key.as_bytes());
        hasher.update(&self.to.0);
        hasher.update(&[self.kind.tag()]);
        hasher.update(&self.value.to_le_bytes());
        hasher.update(&self.fee.to_le_bytes());
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.chain_id);
        TxHash(*hasher.finalize().as_bytes())
    }

    /// Total amount leaving the sender's balance if applied.
    pub fn debit(&self) -> Option<u64> {
        match self.kind {
            TxKind::Unbond => Some(self.fee),
            _ => self.value.checked_add(self.fee),
        }
    }

    /// Stateless checks: key/address binding, hash, fee, kind rules, signature.
    ///
    /// Account-dependent checks (nonce, balance, registry) live in
    /// [`crate::state::ChainState::check_transaction`].
    pub fn validate_structure(&self, chain_id: &Hash) -> Result<(), TxValidationError> {
        if !crate::constant_time_eq(&self.chain_id, chain_id) {
            return Err(TxValidationError::WrongChain);
        }
        if !self.public_key.is_valid_size() || self.public_key.address() != self.from {
            return Err(TxValidationError::AddressMismatch);
        }
        if !crate::constant_time_eq(&self.hash.0, &self.compute_hash().0) {
            return Err(TxValidationError::HashMismatch);
        }
        if self.fee < crate::constants::MIN_TX_FEE {
            return Err(TxValidationError::FeeTooLow {
                fee: self.fee,
                min_fee: crate::constants::MIN_TX_FEE,
            });
        }
        match self.kind {
            TxKind::Transfer => {}
            TxKind::Bond | TxKind::Unbond => {
                if self.to != self.from {
                    return Err(TxValidationError::InvalidTarget);
                }
                if self.value == 0 {
                    return Err(TxValidationError::ZeroValue);
                }
            }
            TxKind::Delegate => {
                if self.value == 0 {
                    return Err(TxValidationError::ZeroValue);
                }
            }
        }
        if self.value.checked_add(self.fee).is_none() {
            return Err(TxValidationError::Overflow);
        }
        if !self.public_key.verify(&self.hash.0, &self.signature) {
            return Err(TxValidationError::InvalidSignature);
        }
        Ok(())
    }
}

/// Stateless transaction validation errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxValidationError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("sender address does not match public key")]
    AddressMismatch,
    #[error("transaction hash does not match contents")]
    HashMismatch,
    #[error("transaction is for another chain")]
    WrongChain,
    #[error("fee {fee} below minimum {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },
    #[error("value must be non-zero")]
    ZeroValue,
    #[error("bond and unbond must target the sender")]
    InvalidTarget,
    #[error("value + fee overflows")]
    Overflow,
}

impl TxValidationError {
    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TxValidationError::InvalidSignature => "invalid_signature",
            TxValidationError::AddressMismatch => "address_mismatch",
            TxValidationError::HashMismatch => "hash_mismatch",
            TxValidationError::WrongChain => "wrong_chain",
            TxValidationError::FeeTooLow { .. } => "fee_too_low",
            TxValidationError::ZeroValue => "zero_value",
            TxValidationError::InvalidTarget => "invalid_target",
            TxValidationError::Overflow => "overflow",
        }
    }
}
