//! Genesis configuration and consensus parameters.
//!
//! Every node on a network must load an identical `genesis.toml`: it fixes
//! the initial accounts, the initial validator set and the consensus
//! parameters, and its hash becomes the chain id.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::crypto::keys::SigningPublicKey;
use crate::state::{ChainState, StateError};
use crate::{Address, Hash};

/// Errors loading or building genesis.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid genesis: {0}")]
    Invalid(String),
    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Consensus parameters shared by every node on the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Heights per epoch; the committee is re-selected at each boundary.
    pub epoch_length: u64,
    /// Target committee size, clamped to `[1, MAX_COMMITTEE_SIZE]`.
    pub max_committee_size: usize,
    pub max_txs_per_block: usize,
    /// Minimum spacing between a block and its parent.
    pub block_interval_ms: u64,
    /// How long a round waits for quorum before it is abandoned.
    pub round_timeout_ms: u64,
    /// A committee member idle for this many heights at epoch end is penalized.
    pub inactivity_window: u64,
    pub inactivity_penalty: i64,
    pub participation_reward: i64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            epoch_length: constants::EPOCH_LENGTH,
            max_committee_size: constants::MAX_COMMITTEE_SIZE,
            max_txs_per_block: constants::MAX_TXS_PER_BLOCK,
            block_interval_ms: constants::BLOCK_INTERVAL_MS,
            round_timeout_ms: constants::ROUND_TIMEOUT_MS,
            inactivity_window: constants::EPOCH_LENGTH,
            inactivity_penalty: constants::INACTIVITY_PENALTY,
            participation_reward: constants::PARTICIPATION_REWARD,
        }
    }
}

impl ConsensusParams {
    /// Committee size after clamping.
    pub fn committee_size(&self) -> usize {
        self.max_committee_size.clamp(1, constants::MAX_COMMITTEE_SIZE)
    }

    fn validate(&self) -> Result<(), GenesisError> {
        if self.epoch_length == 0 {
            return Err(GenesisError::Invalid("epoch_length must be > 0".into()));
        }
        if self.max_txs_per_block == 0 {
            return Err(GenesisError::Invalid("max_txs_per_block must be > 0".into()));
        }
        if self.round_timeout_ms == 0 {
            return Err(GenesisError::Invalid("round_timeout_ms must be > 0".into()));
        }
        if self.inactivity_penalty < 0 || self.participation_reward < 0 {
            return Err(GenesisError::Invalid(
                "reputation adjustments must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// An initial account allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// Hex-encoded address.
    pub address: String,
    pub balance: u64,
}

/// An initial validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Hex-encoded Dilithium5 public key.
    pub public_key: String,
    pub stake: u64,
}

/// The genesis file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_name: String,
    /// Genesis block timestamp (ms since UNIX epoch).
    pub genesis_time: u64,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub params: ConsensusParams,
}

impl GenesisConfig {
    /// Load a genesis file.
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let contents = std::fs::read_to_string(path)?;
        let config: GenesisConfig =
            toml::from_str(&contents).map_err(|e| GenesisError::Parse(e.to_string()))?;
        config.params.validate()?;
        Ok(config)
    }

    /// Write this genesis as TOML.
    pub fn save(&self, path: &Path) -> Result<(), GenesisError> {
        let text = toml::to_string_pretty(self).map_err(|e| GenesisError::Parse(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Convenience constructor from in-memory keys and balances.
    pub fn new(
        chain_name: &str,
        genesis_time: u64,
        accounts: &[(Address, u64)],
        validators: &[(SigningPublicKey, u64)],
        params: ConsensusParams,
    ) -> Self {
        GenesisConfig {
            chain_name: chain_name.to_string(),
            genesis_time,
            accounts: accounts
                .iter()
                .map(|(address, balance)| GenesisAccount {
                    address: address.to_string(),
                    balance: *balance,
                })
                .collect(),
            validators: validators
                .iter()
                .map(|(pk, stake)| GenesisValidator {
                    public_key: hex::encode(pk.as_bytes()),
                    stake: *stake,
                })
                .collect(),
            params,
        }
    }

    /// Chain id: hash of the canonical encoding of the whole genesis.
    pub fn chain_id(&self) -> Result<Hash, GenesisError> {
        let bytes = crate::serialize(self).map_err(|e| GenesisError::Parse(e.to_string()))?;
        Ok(crate::hash_domain(b"tally.chain_id", &bytes))
    }

    /// Build the state as of height 0.
    pub fn build_state(&self) -> Result<ChainState, GenesisError> {
        self.params.validate()?;
        let mut state = ChainState::new();
        let mut supply: u128 = 0;

        for account in &self.accounts {
            let address: Address = account
                .address
                .parse()
                .map_err(|e| GenesisError::Invalid(format!("account {}: {}", account.address, e)))?;
            state.fund_genesis_account(&address, account.balance)?;
            supply += account.balance as u128;
        }

        let mut eligible = 0usize;
        for validator in &self.validators {
            let bytes = hex::decode(&validator.public_key)
                .map_err(|e| GenesisError::Invalid(format!("validator key: {}", e)))?;
            let public_key = SigningPublicKey::from_bytes(bytes)
                .ok_or_else(|| GenesisError::Invalid("validator key has wrong size".into()))?;
            state.register_genesis_validator(public_key, validator.stake)?;
            supply += validator.stake as u128;
            if validator.stake > 0 {
                eligible += 1;
            }
        }

        if eligible == 0 {
            return Err(GenesisError::Invalid(
                "at least one validator with non-zero stake is required".into(),
            ));
        }
        // Balances plus stake are conserved by every transaction, so a supply
        // that fits in u64 here can never overflow a single balance later.
        if supply > u64::MAX as u128 {
            return Err(GenesisError::Invalid("total supply exceeds u64".into()));
        }
        Ok(state)
    }
}
