//! Committee selection.
//!
//! The committee for an epoch is the top-K validators by effective weight,
//! ties broken by ascending address. Weights are snapshotted at selection
//! time and stay fixed for the whole epoch, so quorum arithmetic never reads
//! a registry that is being mutated by the blocks it is finalizing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::ValidatorRegistry;
use crate::{Address, Hash};

/// A committee member and its weight as of selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub address: Address,
    pub weight: u64,
}

/// The ordered committee for one epoch.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub epoch: u64,
    pub members: Vec<CommitteeMember>,
}

impl fmt::Debug for Committee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Committee")
            .field("epoch", &self.epoch)
            .field("size", &self.members.len())
            .field("total_weight", &self.total_weight())
            .finish()
    }
}

impl Committee {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m.address == *address)
    }

    /// Snapshotted weight of `address`, or `None` if not a member.
    pub fn weight_of(&self, address: &Address) -> Option<u64> {
        self.members
            .iter()
            .find(|m| m.address == *address)
            .map(|m| m.weight)
    }

    pub fn total_weight(&self) -> u128 {
        self.members.iter().map(|m| m.weight as u128).sum()
    }

    /// Minimum approving weight to finalize: ⌈2/3 × total⌉.
    pub fn quorum_weight(&self) -> u128 {
        quorum_weight(self.total_weight())
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.members.iter().map(|m| m.address).collect()
    }

    /// Commitment to membership, order, weights and epoch.
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(8 + self.members.len() * 40);
        data.extend_from_slice(&self.epoch.to_le_bytes());
        for m in &self.members {
            data.extend_from_slice(&m.address.0);
            data.extend_from_slice(&m.weight.to_le_bytes());
        }
        crate::hash_domain(b"tally.committee", &data)
    }
}

/// ⌈2/3 × total⌉, computed without rounding loss.
pub fn quorum_weight(total: u128) -> u128 {
    (2 * total).div_ceil(3)
}

/// Select the committee for `epoch` from a registry snapshot.
///
/// Validators with zero effective weight are never eligible. Fewer than
/// `size` eligible validators yields all of them. `size` is clamped to at
/// least 1.
pub fn select_committee(registry: &ValidatorRegistry, size: usize, epoch: u64) -> Committee {
    let mut candidates: Vec<CommitteeMember> = registry
        .iter()
        .map(|record| CommitteeMember {
            address: record.address,
            weight: record.effective_weight(),
        })
        .filter(|m| m.weight > 0)
        .collect();

    candidates.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.address.cmp(&b.address)));
    candidates.truncate(size.max(1));

    Committee {
        epoch,
        members: candidates,
    }
}
