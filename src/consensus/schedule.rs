//! Epoch arithmetic and proposer rotation.
//!
//! The proposer is a pure function of the committee and `(height, round)`,
//! so there is no cursor to keep in sync between nodes. A new committee at
//! each epoch boundary resets the rotation implicitly.

use crate::consensus::committee::Committee;
use crate::Address;

/// Epoch containing `height`.
pub fn epoch_of(height: u64, epoch_length: u64) -> u64 {
    height / epoch_length.max(1)
}

/// True for the last height of an epoch; the committee for the next height
/// is selected from the registry as of the end of this block.
pub fn is_epoch_end(height: u64, epoch_length: u64) -> bool {
    (height + 1) % epoch_length.max(1) == 0
}

/// Proposer for `height` in `round`: `committee[(height + round) mod len]`.
pub fn proposer_for(committee: &Committee, height: u64, round: u32) -> Option<Address> {
    let len = committee.len() as u64;
    if len == 0 {
        return None;
    }
    let idx = ((height % len) + (round as u64 % len)) % len;
    committee.members.get(idx as usize).map(|m| m.address)
}

/// Round-0 proposer: `committee[height mod len]`.
pub fn current_proposer(committee: &Committee, height: u64) -> Option<Address> {
    proposer_for(committee, height, 0)
}
