//! Binary Merkle accumulator used for transaction, account and registry roots.
//!
//! Leaves are padded with zero hashes to the next power of two. Interior
//! nodes are domain-separated BLAKE3 over the two children, so a leaf can
//! never be confused with an interior node.

use crate::Hash;

/// Root of the empty tree.
pub const EMPTY_ROOT: Hash = [0u8; 32];

/// Hash a serialized leaf into its tree position.
pub fn leaf_hash(data: &[u8]) -> Hash {
    crate::hash_domain(b"tally.merkle.leaf", data)
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    crate::hash_domain(b"tally.merkle.node", &buf)
}

/// Compute the Merkle root over already-hashed leaves.
///
/// An empty set yields [`EMPTY_ROOT`]; a single leaf is its own root.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    if leaves.len() == 1 {
        return leaves[0];
    }

    let n = leaves.len().next_power_of_two();
    let mut layer: Vec<Hash> = leaves.to_vec();
    layer.resize(n, [0u8; 32]);

    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| node_hash(&pair[0], &pair[1]))
            .collect();
    }
    layer[0]
}
