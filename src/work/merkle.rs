//! Merkle branch computation for stratum work units.
//!
//! Two tree shapes are in play. The coinbase branch uses consensus Merkle
//! rules (odd levels duplicate their last node) because miners climb it to
//! reproduce `hashMerkleRoot`. The auxiliary proof branch uses the
//! "stable" rules instead: a node without a sibling is promoted to the
//! next level unhashed, which keeps branches for the last position
//! well-defined regardless of how many transactions the block carries.

use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{Block, TxMerkleNode};

fn hash_pair(left: &sha256d::Hash, right: &sha256d::Hash) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(left.as_byte_array());
    engine.input(right.as_byte_array());
    sha256d::Hash::from_engine(engine)
}

/// Transaction hashes of a block, as raw sha256d values.
pub fn block_leaves(block: &Block) -> Vec<sha256d::Hash> {
    block
        .txdata
        .iter()
        .map(|tx| tx.compute_txid().to_raw_hash())
        .collect()
}

/// The Merkle branch authenticating `pos` under consensus rules
/// (odd-length levels duplicate their last node).
pub fn merkle_branch(leaves: &[sha256d::Hash], pos: usize) -> Vec<TxMerkleNode> {
    let mut branch = Vec::new();
    let mut level: Vec<sha256d::Hash> = leaves.to_vec();
    let mut idx = pos;
    while level.len() > 1 {
        let sibling = if idx ^ 1 < level.len() { level[idx ^ 1] } else { level[idx] };
        branch.push(TxMerkleNode::from_raw_hash(sibling));
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.last().unwrap_or(&pair[0])))
            .collect();
        idx >>= 1;
    }
    branch
}

/// The coinbase branch of a block: the Merkle branch for position 0.
pub fn block_merkle_branch(block: &Block) -> Vec<TxMerkleNode> {
    merkle_branch(&block_leaves(block), 0)
}

/// Climb a consensus Merkle branch from `leaf` at `pos` to the root.
pub fn merkle_root_from_branch(
    leaf: sha256d::Hash,
    branch: &[TxMerkleNode],
    pos: usize,
) -> TxMerkleNode {
    let mut hash = leaf;
    let mut idx = pos;
    for node in branch {
        let node = node.to_raw_hash();
        hash = if idx & 1 == 1 { hash_pair(&node, &hash) } else { hash_pair(&hash, &node) };
        idx >>= 1;
    }
    TxMerkleNode::from_raw_hash(hash)
}

/// The stable Merkle branch and root for `pos` over `leaves`.
///
/// A node at the end of an odd-length level has no sibling and is carried
/// up unhashed, so the branch contains one entry per level at which a
/// sibling actually exists.
pub fn stable_merkle_branch(
    leaves: &[sha256d::Hash],
    pos: usize,
) -> (Vec<sha256d::Hash>, sha256d::Hash) {
    let mut branch = Vec::new();
    let mut level: Vec<sha256d::Hash> = leaves.to_vec();
    let mut idx = pos;
    while level.len() > 1 {
        if idx ^ 1 < level.len() {
            branch.push(level[idx ^ 1]);
        }
        level = level
            .chunks(2)
            .map(|pair| if pair.len() == 2 { hash_pair(&pair[0], &pair[1]) } else { pair[0] })
            .collect();
        idx >>= 1;
    }
    (branch, level[0])
}

/// Climb a stable Merkle branch back to the root.
///
/// `num_leaves` is required to know at which levels the climbing node had
/// no sibling.
pub fn stable_merkle_root_from_branch(
    leaf: sha256d::Hash,
    branch: &[sha256d::Hash],
    pos: usize,
    num_leaves: usize,
) -> sha256d::Hash {
    let mut hash = leaf;
    let mut idx = pos;
    let mut size = num_leaves.max(1);
    let mut nodes = branch.iter();
    while size > 1 {
        if idx ^ 1 < size {
            match nodes.next() {
                Some(node) if idx & 1 == 1 => hash = hash_pair(node, &hash),
                Some(node) => hash = hash_pair(&hash, node),
                // Branch too short for the claimed tree shape.
                None => return sha256d::Hash::all_zeros(),
            }
        }
        idx >>= 1;
        size = size.div_ceil(2);
    }
    hash
}

/// Root of a single-entry Merkle map: sha256d(key ∥ value).
///
/// Multi-entry maps are not constructed here; [`crate::mergemine`]
/// rejects them before this is reached.
pub fn merkle_map_root(key: &[u8; 32], value: &sha256d::Hash) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(key);
    engine.input(value.as_byte_array());
    sha256d::Hash::from_engine(engine)
}
