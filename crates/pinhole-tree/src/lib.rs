//! label-addressed merkle hash tree with on-disk generation files
//!
//! fixed-depth, fixed fan-out tree whose leaves are named by integer
//! labels. leaf payloads live on untrusted disk as checksummed
//! per-generation records; the tree itself only ever commits to the
//! 32-byte hash (mac) of each leaf. the root is what a secure element
//! compares against its own authoritative copy.

pub mod error;
pub mod label;
pub mod store;
pub mod tree;

pub use error::{Result, TreeError};
pub use label::{Geometry, Label};
pub use store::{HashTreeStore, Proof, StoredLeaf};
pub use tree::HashLayers;

use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

/// hash of an unused leaf
pub const EMPTY_LEAF: Hash = [0; 32];

const NODE_DOMAIN: &[u8] = b"pinhole:node:v1";

/// inner node hash over the concatenated child hashes
pub fn hash_children(children: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(NODE_DOMAIN);
    for child in children {
        hasher.update(child);
    }
    hasher.finalize().into()
}

/// recompute the root from one leaf hash and its sibling hashes,
/// leaf layer first, each level's siblings in child-index order
pub fn root_from_path(label: Label, leaf_hash: Hash, aux: &[Hash]) -> Result<Hash> {
    let geometry = label.geometry();
    if aux.len() != geometry.aux_len() {
        return Err(TreeError::BadProof);
    }

    let fan_out = geometry.fan_out();
    let mut aux_iter = aux.iter();
    let mut node = leaf_hash;
    for level in 0..geometry.depth() {
        let position = label.index_at(level) % fan_out;
        let mut children = Vec::with_capacity(fan_out);
        for i in 0..fan_out {
            if i == position {
                children.push(node);
            } else {
                children.push(*aux_iter.next().ok_or(TreeError::BadProof)?);
            }
        }
        node = hash_children(&children);
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_from_path_rejects_short_aux() {
        let g = Geometry::new(4, 2).unwrap();
        let label = g.label(0).unwrap();
        assert!(matches!(
            root_from_path(label, EMPTY_LEAF, &[EMPTY_LEAF; 3]),
            Err(TreeError::BadProof)
        ));
    }

    #[test]
    fn test_hash_children_is_order_sensitive() {
        let a = hash_children(&[[1; 32], [2; 32]]);
        let b = hash_children(&[[2; 32], [1; 32]]);
        assert_ne!(a, b);
    }
}
