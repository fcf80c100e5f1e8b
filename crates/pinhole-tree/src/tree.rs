//! dense in-memory hash layers
//!
//! every level of the tree is kept as a flat vector of node hashes,
//! leaves at layer 0 and the root alone in the top layer. unused
//! leaves hash as [`EMPTY_LEAF`]. writes update only the path from the
//! touched leaf to the root.

use crate::error::Result;
use crate::label::{Geometry, Label};
use crate::{hash_children, root_from_path, Hash, EMPTY_LEAF};

pub struct HashLayers {
    geometry: Geometry,
    layers: Vec<Vec<Hash>>,
}

impl HashLayers {
    /// all leaves unused
    pub fn empty(geometry: Geometry) -> Self {
        Self::from_leaves(geometry, std::iter::empty())
    }

    /// build from `(label value, leaf hash)` pairs; unlisted leaves are empty
    pub fn from_leaves(geometry: Geometry, leaves: impl Iterator<Item = (u64, Hash)>) -> Self {
        let capacity = geometry.capacity() as usize;
        let mut bottom = vec![EMPTY_LEAF; capacity];
        for (value, hash) in leaves {
            bottom[value as usize] = hash;
        }

        let fan_out = geometry.fan_out();
        let mut layers = vec![bottom];
        for level in 1..=geometry.depth() {
            let below = &layers[level - 1];
            let nodes: Vec<Hash> = below
                .chunks(fan_out)
                .map(hash_children)
                .collect();
            layers.push(nodes);
        }
        Self { geometry, layers }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn root(&self) -> Hash {
        self.layers[self.geometry.depth()][0]
    }

    pub fn leaf_hash(&self, label: Label) -> Hash {
        self.layers[0][label.index_at(0)]
    }

    /// set one leaf hash and rehash its path to the root
    pub fn set_leaf(&mut self, label: Label, hash: Hash) {
        let fan_out = self.geometry.fan_out();
        self.layers[0][label.index_at(0)] = hash;
        for level in 1..=self.geometry.depth() {
            let parent = label.index_at(level);
            let base = parent * fan_out;
            let node = hash_children(&self.layers[level - 1][base..base + fan_out]);
            self.layers[level][parent] = node;
        }
    }

    pub fn clear_leaf(&mut self, label: Label) {
        self.set_leaf(label, EMPTY_LEAF);
    }

    /// sibling hashes along the label's path, leaf layer first, each
    /// level's siblings in child-index order
    pub fn aux_hashes(&self, label: Label) -> Vec<Hash> {
        let fan_out = self.geometry.fan_out();
        let mut aux = Vec::with_capacity(self.geometry.aux_len());
        for level in 0..self.geometry.depth() {
            let index = label.index_at(level);
            let base = (index / fan_out) * fan_out;
            for i in base..base + fan_out {
                if i != index {
                    aux.push(self.layers[level][i]);
                }
            }
        }
        aux
    }

    /// check that a leaf hash plus its aux hashes reproduce the root
    pub fn verify_path(&self, label: Label, leaf_hash: Hash) -> Result<bool> {
        let aux = self.aux_hashes(label);
        Ok(root_from_path(label, leaf_hash, &aux)? == self.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Geometry {
        Geometry::new(4, 2).unwrap()
    }

    #[test]
    fn test_empty_root_deterministic() {
        let a = HashLayers::empty(small());
        let b = HashLayers::empty(small());
        assert_eq!(a.root(), b.root());
        assert_ne!(a.root(), EMPTY_LEAF);
    }

    #[test]
    fn test_set_and_clear_leaf() {
        let g = small();
        let mut layers = HashLayers::empty(g);
        let empty_root = layers.root();

        let label = g.label(7).unwrap();
        layers.set_leaf(label, [0xaa; 32]);
        assert_ne!(layers.root(), empty_root);
        assert_eq!(layers.leaf_hash(label), [0xaa; 32]);

        layers.clear_leaf(label);
        assert_eq!(layers.root(), empty_root);
    }

    #[test]
    fn test_from_leaves_matches_incremental() {
        let g = small();
        let mut incremental = HashLayers::empty(g);
        incremental.set_leaf(g.label(1).unwrap(), [0x11; 32]);
        incremental.set_leaf(g.label(14).unwrap(), [0x22; 32]);

        let rebuilt =
            HashLayers::from_leaves(g, [(1u64, [0x11; 32]), (14u64, [0x22; 32])].into_iter());
        assert_eq!(incremental.root(), rebuilt.root());
    }

    #[test]
    fn test_aux_hashes_prove_path() {
        let g = small();
        let mut layers = HashLayers::empty(g);
        for v in [0u64, 3, 9, 15] {
            layers.set_leaf(g.label(v).unwrap(), [v as u8 + 1; 32]);
        }

        for v in 0..g.capacity() {
            let label = g.label(v).unwrap();
            let aux = layers.aux_hashes(label);
            assert_eq!(aux.len(), g.aux_len());
            let root = root_from_path(label, layers.leaf_hash(label), &aux).unwrap();
            assert_eq!(root, layers.root());
        }
    }

    #[test]
    fn test_verify_path_rejects_wrong_leaf() {
        let g = small();
        let mut layers = HashLayers::empty(g);
        let label = g.label(2).unwrap();
        layers.set_leaf(label, [0x33; 32]);

        assert!(layers.verify_path(label, [0x33; 32]).unwrap());
        assert!(!layers.verify_path(label, [0x44; 32]).unwrap());
    }
}
