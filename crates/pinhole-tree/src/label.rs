//! tree geometry and label addressing
//!
//! a label is an integer in `0 .. 2^label_bits` naming one leaf of a
//! fixed-depth tree with fan-out `1 << bits_per_level`. the default
//! geometry (14-bit labels, 2 bits per level) gives a depth-7 tree of
//! 16384 leaves.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub label_bits: u8,
    pub bits_per_level: u8,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            label_bits: 14,
            bits_per_level: 2,
        }
    }
}

impl Geometry {
    pub fn new(label_bits: u8, bits_per_level: u8) -> Result<Self> {
        if bits_per_level == 0 || label_bits == 0 {
            return Err(TreeError::Geometry(
                "label_bits and bits_per_level must be nonzero".into(),
            ));
        }
        if label_bits % bits_per_level != 0 {
            return Err(TreeError::Geometry(format!(
                "label_bits {} not a multiple of bits_per_level {}",
                label_bits, bits_per_level
            )));
        }
        if label_bits > 32 {
            return Err(TreeError::Geometry(format!(
                "label_bits {} too large",
                label_bits
            )));
        }
        Ok(Self {
            label_bits,
            bits_per_level,
        })
    }

    /// children per inner node
    pub fn fan_out(&self) -> usize {
        1 << self.bits_per_level
    }

    /// number of levels between the leaves and the root
    pub fn depth(&self) -> usize {
        (self.label_bits / self.bits_per_level) as usize
    }

    /// total number of leaves
    pub fn capacity(&self) -> u64 {
        1u64 << self.label_bits
    }

    /// number of sibling hashes in a proof
    pub fn aux_len(&self) -> usize {
        self.depth() * (self.fan_out() - 1)
    }

    /// bind a raw value to this geometry, rejecting out-of-range values
    pub fn label(&self, value: u64) -> Result<Label> {
        if value >= self.capacity() {
            return Err(TreeError::LabelOutOfRange {
                label: value,
                bits: self.label_bits,
            });
        }
        Ok(Label {
            value,
            geometry: *self,
        })
    }
}

/// a leaf address validated against its geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    value: u64,
    geometry: Geometry,
}

impl Label {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// node index of this label's path at `level` (0 = leaf layer)
    pub fn index_at(&self, level: usize) -> usize {
        (self.value >> (self.geometry.bits_per_level as usize * level)) as usize
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}
