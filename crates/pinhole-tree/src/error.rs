//! error types for the hash tree store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("record checksum mismatch")]
    Checksum,

    #[error("label {label} out of range for {bits}-bit tree")]
    LabelOutOfRange { label: u64, bits: u8 },

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("no readable generation for label {label}")]
    CorruptLeaf { label: u64 },

    #[error("auxiliary hashes malformed")]
    BadProof,

    #[error("tree state unknown, store is poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, TreeError>;
