//! secure element contract
//!
//! the element is the only trusted party. it holds the authoritative
//! root hash, enforces attempt counters and delay schedules, seals
//! leaf metadata so the disk can store but never read or forge it,
//! and keeps a bounded log of recent mutations so a stale disk can
//! catch back up.
//!
//! implementations:
//! - software: in-memory, contract-complete, for tests and platforms
//!   without the hardware

pub mod software;

use std::time::Duration;

use thiserror::Error;

use pinhole_tree::Hash;

use crate::types::{BiometricsReply, DelaySchedule, PolicySetting, Secret};

/// a leaf as issued by the element: opaque sealed metadata plus the
/// 32-byte mac that the hash tree commits to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedLeaf {
    pub mac: Hash,
    pub metadata: Vec<u8>,
}

/// one mutation in the element's replay log, recorded as the absolute
/// resulting state; `leaf` is `None` for a removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub label: u64,
    pub root: Hash,
    pub leaf: Option<SealedLeaf>,
}

/// answer to [`SecureElement::log_since`]; `entries` is `None` when
/// the asked-for root is no longer covered by the retained log
#[derive(Debug, Clone)]
pub struct LogReply {
    pub root: Hash,
    pub entries: Option<Vec<LogEntry>>,
}

/// per-operation outcome decided inside the element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    InvalidLeSecret,
    InvalidResetSecret,
    TooManyAttempts,
    PcrNotMatch,
    Expired,
}

/// result of an element operation
///
/// `root` is the element's root after the call; `leaf` carries the new
/// sealed leaf whenever the element mutated one (including failed
/// attempts that advanced the counter), and must be persisted by the
/// caller even on a non-`Ok` verdict.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub verdict: Verdict,
    pub root: Hash,
    pub leaf: Option<SealedLeaf>,
    pub he_secret: Option<Secret>,
    pub reset_secret: Option<Secret>,
    pub bio: Option<BiometricsReply>,
}

/// hard faults; every one of these surfaces as a hash tree integrity
/// error at the manager, after one replay-and-retry for `RootMismatch`
#[derive(Error, Debug)]
pub enum ElementError {
    #[error("supplied path does not match the element root")]
    RootMismatch,

    #[error("leaf metadata failed authentication")]
    InvalidMetadata,

    #[error("auth channel has no established pairing key")]
    UnknownChannel,

    #[error("element failure: {0}")]
    Internal(String),
}

/// the manager-facing contract of the secure element
///
/// methods take `&self`; implementations supply interior mutability so
/// one element can be shared between a manager and the platform code
/// that drives [`SecureElement::generate_pk`]. every mutating call
/// verifies the supplied sibling hashes against the authoritative root
/// before acting and appends to the replay log when it mutates state.
pub trait SecureElement: Send + Sync {
    /// create a leaf guarding `he_secret` behind `le_secret`
    #[allow(clippy::too_many_arguments)]
    fn insert_credential(
        &self,
        policies: &[PolicySetting],
        label: u64,
        aux: &[Hash],
        le_secret: &Secret,
        he_secret: &Secret,
        reset_secret: &Secret,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<Duration>,
    ) -> Result<AuthResult, ElementError>;

    /// test `le_secret`; success releases the he and reset secrets and
    /// clears the counter, failure advances it
    fn check_credential(
        &self,
        label: u64,
        aux: &[Hash],
        leaf: &SealedLeaf,
        le_secret: &Secret,
    ) -> Result<AuthResult, ElementError>;

    /// drop the leaf whose current mac is `mac`
    fn remove_credential(
        &self,
        label: u64,
        aux: &[Hash],
        mac: Hash,
    ) -> Result<AuthResult, ElementError>;

    /// clear the attempt counter; `strong_reset` also renews the
    /// expiration window. never releases the he_secret
    fn reset_credential(
        &self,
        label: u64,
        aux: &[Hash],
        leaf: &SealedLeaf,
        reset_secret: &Secret,
        strong_reset: bool,
    ) -> Result<AuthResult, ElementError>;

    /// create a rate limiter leaf bound to `auth_channel`; the guarded
    /// secret is generated inside the element and only ever leaves it
    /// encrypted to a session key
    fn insert_rate_limiter(
        &self,
        auth_channel: u8,
        policies: &[PolicySetting],
        label: u64,
        aux: &[Hash],
        reset_secret: &Secret,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<Duration>,
    ) -> Result<AuthResult, ElementError>;

    /// consume one rate limiter attempt; success returns a fresh
    /// `(server_nonce, iv, encrypted_he_secret)`, distinct per call.
    /// auth through a channel other than the one the leaf was created
    /// under fails like a wrong secret
    fn start_biometrics_auth(
        &self,
        auth_channel: u8,
        label: u64,
        aux: &[Hash],
        leaf: &SealedLeaf,
        client_nonce: &[u8],
    ) -> Result<AuthResult, ElementError>;

    /// current root plus the mutations after `disk_root`, oldest
    /// first; empty when already in sync, `None` when the log no
    /// longer reaches back to `disk_root`
    fn log_since(&self, disk_root: &Hash) -> Result<LogReply, ElementError>;

    /// attempt counter recorded in a sealed leaf
    fn wrong_attempts(&self, leaf: &SealedLeaf) -> Result<u32, ElementError>;

    /// seconds until the leaf accepts another attempt; 0 when ready,
    /// `u32::MAX` when locked until reset
    fn seconds_until_ready(&self, leaf: &SealedLeaf) -> Result<u32, ElementError>;

    /// establish the pairing secret for an auth channel and return the
    /// element's public key for it. called by the platform before any
    /// rate limiter is inserted on that channel
    fn generate_pk(&self, auth_channel: u8, client_pk: &[u8]) -> Result<Vec<u8>, ElementError>;
}
