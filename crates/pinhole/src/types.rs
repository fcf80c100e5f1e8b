//! shared model types

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// delay to apply once the attempt counter reaches a threshold;
/// [`INFINITE_DELAY`] means locked until reset
pub type DelaySchedule = BTreeMap<u32, u32>;

/// delay value meaning "locked out until a reset"
pub const INFINITE_DELAY: u32 = u32::MAX;

/// schedule that locks the credential after `max_attempts` wrong tries
pub fn lockout_schedule(max_attempts: u32) -> DelaySchedule {
    let mut schedule = DelaySchedule::new();
    schedule.insert(max_attempts, INFINITE_DELAY);
    schedule
}

/// an owned secret that wipes itself on drop and never prints its bytes
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Secret {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Secret {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// one acceptable device state for a credential; a credential carrying
/// an empty policy list authenticates in any state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySetting {
    /// `None` matches the pre-sign-in state
    pub current_user: Option<String>,
}

/// per-call output of a successful rate limiter auth start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiometricsReply {
    pub server_nonce: Vec<u8>,
    pub iv: Vec<u8>,
    pub encrypted_he_secret: Vec<u8>,
}

/// secrets released by a successful credential check
#[derive(Debug, Clone)]
pub struct CheckedCredential {
    pub he_secret: Secret,
    pub reset_secret: Secret,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new(b"hunter2".to_vec());
        assert_eq!(format!("{:?}", secret), "Secret(7 bytes)");
    }

    #[test]
    fn test_secret_random_is_distinct() {
        assert_ne!(Secret::random(32), Secret::random(32));
    }

    #[test]
    fn test_lockout_schedule() {
        let schedule = lockout_schedule(5);
        assert_eq!(schedule.get(&5), Some(&INFINITE_DELAY));
        assert_eq!(schedule.len(), 1);
    }
}
