//! credential manager
//!
//! front door of the crate. every operation runs the same loop: make
//! sure the disk agrees with the element (replaying the element's log
//! if the disk is stale), read the current leaf and sibling hashes,
//! call the element, persist whatever leaf the element handed back,
//! and confirm disk and element ended on the same root.
//!
//! the element is the only party whose state matters for security; the
//! manager's job is keeping the untrusted disk a faithful mirror and
//! failing closed the moment it cannot.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use pinhole_tree::{Geometry, Hash, HashTreeStore, Label, StoredLeaf, TreeError};

use crate::element::{AuthResult, ElementError, SealedLeaf, SecureElement, Verdict};
use crate::error::{ActionTag, CredError, ErrorKind, Result};
use crate::replay;
use crate::types::{BiometricsReply, CheckedCredential, DelaySchedule, PolicySetting, Secret};

/// exclusive handle on a store directory
///
/// the manager consumes it, and it cannot be cloned, so holding one is
/// the single-writer claim on the directory
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
}

impl StoreDir {
    /// claim `path`, creating the directory if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// outcome of one attempt at an operation, before the retry decision
enum OpError {
    /// the element rejected our path hashes; the disk went stale
    /// underneath us and a replay plus one retry is in order
    Stale,
    Fail(CredError),
}

impl OpError {
    fn into_cred(self) -> CredError {
        match self {
            // a second mismatch right after a successful replay means
            // the mirror cannot be trusted
            OpError::Stale => ErrorKind::HashTree.into(),
            OpError::Fail(e) => e,
        }
    }
}

impl From<ElementError> for OpError {
    fn from(e: ElementError) -> Self {
        match e {
            ElementError::RootMismatch => OpError::Stale,
            other => OpError::Fail(other.into()),
        }
    }
}

impl From<TreeError> for OpError {
    fn from(e: TreeError) -> Self {
        OpError::Fail(e.into())
    }
}

impl From<ErrorKind> for OpError {
    fn from(kind: ErrorKind) -> Self {
        OpError::Fail(kind.into())
    }
}

impl From<CredError> for OpError {
    fn from(e: CredError) -> Self {
        OpError::Fail(e)
    }
}

/// rate-limited credential store over an untrusted disk mirror and a
/// trusted element
pub struct CredentialManager<E: SecureElement> {
    element: E,
    store: HashTreeStore,
    /// set when the mirror is beyond repair; every later operation
    /// fails closed with a hash tree error
    poisoned: bool,
}

impl<E: SecureElement> CredentialManager<E> {
    /// open the store under `dir` with the default geometry
    pub fn open(element: E, dir: StoreDir) -> Result<Self> {
        Self::open_with_geometry(element, dir, Geometry::default())
    }

    /// open with an explicit geometry, which must match the element's
    pub fn open_with_geometry(element: E, dir: StoreDir, geometry: Geometry) -> Result<Self> {
        let store = HashTreeStore::open(dir.path(), geometry)?;
        info!("credential store opened at {}", dir.path().display());
        Ok(Self {
            element,
            store,
            poisoned: false,
        })
    }

    /// create a credential guarding `he_secret` behind `le_secret`;
    /// returns the assigned label
    #[allow(clippy::too_many_arguments)]
    pub fn insert_credential(
        &mut self,
        policies: &[PolicySetting],
        le_secret: &Secret,
        he_secret: &Secret,
        reset_secret: &Secret,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<Duration>,
    ) -> Result<u64> {
        self.with_retry(|m| {
            let label = m.store.free_label().ok_or(ErrorKind::NoFreeLabel)?;
            let aux = m.store.aux_hashes(label);
            let result = m.element.insert_credential(
                policies,
                label.value(),
                &aux,
                le_secret,
                he_secret,
                reset_secret,
                delay_schedule,
                expiration_delay,
            )?;
            m.persist(label, &result)?;
            require_ok(&result)?;
            debug!("inserted credential at label {label}");
            Ok(label.value())
        })
    }

    /// try `le_secret` against the credential at `label`
    ///
    /// a wrong secret spends an attempt; success resets the counter and
    /// releases the guarded secrets
    pub fn check_credential(&mut self, label: u64, le_secret: &Secret) -> Result<CheckedCredential> {
        self.with_retry(|m| {
            let (label, proof_leaf, aux) = m.lookup(label)?;
            let result = m
                .element
                .check_credential(label.value(), &aux, &proof_leaf, le_secret)?;
            // failed attempts move the counter, so the new leaf lands
            // on disk whatever the verdict says
            m.persist(label, &result)?;
            require_ok(&result)?;
            Ok(CheckedCredential {
                he_secret: released(result.he_secret)?,
                reset_secret: released(result.reset_secret)?,
            })
        })
    }

    /// clear the attempt counter with `reset_secret`; works while the
    /// credential is locked out. `strong_reset` also renews the
    /// expiration window
    pub fn reset_credential(
        &mut self,
        label: u64,
        reset_secret: &Secret,
        strong_reset: bool,
    ) -> Result<()> {
        self.with_retry(|m| {
            let (label, proof_leaf, aux) = m.lookup(label)?;
            let result = m.element.reset_credential(
                label.value(),
                &aux,
                &proof_leaf,
                reset_secret,
                strong_reset,
            )?;
            m.persist(label, &result)?;
            require_ok(&result)?;
            debug!("reset credential at label {label}");
            Ok(())
        })
    }

    /// drop the credential at `label` and free its slot
    pub fn remove_credential(&mut self, label: u64) -> Result<()> {
        self.with_retry(|m| {
            let (label, proof_leaf, aux) = m.lookup(label)?;
            let result = m
                .element
                .remove_credential(label.value(), &aux, proof_leaf.mac)?;
            m.persist(label, &result)?;
            require_ok(&result)?;
            debug!("removed credential at label {label}");
            Ok(())
        })
    }

    /// create a biometrics rate limiter on `auth_channel`; returns the
    /// assigned label
    pub fn insert_rate_limiter(
        &mut self,
        auth_channel: u8,
        policies: &[PolicySetting],
        reset_secret: &Secret,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<Duration>,
    ) -> Result<u64> {
        self.with_retry(|m| {
            let label = m.store.free_label().ok_or(ErrorKind::NoFreeLabel)?;
            let aux = m.store.aux_hashes(label);
            let result = m.element.insert_rate_limiter(
                auth_channel,
                policies,
                label.value(),
                &aux,
                reset_secret,
                delay_schedule,
                expiration_delay,
            )?;
            m.persist(label, &result)?;
            require_ok(&result)?;
            debug!("inserted rate limiter at label {label}");
            Ok(label.value())
        })
    }

    /// spend one rate limiter attempt and hand back the session
    /// ciphertext for the guarded secret
    ///
    /// every call moves the counter, success included, so the caller
    /// pays an attempt even when the downstream match later fails
    pub fn start_biometrics_auth(
        &mut self,
        auth_channel: u8,
        label: u64,
        client_nonce: &[u8],
    ) -> Result<BiometricsReply> {
        self.with_retry(|m| {
            let (label, proof_leaf, aux) = m.lookup(label)?;
            let result = m.element.start_biometrics_auth(
                auth_channel,
                label.value(),
                &aux,
                &proof_leaf,
                client_nonce,
            )?;
            m.persist(label, &result)?;
            require_ok(&result)?;
            result
                .bio
                .ok_or_else(|| OpError::Fail(ErrorKind::HashTree.into()))
        })
    }

    /// wrong attempts recorded against `label` since the last reset
    pub fn wrong_auth_attempts(&mut self, label: u64) -> Result<u32> {
        self.ensure_synced()?;
        let leaf = self.read_sealed(label)?;
        Ok(self.element.wrong_attempts(&leaf)?)
    }

    /// seconds until `label` accepts another attempt; 0 when ready,
    /// `u32::MAX` when locked until reset
    pub fn delay_in_seconds(&mut self, label: u64) -> Result<u32> {
        self.ensure_synced()?;
        let leaf = self.read_sealed(label)?;
        Ok(self.element.seconds_until_ready(&leaf)?)
    }

    /// run `attempt` against a synced mirror; on a stale-path fault,
    /// replay the element log and retry exactly once
    fn with_retry<T>(
        &mut self,
        mut attempt: impl FnMut(&mut Self) -> std::result::Result<T, OpError>,
    ) -> Result<T> {
        self.ensure_synced()?;
        match attempt(self) {
            Err(OpError::Stale) => {
                warn!("element root moved underneath an operation, resyncing for one retry");
                self.ensure_synced()?;
                attempt(self).map_err(OpError::into_cred)
            }
            other => other.map_err(OpError::into_cred),
        }
    }

    /// fail closed if poisoned, otherwise bring the disk up to the
    /// element root via the replay log
    fn ensure_synced(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(ErrorKind::HashTree.into());
        }
        if self.store.is_poisoned() {
            error!("hash tree store is unrecoverable, failing closed");
            self.poisoned = true;
            return Err(ErrorKind::HashTree.into());
        }

        let disk_root = self.store.root();
        let reply = self.element.log_since(&disk_root)?;
        if reply.root == disk_root {
            return Ok(());
        }

        warn!(
            "disk root {} trails element root {}, replaying log",
            hex::encode(&disk_root[..8]),
            hex::encode(&reply.root[..8]),
        );
        let entries = match reply.entries {
            Some(entries) => entries,
            None => {
                error!("element log no longer covers the disk state, failing closed");
                self.poisoned = true;
                return Err(ErrorKind::HashTree.into());
            }
        };
        match replay::replay(&mut self.store, &entries, &reply.root) {
            Ok(applied) => {
                info!("disk caught up after replaying {applied} log entries");
                Ok(())
            }
            Err(e) => {
                error!("log replay failed: {e}, failing closed");
                self.poisoned = true;
                Err(ErrorKind::HashTree.into())
            }
        }
    }

    /// resolve `label`, read its leaf and sibling hashes; absent or
    /// out-of-range labels both report as invalid
    fn lookup(&self, label: u64) -> std::result::Result<(Label, SealedLeaf, Vec<Hash>), OpError> {
        let label = self.store.geometry().label(label)?;
        let proof = self.store.proof(label)?;
        let leaf = proof.leaf.ok_or(ErrorKind::InvalidLabel)?;
        Ok((label, sealed(leaf), proof.aux))
    }

    fn read_sealed(&self, label: u64) -> Result<SealedLeaf> {
        let label = self.store.geometry().label(label)?;
        let leaf = self
            .store
            .read_leaf(label)?
            .ok_or(ErrorKind::InvalidLabel)?;
        Ok(sealed(leaf))
    }

    /// mirror the element's result onto disk and confirm both sides
    /// ended on the same root
    fn persist(&mut self, label: Label, result: &AuthResult) -> std::result::Result<(), OpError> {
        if let Some(leaf) = &result.leaf {
            self.store.write_leaf(label, leaf.mac, &leaf.metadata)?;
        } else if result.root != self.store.root() {
            // a leafless new root is a removal
            self.store.delete_leaf(label)?;
        } else {
            return Ok(());
        }

        if self.store.root() != result.root {
            error!("disk root diverged from element right after a write, failing closed");
            self.poisoned = true;
            return Err(ErrorKind::HashTree.into());
        }
        Ok(())
    }
}

fn sealed(leaf: StoredLeaf) -> SealedLeaf {
    SealedLeaf {
        mac: leaf.mac,
        metadata: leaf.metadata,
    }
}

/// map a non-ok verdict to the caller-facing error with its action tags
fn require_ok(result: &AuthResult) -> std::result::Result<(), OpError> {
    let err = match result.verdict {
        Verdict::Ok => return Ok(()),
        Verdict::InvalidLeSecret => {
            CredError::new(ErrorKind::InvalidLeSecret).with_action(ActionTag::IncorrectAuth)
        }
        Verdict::InvalidResetSecret => {
            CredError::new(ErrorKind::InvalidResetSecret).with_action(ActionTag::IncorrectAuth)
        }
        Verdict::TooManyAttempts => {
            CredError::new(ErrorKind::TooManyAttempts).with_action(ActionTag::TpmLockout)
        }
        Verdict::PcrNotMatch => {
            CredError::new(ErrorKind::PcrNotMatch).with_action(ActionTag::DeviceMismatch)
        }
        Verdict::Expired => CredError::new(ErrorKind::Expired),
    };
    Err(err.into())
}

/// a secret the element promised on an ok verdict; its absence is an
/// element contract violation
fn released(secret: Option<Secret>) -> std::result::Result<Secret, OpError> {
    secret.ok_or_else(|| OpError::Fail(ErrorKind::HashTree.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::software::SoftwareElement;
    use crate::types::lockout_schedule;
    use tempfile::tempdir;

    fn small() -> Geometry {
        Geometry::new(4, 2).unwrap()
    }

    fn manager(dir: &std::path::Path) -> CredentialManager<SoftwareElement> {
        let element = SoftwareElement::new(small());
        CredentialManager::open_with_geometry(element, StoreDir::open(dir).unwrap(), small())
            .unwrap()
    }

    #[test]
    fn test_insert_then_check_releases_secrets() {
        let dir = tempdir().unwrap();
        let mut manager = manager(dir.path());

        let le = Secret::from(&b"1234"[..]);
        let he = Secret::random(32);
        let reset = Secret::random(32);
        let label = manager
            .insert_credential(&[], &le, &he, &reset, &lockout_schedule(5), None)
            .unwrap();

        let checked = manager.check_credential(label, &le).unwrap();
        assert_eq!(checked.he_secret, he);
        assert_eq!(checked.reset_secret, reset);
    }

    #[test]
    fn test_unknown_labels_are_invalid() {
        let dir = tempdir().unwrap();
        let mut manager = manager(dir.path());
        let le = Secret::from(&b"1234"[..]);

        // in range but never inserted
        let err = manager.check_credential(3, &le).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLabel);

        // outside the geometry entirely
        let err = manager.check_credential(1 << 20, &le).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLabel);
    }

    #[test]
    fn test_full_tree_reports_no_free_label() {
        let dir = tempdir().unwrap();
        let mut manager = manager(dir.path());
        let le = Secret::from(&b"1234"[..]);
        let schedule = lockout_schedule(5);

        for _ in 0..small().capacity() {
            manager
                .insert_credential(&[], &le, &Secret::random(32), &Secret::random(32), &schedule, None)
                .unwrap();
        }
        let err = manager
            .insert_credential(&[], &le, &Secret::random(32), &Secret::random(32), &schedule, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoFreeLabel);
    }
}
