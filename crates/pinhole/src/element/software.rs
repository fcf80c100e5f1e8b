//! software secure element - in-memory implementation
//!
//! contract-complete stand-in for the hardware element: authoritative
//! root, attempt counters, delay schedules, bounded replay log and
//! per-channel pairing secrets all live behind one lock. leaf
//! metadata is sealed with a random per-instance key, so nothing the
//! disk stores can be read back or forged from outside.
//!
//! no hardware security. useful for tests and development, NOT for
//! production rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::{
    aead::{Aead, KeyInit as AeadKeyInit},
    ChaCha20Poly1305, Nonce,
};
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use pinhole_tree::{root_from_path, Geometry, Hash, HashLayers, Label, EMPTY_LEAF};

use crate::element::{
    AuthResult, ElementError, LogEntry, LogReply, SealedLeaf, SecureElement, Verdict,
};
use crate::types::{BiometricsReply, DelaySchedule, PolicySetting, Secret, INFINITE_DELAY};

type HmacSha256 = Hmac<Sha256>;

/// matches the log depth of the hardware this models
pub const DEFAULT_LOG_CAPACITY: usize = 2;

/// plaintext of a sealed leaf; never leaves the element unencrypted
#[derive(Serialize, Deserialize)]
struct LeafData {
    label: u64,
    /// hash of the guarding secret; `None` for rate limiter leaves
    le_secret_hash: Option<[u8; 32]>,
    he_secret: Vec<u8>,
    reset_secret: Vec<u8>,
    attempts: u32,
    delay_schedule: DelaySchedule,
    policies: Vec<PolicySetting>,
    /// unix seconds of the last counted attempt
    last_attempt: u64,
    /// unix seconds after which the leaf stops authenticating
    expiration: Option<u64>,
    expiration_delay: Option<u64>,
    auth_channel: Option<u8>,
    /// binds a rate limiter leaf to its insertion channel
    channel_verifier: Option<[u8; 32]>,
}

impl Drop for LeafData {
    fn drop(&mut self) {
        self.he_secret.zeroize();
        self.reset_secret.zeroize();
    }
}

struct ElementState {
    geometry: Geometry,
    key: [u8; 32],
    root: Hash,
    /// root the tree had before the oldest retained log entry
    anchor_root: Hash,
    log: VecDeque<LogEntry>,
    log_capacity: usize,
    channels: HashMap<u8, [u8; 32]>,
    current_user: Option<String>,
    /// seconds added to the wall clock, for expiry and cooldown tests
    time_offset: u64,
}

/// software secure element; cloning shares the same state
#[derive(Clone)]
pub struct SoftwareElement {
    state: Arc<RwLock<ElementState>>,
}

impl SoftwareElement {
    pub fn new(geometry: Geometry) -> Self {
        let root = HashLayers::empty(geometry).root();
        Self {
            state: Arc::new(RwLock::new(ElementState {
                geometry,
                key: random_bytes(),
                root,
                anchor_root: root,
                log: VecDeque::new(),
                log_capacity: DEFAULT_LOG_CAPACITY,
                channels: HashMap::new(),
                current_user: None,
                time_offset: 0,
            })),
        }
    }

    /// change how many mutations the replay log retains
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.log_capacity = capacity;
            state.log.truncate(capacity);
        }
        self
    }

    /// device state hook: the signed-in user the policy settings
    /// compare against
    pub fn set_current_user(&self, user: Option<&str>) {
        if let Ok(mut state) = self.state.write() {
            state.current_user = user.map(str::to_owned);
        }
    }

    /// clock hook: shift the element's notion of now forward, so
    /// expiration and cooldown windows can elapse in tests
    pub fn advance_time(&self, delta: Duration) {
        if let Ok(mut state) = self.state.write() {
            state.time_offset = state.time_offset.saturating_add(delta.as_secs());
        }
    }

    /// authoritative root, as a test/debug convenience
    pub fn root_hash(&self) -> Hash {
        self.state.read().map(|s| s.root).unwrap_or(EMPTY_LEAF)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ElementState>, ElementError> {
        self.state
            .read()
            .map_err(|e| ElementError::Internal(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ElementState>, ElementError> {
        self.state
            .write()
            .map_err(|e| ElementError::Internal(e.to_string()))
    }
}

impl Default for SoftwareElement {
    fn default() -> Self {
        Self::new(Geometry::default())
    }
}

impl ElementState {
    fn now(&self) -> u64 {
        now_secs().saturating_add(self.time_offset)
    }

    fn bound(&self, label: u64) -> Result<Label, ElementError> {
        self.geometry
            .label(label)
            .map_err(|e| ElementError::Internal(e.to_string()))
    }

    /// check that a leaf hash plus aux reproduces the authoritative root
    fn verify_path(&self, label: u64, leaf_hash: Hash, aux: &[Hash]) -> Result<(), ElementError> {
        let bound = self.bound(label)?;
        let root = root_from_path(bound, leaf_hash, aux).map_err(|_| ElementError::RootMismatch)?;
        if root != self.root {
            return Err(ElementError::RootMismatch);
        }
        Ok(())
    }

    /// advance the root past a mutation and record it in the log
    fn commit(
        &mut self,
        label: u64,
        leaf: Option<SealedLeaf>,
        aux: &[Hash],
    ) -> Result<Hash, ElementError> {
        let bound = self.bound(label)?;
        let leaf_hash = leaf.as_ref().map(|l| l.mac).unwrap_or(EMPTY_LEAF);
        let root =
            root_from_path(bound, leaf_hash, aux).map_err(|_| ElementError::RootMismatch)?;
        self.root = root;
        self.push_log(LogEntry { label, root, leaf });
        Ok(root)
    }

    fn push_log(&mut self, entry: LogEntry) {
        if self.log_capacity == 0 {
            self.anchor_root = entry.root;
            return;
        }
        while self.log.len() >= self.log_capacity {
            if let Some(evicted) = self.log.pop_front() {
                self.anchor_root = evicted.root;
            }
        }
        self.log.push_back(entry);
    }

    fn seal(&self, data: &LeafData) -> Result<SealedLeaf, ElementError> {
        let mut plaintext =
            bincode::serialize(data).map_err(|e| ElementError::Internal(e.to_string()))?;
        let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(&self.key)
            .map_err(|e| ElementError::Internal(e.to_string()))?;
        let nonce: [u8; 12] = random_bytes();
        let sealed = cipher.encrypt(Nonce::from_slice(&nonce), plaintext.as_slice());
        plaintext.zeroize();
        let ciphertext = sealed.map_err(|e| ElementError::Internal(e.to_string()))?;

        let mut metadata = nonce.to_vec();
        metadata.extend(ciphertext);
        let mac = self.leaf_mac(data.label, &metadata);
        Ok(SealedLeaf { mac, metadata })
    }

    fn open_sealed(&self, metadata: &[u8]) -> Result<LeafData, ElementError> {
        if metadata.len() < 12 {
            return Err(ElementError::InvalidMetadata);
        }
        let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(&self.key)
            .map_err(|e| ElementError::Internal(e.to_string()))?;
        let mut plaintext = cipher
            .decrypt(Nonce::from_slice(&metadata[..12]), &metadata[12..])
            .map_err(|_| ElementError::InvalidMetadata)?;
        let data = bincode::deserialize(&plaintext);
        plaintext.zeroize();
        data.map_err(|_| ElementError::InvalidMetadata)
    }

    /// unseal a leaf presented for `label`, rejecting forged or
    /// relocated metadata
    fn unseal(&self, label: u64, leaf: &SealedLeaf) -> Result<LeafData, ElementError> {
        if self.leaf_mac(label, &leaf.metadata) != leaf.mac {
            return Err(ElementError::InvalidMetadata);
        }
        let data = self.open_sealed(&leaf.metadata)?;
        if data.label != label {
            return Err(ElementError::InvalidMetadata);
        }
        Ok(data)
    }

    /// unseal introspection metadata without knowing its label up front
    fn unseal_unbound(&self, leaf: &SealedLeaf) -> Result<LeafData, ElementError> {
        let data = self.open_sealed(&leaf.metadata)?;
        if self.leaf_mac(data.label, &leaf.metadata) != leaf.mac {
            return Err(ElementError::InvalidMetadata);
        }
        Ok(data)
    }

    fn leaf_mac(&self, label: u64, metadata: &[u8]) -> Hash {
        mac_bytes(
            &self.key,
            &[b"pinhole:leaf-mac:v1", &label.to_le_bytes(), metadata],
        )
    }

    /// rate limit, expiration and policy checks, in that order; `None`
    /// means the secret may be verified
    fn gate(&self, data: &LeafData) -> Option<Verdict> {
        let delay = current_delay(&data.delay_schedule, data.attempts);
        if delay == INFINITE_DELAY {
            return Some(Verdict::TooManyAttempts);
        }
        if delay > 0 && self.now() < data.last_attempt.saturating_add(delay as u64) {
            return Some(Verdict::TooManyAttempts);
        }
        if let Some(expiration) = data.expiration {
            if self.now() >= expiration {
                return Some(Verdict::Expired);
            }
        }
        if !policy_ok(&data.policies, self.current_user.as_deref()) {
            return Some(Verdict::PcrNotMatch);
        }
        None
    }

    fn pairing_secret(&self, auth_channel: u8) -> Result<[u8; 32], ElementError> {
        self.channels
            .get(&auth_channel)
            .copied()
            .ok_or(ElementError::UnknownChannel)
    }
}

impl SecureElement for SoftwareElement {
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
    ) -> Result<AuthResult, ElementError> {
        let mut state = self.write()?;
        state.verify_path(label, EMPTY_LEAF, aux)?;

        let data = LeafData {
            label,
            le_secret_hash: Some(le_hash(le_secret)),
            he_secret: he_secret.as_bytes().to_vec(),
            reset_secret: reset_secret.as_bytes().to_vec(),
            attempts: 0,
            delay_schedule: delay_schedule.clone(),
            policies: policies.to_vec(),
            last_attempt: 0,
            expiration: expiration_delay.map(|d| state.now().saturating_add(d.as_secs())),
            expiration_delay: expiration_delay.map(|d| d.as_secs()),
            auth_channel: None,
            channel_verifier: None,
        };
        let leaf = state.seal(&data)?;
        let root = state.commit(label, Some(leaf.clone()), aux)?;
        Ok(mutated(Verdict::Ok, root, leaf))
    }

    fn check_credential(
        &self,
        label: u64,
        aux: &[Hash],
        leaf: &SealedLeaf,
        le_secret: &Secret,
    ) -> Result<AuthResult, ElementError> {
        let mut state = self.write()?;
        let mut data = state.unseal(label, leaf)?;
        state.verify_path(label, leaf.mac, aux)?;

        if let Some(verdict) = state.gate(&data) {
            return Ok(bare(verdict, state.root));
        }

        if data.le_secret_hash != Some(le_hash(le_secret)) {
            data.attempts = data.attempts.saturating_add(1);
            data.last_attempt = state.now();
            let new_leaf = state.seal(&data)?;
            let root = state.commit(label, Some(new_leaf.clone()), aux)?;
            return Ok(mutated(Verdict::InvalidLeSecret, root, new_leaf));
        }

        data.attempts = 0;
        data.last_attempt = state.now();
        let he_secret = Secret::new(data.he_secret.clone());
        let reset_secret = Secret::new(data.reset_secret.clone());
        let new_leaf = state.seal(&data)?;
        let root = state.commit(label, Some(new_leaf.clone()), aux)?;

        let mut result = mutated(Verdict::Ok, root, new_leaf);
        result.he_secret = Some(he_secret);
        result.reset_secret = Some(reset_secret);
        Ok(result)
    }

    fn remove_credential(
        &self,
        label: u64,
        aux: &[Hash],
        mac: Hash,
    ) -> Result<AuthResult, ElementError> {
        let mut state = self.write()?;
        state.verify_path(label, mac, aux)?;
        let root = state.commit(label, None, aux)?;
        Ok(bare(Verdict::Ok, root))
    }

    fn reset_credential(
        &self,
        label: u64,
        aux: &[Hash],
        leaf: &SealedLeaf,
        reset_secret: &Secret,
        strong_reset: bool,
    ) -> Result<AuthResult, ElementError> {
        let mut state = self.write()?;
        let mut data = state.unseal(label, leaf)?;
        state.verify_path(label, leaf.mac, aux)?;

        if data.reset_secret != reset_secret.as_bytes() {
            // no counter movement, no log entry
            return Ok(bare(Verdict::InvalidResetSecret, state.root));
        }

        data.attempts = 0;
        data.last_attempt = 0;
        if strong_reset {
            if let Some(delay) = data.expiration_delay {
                data.expiration = Some(state.now().saturating_add(delay));
            }
        }
        let new_leaf = state.seal(&data)?;
        let root = state.commit(label, Some(new_leaf.clone()), aux)?;
        Ok(mutated(Verdict::Ok, root, new_leaf))
    }

    fn insert_rate_limiter(
        &self,
        auth_channel: u8,
        policies: &[PolicySetting],
        label: u64,
        aux: &[Hash],
        reset_secret: &Secret,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<Duration>,
    ) -> Result<AuthResult, ElementError> {
        let mut state = self.write()?;
        let pairing = state.pairing_secret(auth_channel)?;
        state.verify_path(label, EMPTY_LEAF, aux)?;

        let he_secret: [u8; 32] = random_bytes();
        let data = LeafData {
            label,
            le_secret_hash: None,
            he_secret: he_secret.to_vec(),
            reset_secret: reset_secret.as_bytes().to_vec(),
            attempts: 0,
            delay_schedule: delay_schedule.clone(),
            policies: policies.to_vec(),
            last_attempt: 0,
            expiration: expiration_delay.map(|d| state.now().saturating_add(d.as_secs())),
            expiration_delay: expiration_delay.map(|d| d.as_secs()),
            auth_channel: Some(auth_channel),
            channel_verifier: Some(channel_verifier(&pairing, label)),
        };
        let leaf = state.seal(&data)?;
        let root = state.commit(label, Some(leaf.clone()), aux)?;
        Ok(mutated(Verdict::Ok, root, leaf))
    }

    fn start_biometrics_auth(
        &self,
        auth_channel: u8,
        label: u64,
        aux: &[Hash],
        leaf: &SealedLeaf,
        client_nonce: &[u8],
    ) -> Result<AuthResult, ElementError> {
        let mut state = self.write()?;
        let mut data = state.unseal(label, leaf)?;
        state.verify_path(label, leaf.mac, aux)?;

        if let Some(verdict) = state.gate(&data) {
            return Ok(bare(verdict, state.root));
        }

        let pairing = state.pairing_secret(auth_channel)?;
        data.attempts = data.attempts.saturating_add(1);
        data.last_attempt = state.now();

        if data.channel_verifier != Some(channel_verifier(&pairing, label)) {
            // wrong channel spends an attempt like a wrong secret
            let new_leaf = state.seal(&data)?;
            let root = state.commit(label, Some(new_leaf.clone()), aux)?;
            return Ok(mutated(Verdict::InvalidLeSecret, root, new_leaf));
        }

        let server_nonce: [u8; 32] = random_bytes();
        let iv: [u8; 12] = random_bytes();
        let session_key = mac_bytes(
            &pairing,
            &[b"pinhole:bio-session:v1", client_nonce, &server_nonce],
        );
        let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(&session_key)
            .map_err(|e| ElementError::Internal(e.to_string()))?;
        let encrypted_he_secret = cipher
            .encrypt(Nonce::from_slice(&iv), data.he_secret.as_slice())
            .map_err(|e| ElementError::Internal(e.to_string()))?;

        let new_leaf = state.seal(&data)?;
        let root = state.commit(label, Some(new_leaf.clone()), aux)?;

        let mut result = mutated(Verdict::Ok, root, new_leaf);
        result.bio = Some(BiometricsReply {
            server_nonce: server_nonce.to_vec(),
            iv: iv.to_vec(),
            encrypted_he_secret,
        });
        Ok(result)
    }

    fn log_since(&self, disk_root: &Hash) -> Result<LogReply, ElementError> {
        let state = self.read()?;
        let entries = if *disk_root == state.root {
            Some(Vec::new())
        } else if *disk_root == state.anchor_root {
            Some(state.log.iter().cloned().collect())
        } else if let Some(pos) = state.log.iter().position(|e| e.root == *disk_root) {
            Some(state.log.iter().skip(pos + 1).cloned().collect())
        } else {
            None
        };
        Ok(LogReply {
            root: state.root,
            entries,
        })
    }

    fn wrong_attempts(&self, leaf: &SealedLeaf) -> Result<u32, ElementError> {
        let state = self.read()?;
        Ok(state.unseal_unbound(leaf)?.attempts)
    }

    fn seconds_until_ready(&self, leaf: &SealedLeaf) -> Result<u32, ElementError> {
        let state = self.read()?;
        let data = state.unseal_unbound(leaf)?;
        let delay = current_delay(&data.delay_schedule, data.attempts);
        if delay == INFINITE_DELAY {
            return Ok(INFINITE_DELAY);
        }
        let ready = data.last_attempt.saturating_add(delay as u64);
        Ok(ready.saturating_sub(state.now()).min(u32::MAX as u64) as u32)
    }

    fn generate_pk(&self, auth_channel: u8, client_pk: &[u8]) -> Result<Vec<u8>, ElementError> {
        let mut state = self.write()?;
        let pairing = mac_bytes(
            &state.key,
            &[b"pinhole:pairing:v1", &[auth_channel], client_pk],
        );
        state.channels.insert(auth_channel, pairing);
        let server_pk = mac_bytes(
            &state.key,
            &[b"pinhole:pairing-pk:v1", &[auth_channel], client_pk],
        );
        Ok(server_pk.to_vec())
    }
}

fn bare(verdict: Verdict, root: Hash) -> AuthResult {
    AuthResult {
        verdict,
        root,
        leaf: None,
        he_secret: None,
        reset_secret: None,
        bio: None,
    }
}

fn mutated(verdict: Verdict, root: Hash, leaf: SealedLeaf) -> AuthResult {
    AuthResult {
        leaf: Some(leaf),
        ..bare(verdict, root)
    }
}

/// delay for the current attempt count: the entry with the largest
/// threshold not above `attempts`, 0 below the first threshold
fn current_delay(schedule: &DelaySchedule, attempts: u32) -> u32 {
    schedule
        .range(..=attempts)
        .next_back()
        .map(|(_, delay)| *delay)
        .unwrap_or(0)
}

fn policy_ok(policies: &[PolicySetting], current_user: Option<&str>) -> bool {
    policies.is_empty()
        || policies
            .iter()
            .any(|p| p.current_user.as_deref() == current_user)
}

fn le_hash(secret: &Secret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"pinhole:le-secret:v1");
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn channel_verifier(pairing: &[u8; 32], label: u64) -> [u8; 32] {
    mac_bytes(pairing, &[b"pinhole:channel:v1", &label.to_le_bytes()])
}

fn mac_bytes(key: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let mut h: HmacSha256 = KeyInit::new_from_slice(key).expect("hmac accepts any key length");
    for d in data {
        Mac::update(&mut h, d);
    }
    h.finalize().into_bytes().into()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
