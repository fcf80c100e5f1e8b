//! on-disk leaf store
//!
//! layout under the store directory:
//!
//! ```text
//! <dir>/
//! ├── leafcache       derived index, rebuilt when lost
//! └── <label>/<n>     one checksummed record per generation
//! ```
//!
//! the disk is untrusted. every record carries a checksum; a label
//! keeps its previous generation until the next write completes, so a
//! torn write falls back to the older record on reload. the cache is
//! never authoritative: losing it costs a directory scan, nothing
//! else. only a label directory whose every generation is unreadable
//! (with no cache to vouch for its hash) leaves the true root
//! unknowable and marks the whole store poisoned.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, TreeError};
use crate::label::{Geometry, Label};
use crate::tree::HashLayers;
use crate::Hash;

const CACHE_FILE: &str = "leafcache";
const CACHE_TMP: &str = "leafcache.tmp";
const RECORD_DOMAIN: &[u8] = b"pinhole:record:v1";

/// one generation of a leaf as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeafRecord {
    label: u64,
    mac: Hash,
    metadata: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CacheEntry {
    generation: u64,
    mac: Hash,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    geometry: Geometry,
    entries: Vec<(u64, CacheEntry)>,
}

/// latest readable generation of a label
#[derive(Debug, Clone)]
pub struct StoredLeaf {
    pub mac: Hash,
    pub metadata: Vec<u8>,
    pub generation: u64,
}

/// leaf record (if the label is used) plus its sibling hashes
#[derive(Debug, Clone)]
pub struct Proof {
    pub leaf: Option<StoredLeaf>,
    pub aux: Vec<Hash>,
}

enum ScanOutcome {
    Empty,
    Leaf(u64, LeafRecord),
    Corrupt,
}

pub struct HashTreeStore {
    dir: PathBuf,
    geometry: Geometry,
    layers: HashLayers,
    index: BTreeMap<u64, CacheEntry>,
    poisoned: bool,
}

impl HashTreeStore {
    /// open or create a store, loading the leaf cache or rebuilding it
    /// from the label directories when it is missing or unreadable
    pub fn open(dir: impl Into<PathBuf>, geometry: Geometry) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        if let Some(index) = Self::load_cache(&dir, geometry) {
            debug!("loaded leaf cache: {} labels", index.len());
            return Ok(Self::assemble(dir, geometry, index, false));
        }
        Self::rebuild(dir, geometry)
    }

    fn assemble(
        dir: PathBuf,
        geometry: Geometry,
        index: BTreeMap<u64, CacheEntry>,
        poisoned: bool,
    ) -> Self {
        let layers =
            HashLayers::from_leaves(geometry, index.iter().map(|(value, e)| (*value, e.mac)));
        Self {
            dir,
            geometry,
            layers,
            index,
            poisoned,
        }
    }

    fn load_cache(dir: &Path, geometry: Geometry) -> Option<BTreeMap<u64, CacheEntry>> {
        let bytes = match fs::read(dir.join(CACHE_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("leaf cache unreadable: {}", e);
                return None;
            }
        };
        let cache: CacheFile = match decode_record(&bytes) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("leaf cache corrupt, rebuilding: {}", e);
                return None;
            }
        };
        if cache.geometry != geometry {
            warn!("leaf cache geometry mismatch, rebuilding");
            return None;
        }
        if cache
            .entries
            .iter()
            .any(|(value, _)| *value >= geometry.capacity())
        {
            warn!("leaf cache holds out-of-range labels, rebuilding");
            return None;
        }
        Some(cache.entries.into_iter().collect())
    }

    /// scan every label directory, newest readable generation wins
    fn rebuild(dir: PathBuf, geometry: Geometry) -> Result<Self> {
        let mut index = BTreeMap::new();
        let mut poisoned = false;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            // only numeric directories are label state; the cache file
            // and anything stray is skipped
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let value = match name.to_str().and_then(|s| s.parse::<u64>().ok()) {
                Some(value) => value,
                None => {
                    warn!("ignoring stray directory {:?} in the store", name);
                    continue;
                }
            };
            if value >= geometry.capacity() {
                warn!("label {} out of range for the configured geometry", value);
                poisoned = true;
                continue;
            }
            match Self::newest_readable(&entry.path(), value)? {
                ScanOutcome::Leaf(generation, record) => {
                    index.insert(
                        value,
                        CacheEntry {
                            generation,
                            mac: record.mac,
                        },
                    );
                }
                ScanOutcome::Empty => {
                    debug!("label {} has no generations, treating as unused", value);
                }
                ScanOutcome::Corrupt => {
                    warn!("label {} has no readable generation", value);
                    poisoned = true;
                }
            }
        }

        let store = Self::assemble(dir, geometry, index, poisoned);
        if poisoned {
            warn!("store poisoned: true root unknowable without the leaf cache");
        } else {
            info!(
                "rebuilt leaf cache from {} labels, root {}",
                store.index.len(),
                hex::encode(store.root())
            );
            if let Err(e) = store.save_cache() {
                warn!("could not persist rebuilt leaf cache: {}", e);
            }
        }
        Ok(store)
    }

    fn newest_readable(label_dir: &Path, value: u64) -> Result<ScanOutcome> {
        let mut generations = Vec::new();
        for entry in fs::read_dir(label_dir)? {
            let entry = entry?;
            if let Some(generation) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u64>().ok())
            {
                generations.push(generation);
            }
        }
        if generations.is_empty() {
            return Ok(ScanOutcome::Empty);
        }
        generations.sort_unstable_by(|a, b| b.cmp(a));

        for generation in generations {
            let bytes = match fs::read(label_dir.join(generation.to_string())) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            match decode_record::<LeafRecord>(&bytes) {
                Ok(record) if record.label == value => {
                    return Ok(ScanOutcome::Leaf(generation, record));
                }
                _ => {
                    debug!("label {} generation {} unreadable", value, generation);
                }
            }
        }
        Ok(ScanOutcome::Corrupt)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn root(&self) -> Hash {
        self.layers.root()
    }

    /// true when the store cannot vouch for its own root
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// lowest unused label, `None` when the tree is full
    pub fn free_label(&self) -> Option<Label> {
        let mut candidate = 0u64;
        for &used in self.index.keys() {
            if used == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        if candidate >= self.geometry.capacity() {
            return None;
        }
        self.geometry.label(candidate).ok()
    }

    /// write a new generation for the label, then update the cache
    pub fn write_leaf(&mut self, label: Label, mac: Hash, metadata: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let value = label.value();
        let generation = self
            .index
            .get(&value)
            .map(|e| e.generation + 1)
            .unwrap_or(0);

        let label_dir = self.label_dir(value);
        fs::create_dir_all(&label_dir)?;
        let record = LeafRecord {
            label: value,
            mac,
            metadata: metadata.to_vec(),
        };
        write_file_durable(&label_dir.join(generation.to_string()), &encode_record(&record)?)?;

        self.index.insert(value, CacheEntry { generation, mac });
        self.layers.set_leaf(label, mac);
        self.save_cache()?;
        self.sweep_generations(&label_dir, generation);
        debug!("wrote label {} generation {}", value, generation);
        Ok(())
    }

    /// latest readable generation, `None` for an unused label
    pub fn read_leaf(&self, label: Label) -> Result<Option<StoredLeaf>> {
        self.ensure_usable()?;
        let value = label.value();
        let entry = match self.index.get(&value) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        let path = self.label_dir(value).join(entry.generation.to_string());
        let bytes =
            fs::read(&path).map_err(|_| TreeError::CorruptLeaf { label: value })?;
        let record: LeafRecord =
            decode_record(&bytes).map_err(|_| TreeError::CorruptLeaf { label: value })?;
        if record.label != value || record.mac != entry.mac {
            return Err(TreeError::CorruptLeaf { label: value });
        }
        Ok(Some(StoredLeaf {
            mac: record.mac,
            metadata: record.metadata,
            generation: entry.generation,
        }))
    }

    /// leaf record plus sibling hashes for the secure element
    pub fn proof(&self, label: Label) -> Result<Proof> {
        let leaf = self.read_leaf(label)?;
        Ok(Proof {
            leaf,
            aux: self.layers.aux_hashes(label),
        })
    }

    /// tombstone a label; idempotent
    pub fn delete_leaf(&mut self, label: Label) -> Result<()> {
        self.ensure_usable()?;
        let value = label.value();
        match fs::remove_dir_all(self.label_dir(value)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if self.index.remove(&value).is_some() {
            self.layers.clear_leaf(label);
            self.save_cache()?;
        }
        debug!("removed label {}", value);
        Ok(())
    }

    pub fn aux_hashes(&self, label: Label) -> Vec<Hash> {
        self.layers.aux_hashes(label)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(TreeError::Poisoned);
        }
        Ok(())
    }

    fn label_dir(&self, value: u64) -> PathBuf {
        self.dir.join(value.to_string())
    }

    fn save_cache(&self) -> Result<()> {
        let cache = CacheFile {
            geometry: self.geometry,
            entries: self.index.iter().map(|(value, e)| (*value, *e)).collect(),
        };
        let tmp = self.dir.join(CACHE_TMP);
        write_file_durable(&tmp, &encode_record(&cache)?)?;
        fs::rename(&tmp, self.dir.join(CACHE_FILE))?;
        Ok(())
    }

    /// best-effort removal of generations older than the previous one
    fn sweep_generations(&self, label_dir: &Path, newest: u64) {
        let keep_from = newest.saturating_sub(1);
        let entries = match fs::read_dir(label_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if let Some(generation) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u64>().ok())
            {
                if generation < keep_from {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = bincode::serialize(value)?;
    let mut hasher = Sha256::new();
    hasher.update(RECORD_DOMAIN);
    hasher.update(&bytes);
    bytes.extend_from_slice(&hasher.finalize());
    Ok(bytes)
}

fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < 32 {
        return Err(TreeError::Checksum);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 32);
    let mut hasher = Sha256::new();
    hasher.update(RECORD_DOMAIN);
    hasher.update(payload);
    if hasher.finalize().as_slice() != checksum {
        return Err(TreeError::Checksum);
    }
    Ok(bincode::deserialize(payload)?)
}

fn write_file_durable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root_from_path;
    use tempfile::tempdir;

    fn small() -> Geometry {
        Geometry::new(4, 2).unwrap()
    }

    fn open_small(dir: &Path) -> HashTreeStore {
        HashTreeStore::open(dir, small()).unwrap()
    }

    fn corrupt_file(path: &Path) {
        fs::write(path, b"not a record").unwrap();
    }

    #[test]
    fn test_fresh_store_has_empty_root() {
        let dir = tempdir().unwrap();
        let store = open_small(dir.path());
        let empty = HashLayers::empty(small()).root();
        assert_eq!(store.root(), empty);
        assert_eq!(store.free_label().unwrap().value(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = open_small(dir.path());
        let label = small().label(3).unwrap();

        store.write_leaf(label, [0x11; 32], b"meta-a").unwrap();
        let leaf = store.read_leaf(label).unwrap().unwrap();
        assert_eq!(leaf.mac, [0x11; 32]);
        assert_eq!(leaf.metadata, b"meta-a");
        assert_eq!(leaf.generation, 0);

        store.write_leaf(label, [0x22; 32], b"meta-b").unwrap();
        let leaf = store.read_leaf(label).unwrap().unwrap();
        assert_eq!(leaf.mac, [0x22; 32]);
        assert_eq!(leaf.generation, 1);
    }

    #[test]
    fn test_reopen_preserves_root() {
        let dir = tempdir().unwrap();
        let root = {
            let mut store = open_small(dir.path());
            store
                .write_leaf(small().label(1).unwrap(), [0xaa; 32], b"x")
                .unwrap();
            store
                .write_leaf(small().label(9).unwrap(), [0xbb; 32], b"y")
                .unwrap();
            store.root()
        };
        let store = open_small(dir.path());
        assert_eq!(store.root(), root);
    }

    #[test]
    fn test_cache_rebuild_after_loss() {
        let dir = tempdir().unwrap();
        let root = {
            let mut store = open_small(dir.path());
            store
                .write_leaf(small().label(5).unwrap(), [0xcc; 32], b"z")
                .unwrap();
            store.root()
        };

        fs::remove_file(dir.path().join(CACHE_FILE)).unwrap();
        let store = open_small(dir.path());
        assert!(!store.is_poisoned());
        assert_eq!(store.root(), root);
        assert!(dir.path().join(CACHE_FILE).exists());
    }

    #[test]
    fn test_cache_rebuild_after_corruption() {
        let dir = tempdir().unwrap();
        let root = {
            let mut store = open_small(dir.path());
            store
                .write_leaf(small().label(2).unwrap(), [0xdd; 32], b"w")
                .unwrap();
            store.root()
        };

        corrupt_file(&dir.path().join(CACHE_FILE));
        let store = open_small(dir.path());
        assert_eq!(store.root(), root);
    }

    #[test]
    fn test_newest_readable_generation_wins() {
        let dir = tempdir().unwrap();
        let label = small().label(7).unwrap();
        let old_root = {
            let mut store = open_small(dir.path());
            store.write_leaf(label, [0x01; 32], b"old").unwrap();
            let old_root = store.root();
            store.write_leaf(label, [0x02; 32], b"new").unwrap();
            old_root
        };

        // torn newest write: fall back to the previous generation
        corrupt_file(&dir.path().join("7").join("1"));
        fs::remove_file(dir.path().join(CACHE_FILE)).unwrap();

        let store = open_small(dir.path());
        assert!(!store.is_poisoned());
        assert_eq!(store.root(), old_root);
        assert_eq!(store.read_leaf(label).unwrap().unwrap().metadata, b"old");
    }

    #[test]
    fn test_all_generations_corrupt_poisons_store() {
        let dir = tempdir().unwrap();
        {
            let mut store = open_small(dir.path());
            let label = small().label(4).unwrap();
            store.write_leaf(label, [0x03; 32], b"only").unwrap();
        }

        corrupt_file(&dir.path().join("4").join("0"));
        fs::remove_file(dir.path().join(CACHE_FILE)).unwrap();

        let mut store = open_small(dir.path());
        assert!(store.is_poisoned());
        let label = small().label(4).unwrap();
        assert!(matches!(
            store.read_leaf(label),
            Err(TreeError::Poisoned)
        ));
        assert!(matches!(
            store.write_leaf(label, [0x04; 32], b"nope"),
            Err(TreeError::Poisoned)
        ));
    }

    #[test]
    fn test_corrupt_label_with_intact_cache_is_local() {
        let dir = tempdir().unwrap();
        let (root, good, bad) = {
            let mut store = open_small(dir.path());
            let good = small().label(1).unwrap();
            let bad = small().label(2).unwrap();
            store.write_leaf(good, [0x05; 32], b"good").unwrap();
            store.write_leaf(bad, [0x06; 32], b"bad").unwrap();
            (store.root(), good, bad)
        };

        corrupt_file(&dir.path().join("2").join("0"));

        let store = open_small(dir.path());
        assert!(!store.is_poisoned());
        assert_eq!(store.root(), root);
        assert_eq!(store.read_leaf(good).unwrap().unwrap().metadata, b"good");
        assert!(matches!(
            store.read_leaf(bad),
            Err(TreeError::CorruptLeaf { label: 2 })
        ));
    }

    #[test]
    fn test_delete_leaf_tombstones_and_reuses() {
        let dir = tempdir().unwrap();
        let mut store = open_small(dir.path());
        let empty_root = store.root();
        let label = small().label(0).unwrap();

        store.write_leaf(label, [0x07; 32], b"gone soon").unwrap();
        store.delete_leaf(label).unwrap();
        assert_eq!(store.root(), empty_root);
        assert!(store.read_leaf(label).unwrap().is_none());
        assert_eq!(store.free_label().unwrap().value(), 0);

        // idempotent
        store.delete_leaf(label).unwrap();
    }

    #[test]
    fn test_free_label_finds_first_gap() {
        let dir = tempdir().unwrap();
        let mut store = open_small(dir.path());
        for v in 0..3 {
            let label = small().label(v).unwrap();
            store.write_leaf(label, [v as u8; 32], b"m").unwrap();
        }
        assert_eq!(store.free_label().unwrap().value(), 3);

        store.delete_leaf(small().label(1).unwrap()).unwrap();
        assert_eq!(store.free_label().unwrap().value(), 1);
    }

    #[test]
    fn test_free_label_none_when_full() {
        let dir = tempdir().unwrap();
        let mut store = open_small(dir.path());
        for v in 0..small().capacity() {
            let label = small().label(v).unwrap();
            store.write_leaf(label, [0x08; 32], b"m").unwrap();
        }
        assert!(store.free_label().is_none());
    }

    #[test]
    fn test_proof_reproduces_root() {
        let dir = tempdir().unwrap();
        let mut store = open_small(dir.path());
        let label = small().label(11).unwrap();
        store.write_leaf(label, [0x09; 32], b"p").unwrap();

        let proof = store.proof(label).unwrap();
        let leaf = proof.leaf.unwrap();
        assert_eq!(
            root_from_path(label, leaf.mac, &proof.aux).unwrap(),
            store.root()
        );

        let unused = small().label(12).unwrap();
        let proof = store.proof(unused).unwrap();
        assert!(proof.leaf.is_none());
        assert_eq!(
            root_from_path(unused, crate::EMPTY_LEAF, &proof.aux).unwrap(),
            store.root()
        );
    }

    #[test]
    fn test_sweep_keeps_two_generations() {
        let dir = tempdir().unwrap();
        let mut store = open_small(dir.path());
        let label = small().label(6).unwrap();
        for n in 0..4u8 {
            store.write_leaf(label, [n; 32], b"gen").unwrap();
        }

        let label_dir = dir.path().join("6");
        let mut names: Vec<String> = fs::read_dir(&label_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["2", "3"]);
    }
}
