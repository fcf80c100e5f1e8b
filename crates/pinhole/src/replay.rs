//! replay log reconciliation
//!
//! when the disk trails the element (a crash between an element call
//! and the disk write, or a restored older snapshot), the element's
//! retained log carries the absolute resulting state of each missed
//! mutation. applying them in order must walk the disk root exactly
//! onto the element root; anything else means the disk cannot be
//! trusted and the caller fails closed.

use thiserror::Error;
use tracing::debug;

use pinhole_tree::{Hash, HashTreeStore, TreeError};

use crate::element::LogEntry;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("tree error during replay: {0}")]
    Tree(#[from] TreeError),

    #[error("entry for label {label} produced root {got} instead of {want}")]
    Diverged {
        label: u64,
        got: String,
        want: String,
    },

    #[error("log exhausted before reaching the element root")]
    NotConverged,
}

/// apply log entries oldest-first until the store root equals
/// `element_root`; returns how many entries were applied
///
/// entries carry absolute resulting state, so reapplying one that is
/// already on disk is harmless
pub fn replay(
    store: &mut HashTreeStore,
    entries: &[LogEntry],
    element_root: &Hash,
) -> Result<usize, ReplayError> {
    let mut applied = 0;
    for entry in entries {
        if store.root() == *element_root {
            break;
        }
        let label = store.geometry().label(entry.label)?;
        match &entry.leaf {
            Some(leaf) => store.write_leaf(label, leaf.mac, &leaf.metadata)?,
            None => store.delete_leaf(label)?,
        }
        applied += 1;
        debug!("replayed entry for label {}", entry.label);

        if store.root() != entry.root {
            return Err(ReplayError::Diverged {
                label: entry.label,
                got: hex::encode(store.root()),
                want: hex::encode(entry.root),
            });
        }
    }

    if store.root() != *element_root {
        return Err(ReplayError::NotConverged);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use pinhole_tree::{Geometry, HashLayers, Label};
    use tempfile::tempdir;

    use crate::element::software::SoftwareElement;
    use crate::element::{AuthResult, SecureElement};
    use crate::types::{lockout_schedule, Secret};

    fn small() -> Geometry {
        Geometry::new(4, 2).unwrap()
    }

    struct Fixture {
        store: HashTreeStore,
        element: SoftwareElement,
        /// tracks the element-side tree, including mutations the
        /// store never saw
        shadow: HashLayers,
    }

    impl Fixture {
        fn new(dir: &Path) -> Self {
            Self {
                store: HashTreeStore::open(dir, small()).unwrap(),
                element: SoftwareElement::new(small()),
                shadow: HashLayers::empty(small()),
            }
        }

        fn label(&self, value: u64) -> Label {
            small().label(value).unwrap()
        }

        fn track(&mut self, value: u64, result: &AuthResult) {
            match &result.leaf {
                Some(leaf) => self.shadow.set_leaf(self.label(value), leaf.mac),
                None => self.shadow.clear_leaf(self.label(value)),
            }
            assert_eq!(self.shadow.root(), result.root);
        }

        /// element-side insert; `persist` false models the crash window
        fn insert(&mut self, value: u64, persist: bool) -> AuthResult {
            let aux = self.shadow.aux_hashes(self.label(value));
            let result = self
                .element
                .insert_credential(
                    &[],
                    value,
                    &aux,
                    &Secret::random(32),
                    &Secret::random(32),
                    &Secret::random(32),
                    &lockout_schedule(5),
                    None,
                )
                .unwrap();
            self.track(value, &result);
            if persist {
                let leaf = result.leaf.as_ref().unwrap();
                self.store
                    .write_leaf(self.label(value), leaf.mac, &leaf.metadata)
                    .unwrap();
            }
            result
        }

        fn remove(&mut self, value: u64, mac: Hash, persist: bool) {
            let aux = self.shadow.aux_hashes(self.label(value));
            let result = self.element.remove_credential(value, &aux, mac).unwrap();
            self.track(value, &result);
            if persist {
                self.store.delete_leaf(self.label(value)).unwrap();
            }
        }
    }

    #[test]
    fn test_replay_applies_lost_insert_and_remove() {
        let dir = tempdir().unwrap();
        let mut fx = Fixture::new(dir.path());

        let first = fx.insert(0, true);
        let lost = fx.insert(1, false);
        fx.remove(0, first.leaf.unwrap().mac, false);

        let reply = fx.element.log_since(&fx.store.root()).unwrap();
        let entries = reply.entries.unwrap();
        assert_eq!(entries.len(), 2);

        let applied = replay(&mut fx.store, &entries, &reply.root).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(fx.store.root(), reply.root);

        let restored = fx.store.read_leaf(fx.label(1)).unwrap().unwrap();
        assert_eq!(restored.metadata, lost.leaf.unwrap().metadata);
        assert!(fx.store.read_leaf(fx.label(0)).unwrap().is_none());
    }

    #[test]
    fn test_replay_rejects_diverged_entry() {
        let dir = tempdir().unwrap();
        let mut fx = Fixture::new(dir.path());
        fx.insert(0, true);
        fx.insert(1, false);

        let reply = fx.element.log_since(&fx.store.root()).unwrap();
        let mut entries = reply.entries.unwrap();
        entries[0].root = [0xab; 32];

        let err = replay(&mut fx.store, &entries, &reply.root).unwrap_err();
        assert!(matches!(err, ReplayError::Diverged { label: 1, .. }));
    }

    #[test]
    fn test_replay_requires_convergence() {
        let dir = tempdir().unwrap();
        let mut fx = Fixture::new(dir.path());
        fx.insert(0, true);
        fx.insert(1, false);
        fx.insert(2, false);

        let reply = fx.element.log_since(&fx.store.root()).unwrap();
        let mut entries = reply.entries.unwrap();
        entries.pop();

        let err = replay(&mut fx.store, &entries, &reply.root).unwrap_err();
        assert!(matches!(err, ReplayError::NotConverged));
    }
}
