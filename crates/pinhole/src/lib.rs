//! # pinhole
//!
//! rate-limited storage for low-entropy credentials (pins, biometric
//! rate limiters) guarded by a small trusted secure element.
//!
//! bulk state lives on an untrusted disk as a fixed-geometry hash
//! tree; the element holds only the root hash, the sealing keys, and a
//! short log of recent mutations. guessing budgets survive anything
//! the disk does: rollback, tampering, or deletion can deny service
//! but never mint extra attempts.
//!
//! ## architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  CredentialManager   │  sync → proof → element call → persist
//! └──────┬────────┬──────┘
//!        │        │
//!        ▼        ▼
//! ┌────────────┐ ┌──────────────────┐
//! │ hash tree  │ │  secure element  │
//! │ on disk    │ │  (trusted)       │
//! │            │ │                  │
//! │ leaf macs  │ │ root hash        │
//! │ sealed     │ │ attempt counters │
//! │ metadata   │ │ delay schedules  │
//! │ leafcache  │ │ replay log       │
//! └────────────┘ └──────────────────┘
//! ```
//!
//! ## security properties
//!
//! - attempt counters and delay schedules enforced inside the element,
//!   never on the host
//! - leaf metadata sealed by the element; the disk stores ciphertext it
//!   cannot read or forge
//! - every element call proves the current disk state against the
//!   authoritative root hash
//! - a stale disk (crash, restored snapshot) heals from the element's
//!   bounded replay log; beyond the log, everything fails closed
//!
//! ## usage
//!
//! ```rust,ignore
//! use pinhole::{lockout_schedule, CredentialManager, Secret, SoftwareElement, StoreDir};
//! use pinhole_tree::Geometry;
//!
//! let element = SoftwareElement::new(Geometry::default());
//! let dir = StoreDir::open("/var/lib/pinhole")?;
//! let mut manager = CredentialManager::open(element, dir)?;
//!
//! let label = manager.insert_credential(
//!     &[],
//!     &Secret::from(&b"1234"[..]),
//!     &Secret::random(32),
//!     &Secret::random(32),
//!     &lockout_schedule(5),
//!     None,
//! )?;
//!
//! let checked = manager.check_credential(label, &Secret::from(&b"1234"[..]))?;
//! // checked.he_secret now unwraps the user's real key material
//! ```

pub mod element;
pub mod error;
pub mod manager;
pub mod replay;
pub mod types;

pub use element::software::{SoftwareElement, DEFAULT_LOG_CAPACITY};
pub use element::{
    AuthResult, ElementError, LogEntry, LogReply, SealedLeaf, SecureElement, Verdict,
};
pub use error::{ActionTag, CredError, ErrorKind, Result};
pub use manager::{CredentialManager, StoreDir};
pub use replay::ReplayError;
pub use types::{
    lockout_schedule, BiometricsReply, CheckedCredential, DelaySchedule, PolicySetting, Secret,
    INFINITE_DELAY,
};

pub use pinhole_tree::{Geometry, Hash};
