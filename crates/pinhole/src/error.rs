//! error taxonomy
//!
//! every recoverable outcome is a value of the closed [`ErrorKind`]
//! set; advisory [`ActionTag`]s ride along so callers can react
//! (surface a lockout, prompt for re-auth) without matching on
//! message strings.

use thiserror::Error;

use crate::element::ElementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("incorrect low-entropy secret")]
    InvalidLeSecret,

    #[error("incorrect reset secret")]
    InvalidResetSecret,

    #[error("too many incorrect attempts")]
    TooManyAttempts,

    #[error("device state does not match credential policy")]
    PcrNotMatch,

    #[error("label does not name a stored credential")]
    InvalidLabel,

    #[error("no free label in the hash tree")]
    NoFreeLabel,

    #[error("credential expired")]
    Expired,

    #[error("hash tree integrity failure")]
    HashTree,
}

/// advisory hints attached to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTag {
    /// the element enforces a lockout until a reset
    TpmLockout,
    /// the supplied secret was wrong
    IncorrectAuth,
    /// the device is not in a state the credential accepts
    DeviceMismatch,
}

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct CredError {
    kind: ErrorKind,
    actions: Vec<ActionTag>,
}

impl CredError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, tag: ActionTag) -> Self {
        if !self.actions.contains(&tag) {
            self.actions.push(tag);
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn actions(&self) -> &[ActionTag] {
        &self.actions
    }

    pub fn has_action(&self, tag: ActionTag) -> bool {
        self.actions.contains(&tag)
    }
}

impl From<ErrorKind> for CredError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<pinhole_tree::TreeError> for CredError {
    fn from(e: pinhole_tree::TreeError) -> Self {
        match e {
            pinhole_tree::TreeError::LabelOutOfRange { .. } => ErrorKind::InvalidLabel.into(),
            _ => ErrorKind::HashTree.into(),
        }
    }
}

impl From<ElementError> for CredError {
    fn from(_: ElementError) -> Self {
        ErrorKind::HashTree.into()
    }
}

pub type Result<T> = std::result::Result<T, CredError>;
