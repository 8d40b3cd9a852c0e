//! Error taxonomy for tree operations and snapshot persistence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by tree, device, endpoint and view operations.
///
/// Every variant carries a human readable detail. Errors are local and
/// synchronous: the operation that detects them returns them and leaves the
/// tree untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Required field missing: {0}")]
    RequiredFieldMissing(String),
    #[error("Invalid type: {0}")]
    InvalidType(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Duplicate entity: {0}")]
    DuplicateEntity(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed patch: {0}")]
    MalformedPatch(String),
}

impl TreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TreeError::RequiredFieldMissing(_) => ErrorKind::RequiredFieldMissing,
            TreeError::InvalidType(_) => ErrorKind::InvalidType,
            TreeError::InvalidId(_) => ErrorKind::InvalidId,
            TreeError::DuplicateEntity(_) => ErrorKind::DuplicateEntity,
            TreeError::NotFound(_) => ErrorKind::NotFound,
            TreeError::MalformedPatch(_) => ErrorKind::MalformedPatch,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            TreeError::RequiredFieldMissing(d)
            | TreeError::InvalidType(d)
            | TreeError::InvalidId(d)
            | TreeError::DuplicateEntity(d)
            | TreeError::NotFound(d)
            | TreeError::MalformedPatch(d) => d,
        }
    }
}

/// Wire-level discriminant of [`TreeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RequiredFieldMissing,
    InvalidType,
    InvalidId,
    DuplicateEntity,
    NotFound,
    MalformedPatch,
}

/// `{kind, detail}` payload carried by the error channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&TreeError> for ErrorReport {
    fn from(e: &TreeError) -> Self {
        Self {
            kind: e.kind(),
            detail: e.detail().to_string(),
        }
    }
}

impl From<TreeError> for ErrorReport {
    fn from(e: TreeError) -> Self {
        ErrorReport::from(&e)
    }
}

/// Snapshot load/save failures.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Snapshot content rejected: {0}")]
    Tree(#[from] TreeError),
}
