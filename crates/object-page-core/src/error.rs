use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::commit::CommitReport;
use crate::store::StoreOp;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures reported by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{op} {type_tag} rejected: {message}")]
    Rejected {
        op: StoreOp,
        type_tag: String,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("decode: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {} field(s)", .0.len())]
    Validation(ValidationReport),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// The record itself was saved; some membership edges were not.
    #[error("saved, but {pending} membership edge(s) failed: {source}")]
    MembershipsPending {
        report: Box<CommitReport>,
        pending: usize,
        #[source]
        source: StoreError,
    },

    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    #[error("picker resolution: {0}")]
    PickerResolution(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown field {field} on {type_tag}")]
    UnknownField { type_tag: String, field: String },

    #[error("field {field} on {type_tag} is not an owned {expected}")]
    NotOwned {
        type_tag: String,
        field: String,
        expected: &'static str,
    },

    #[error("index {index} out of range for {field} ({len} element(s))")]
    IndexOutOfRange {
        field: String,
        index: usize,
        len: usize,
    },

    #[error("tab {index} out of range ({count} tab(s))")]
    InvalidTab { index: usize, count: usize },

    #[error("no active picker session")]
    NoActivePicker,

    #[error("command {command} on {field} is unavailable")]
    CommandUnavailable { field: String, command: String },

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("schema: {0}")]
    Schema(String),
}

/// Coarse classification surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Store,
    IdentityConflict,
    PickerResolution,
    Usage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Store(_) | Self::MembershipsPending { .. } => ErrorKind::Store,
            Self::IdentityConflict(_) => ErrorKind::IdentityConflict,
            Self::PickerResolution(_) => ErrorKind::PickerResolution,
            Self::UnknownModel(_)
            | Self::UnknownField { .. }
            | Self::NotOwned { .. }
            | Self::IndexOutOfRange { .. }
            | Self::InvalidTab { .. }
            | Self::NoActivePicker
            | Self::CommandUnavailable { .. }
            | Self::InvalidEntity(_)
            | Self::Schema(_) => ErrorKind::Usage,
        }
    }

    /// Store failures leave dirty state intact, so the same intent can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::MembershipsPending { .. })
    }

    /// Report of a commit that persisted the record before failing.
    pub fn saved_report(&self) -> Option<&CommitReport> {
        match self {
            Self::MembershipsPending { report, .. } => Some(report),
            _ => None,
        }
    }

    pub fn unknown_field(type_tag: &str, field: &str) -> Self {
        Self::UnknownField {
            type_tag: type_tag.to_string(),
            field: field.to_string(),
        }
    }
}

/// Per-field validation messages keyed by field path (`name`, `owned.val`, `items[0].name`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationReport {
    errors: BTreeMap<String, String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.insert(path.into(), message.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.errors.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.errors.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (path, message) in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{path}: {message}")?;
            first = false;
        }
        Ok(())
    }
}
